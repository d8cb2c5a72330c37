use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::endpoint::EndpointConfig;
use crate::metadata::Metadata;
use crate::processor::{ResponderContext, StreamWriter};
use crate::service::{MethodEntry, MethodRegistrar, ServiceContract};
use crate::status::{Result, Status};
use crate::transport::{IncomingRecord, IncomingRecords, Transport};

/// The serving side of a transport.
///
/// Routes every incoming record by stream id. A record for an unseen
/// stream either spawns the registered method's responder processor or is
/// answered with an UNIMPLEMENTED trailer.
pub struct ResponderEndpoint {
    transport: Arc<dyn Transport>,
    config: EndpointConfig,
    methods: Arc<Mutex<HashMap<String, MethodEntry>>>,
    streams: Arc<Mutex<HashMap<u64, mpsc::Sender<IncomingRecord>>>>,
    live_calls: Arc<AtomicUsize>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl ResponderEndpoint {
    pub fn new(transport: Arc<dyn Transport>) -> ResponderEndpoint {
        ResponderEndpoint::with_config(transport, EndpointConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: EndpointConfig) -> ResponderEndpoint {
        ResponderEndpoint {
            transport,
            config,
            methods: Arc::new(Mutex::new(HashMap::new())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            live_calls: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a service contract; must happen before `start()`.
    pub fn add_service(&self, contract: &dyn ServiceContract) {
        let mut table = self.methods.lock().unwrap();
        let mut registrar = MethodRegistrar::new(contract.service_name(), &mut table);
        contract.setup(&mut registrar);
    }

    /// Subscribe to the transport feed and begin dispatching.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Status::failed_precondition("endpoint already started"));
        }
        let feed = self.transport.incoming();
        tokio::spawn(demux(
            feed,
            Arc::clone(&self.transport),
            Arc::clone(&self.methods),
            Arc::clone(&self.streams),
            Arc::clone(&self.live_calls),
            self.cancel.clone(),
            Arc::clone(&self.closed),
            self.config.clone(),
        ));
        Ok(())
    }

    /// Cancel all live processors, wait out the drain window, close the
    /// transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.config.drain_window;
        while self.live_calls.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = self.transport.close().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn demux(
    mut feed: IncomingRecords,
    transport: Arc<dyn Transport>,
    methods: Arc<Mutex<HashMap<String, MethodEntry>>>,
    streams: Arc<Mutex<HashMap<u64, mpsc::Sender<IncomingRecord>>>>,
    live_calls: Arc<AtomicUsize>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    config: EndpointConfig,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = feed.next() => match item {
                None => break,
                Some(Err(status)) => {
                    warn!(%status, "transport feed failed");
                    break;
                }
                Some(Ok(record)) => {
                    handle_record(
                        record,
                        &transport,
                        &methods,
                        &streams,
                        &live_calls,
                        &cancel,
                        &config,
                    )
                    .await;
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    streams.lock().unwrap().clear();
}

async fn handle_record(
    record: IncomingRecord,
    transport: &Arc<dyn Transport>,
    methods: &Arc<Mutex<HashMap<String, MethodEntry>>>,
    streams: &Arc<Mutex<HashMap<u64, mpsc::Sender<IncomingRecord>>>>,
    live_calls: &Arc<AtomicUsize>,
    cancel: &CancellationToken,
    config: &EndpointConfig,
) {
    let stream_id = record.stream_id;

    // The entry stays until the runner completes: a half-closed stream
    // still accepts the peer's cancel signal.
    let existing = streams.lock().unwrap().get(&stream_id).cloned();
    if let Some(tx) = existing {
        if tx.send(record).await.is_err() {
            trace!(stream_id, "record for settled call dropped");
        }
        return;
    }

    let Some(path) = record.method_path().map(str::to_string) else {
        trace!(stream_id, "record for unknown stream dropped");
        return;
    };

    let entry = methods.lock().unwrap().get(&path).cloned();
    let Some(entry) = entry else {
        debug!(stream_id, %path, "call to unknown method");
        let writer = StreamWriter::new(Arc::clone(transport), stream_id, Metadata::new());
        tokio::spawn(async move {
            let _ = writer
                .send_trailer(&Status::unimplemented(format!("unknown method {path}")))
                .await;
        });
        return;
    };

    let headers = record.metadata.clone().unwrap_or_default();
    let end_of_stream = record.end_of_stream;
    let (tx, rx) = mpsc::channel(config.stream_buffer);
    // Capacity is at least 1, so buffering the opening record cannot fail.
    let _ = tx.send(record).await;
    if !end_of_stream {
        streams.lock().unwrap().insert(stream_id, tx);
    }

    let ctx = ResponderContext {
        stream_id,
        headers,
        records: rx,
        writer: Arc::new(StreamWriter::new(
            Arc::clone(transport),
            stream_id,
            Metadata::new(),
        )),
        cancel: cancel.child_token(),
        max_message_size: config.max_message_size,
    };

    live_calls.fetch_add(1, Ordering::SeqCst);
    let live_calls = Arc::clone(live_calls);
    let streams = Arc::clone(streams);
    let runner = entry.runner;
    tokio::spawn(async move {
        runner(ctx).await;
        streams.lock().unwrap().remove(&stream_id);
        live_calls.fetch_sub(1, Ordering::SeqCst);
    });
}
