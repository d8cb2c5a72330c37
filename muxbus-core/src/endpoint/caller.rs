use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::call::{
    BidiCall, BidiSender, CallOptions, ClientStreamCall, ServerStreamCall, Streaming, UnaryCall,
};
use crate::codec::MessageCodec;
use crate::endpoint::EndpointConfig;
use crate::metadata::Metadata;
use crate::processor::{spawn_response_pump, StreamWriter};
use crate::service::CallKind;
use crate::status::{Result, Status};
use crate::transport::{IncomingRecord, Transport};

/// The call-originating side of a transport.
///
/// One builder per call shape; each validates the method (when validation
/// is on), allocates a stream, sends initial metadata, and hands back the
/// shape's façade. Method registration here is advisory only - the wire
/// contract is carried end to end by the path and the codecs.
pub struct CallerEndpoint {
    transport: Arc<dyn Transport>,
    config: EndpointConfig,
    streams: Arc<Mutex<HashMap<u64, mpsc::Sender<IncomingRecord>>>>,
    registered: Mutex<HashMap<String, CallKind>>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl CallerEndpoint {
    pub fn new(transport: Arc<dyn Transport>) -> CallerEndpoint {
        CallerEndpoint::with_config(transport, EndpointConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: EndpointConfig) -> CallerEndpoint {
        let endpoint = CallerEndpoint {
            transport,
            config,
            streams: Arc::new(Mutex::new(HashMap::new())),
            registered: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        endpoint.spawn_demux();
        endpoint
    }

    fn spawn_demux(&self) {
        let mut feed = self.transport.incoming();
        let streams = Arc::clone(&self.streams);
        let cancel = self.cancel.clone();
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
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
                            let tx = streams.lock().unwrap().get(&record.stream_id).cloned();
                            match tx {
                                Some(tx) => {
                                    let _ = tx.send(record).await;
                                }
                                None => {
                                    trace!(stream_id = record.stream_id, "record for unknown call dropped");
                                }
                            }
                        }
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            streams.lock().unwrap().clear();
        });
    }

    /// Advisory registration enabling `validate_methods`.
    pub fn register_method(&self, service: &str, method: &str, kind: CallKind) {
        self.registered
            .lock()
            .unwrap()
            .insert(format!("/{service}/{method}"), kind);
    }

    async fn start_call(
        &self,
        service: &str,
        method: &str,
        kind: CallKind,
        options: &CallOptions,
    ) -> Result<(
        Arc<StreamWriter>,
        mpsc::Receiver<IncomingRecord>,
        CancellationToken,
        Option<Instant>,
    )> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("endpoint is closed"));
        }
        if self.config.validate_methods {
            let path = format!("/{service}/{method}");
            match self.registered.lock().unwrap().get(&path) {
                Some(registered) if *registered == kind => {}
                Some(_) => {
                    return Err(Status::invalid_argument(format!(
                        "method {path} is registered with a different call shape"
                    )))
                }
                None => {
                    return Err(Status::invalid_argument(format!(
                        "method {path} is not registered"
                    )))
                }
            }
        }

        // A dead deadline fails before anything touches the wire.
        let deadline = match options.deadline {
            Some(timeout) if timeout.is_zero() => {
                return Err(Status::deadline_exceeded("deadline already expired"))
            }
            Some(timeout) => Some(Instant::now() + timeout),
            None => None,
        };

        let stream_id = self.transport.create_stream().await?;
        let mut headers = Metadata::for_request(service, method);
        for (name, value) in options.metadata.iter() {
            headers.append(name, value);
        }
        if let Some(timeout) = options.deadline {
            headers.set_timeout(timeout);
        }

        let writer = Arc::new(StreamWriter::new(
            Arc::clone(&self.transport),
            stream_id,
            headers,
        ));
        writer.send_headers().await?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        self.streams.lock().unwrap().insert(stream_id, tx);

        Ok((writer, rx, self.cancel.child_token(), deadline))
    }

    pub async fn unary<ReqC, RespC>(
        &self,
        service: &str,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        options: CallOptions,
    ) -> Result<UnaryCall<ReqC, RespC>>
    where
        ReqC: MessageCodec,
        RespC: MessageCodec,
    {
        let (writer, records, cancel, deadline) = self
            .start_call(service, method, CallKind::Unary, &options)
            .await?;
        let rx = spawn_response_pump(
            records,
            Arc::new(resp_codec),
            Arc::clone(&writer),
            cancel.clone(),
            self.config.max_message_size,
            Arc::clone(&self.streams),
            Arc::clone(&self.closed),
        );
        Ok(UnaryCall {
            writer,
            req_codec: Arc::new(req_codec),
            responses: Streaming::with_cancel(rx, deadline, cancel),
        })
    }

    pub async fn server_stream<ReqC, RespC>(
        &self,
        service: &str,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        options: CallOptions,
    ) -> Result<ServerStreamCall<ReqC, RespC>>
    where
        ReqC: MessageCodec,
        RespC: MessageCodec,
    {
        let (writer, records, cancel, deadline) = self
            .start_call(service, method, CallKind::ServerStream, &options)
            .await?;
        let rx = spawn_response_pump(
            records,
            Arc::new(resp_codec),
            Arc::clone(&writer),
            cancel.clone(),
            self.config.max_message_size,
            Arc::clone(&self.streams),
            Arc::clone(&self.closed),
        );
        Ok(ServerStreamCall {
            writer,
            req_codec: Arc::new(req_codec),
            responses: Streaming::with_cancel(rx, deadline, cancel),
        })
    }

    pub async fn client_stream<ReqC, RespC>(
        &self,
        service: &str,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        options: CallOptions,
    ) -> Result<ClientStreamCall<ReqC, RespC>>
    where
        ReqC: MessageCodec,
        RespC: MessageCodec,
    {
        let (writer, records, cancel, deadline) = self
            .start_call(service, method, CallKind::ClientStream, &options)
            .await?;
        let rx = spawn_response_pump(
            records,
            Arc::new(resp_codec),
            Arc::clone(&writer),
            cancel.clone(),
            self.config.max_message_size,
            Arc::clone(&self.streams),
            Arc::clone(&self.closed),
        );
        Ok(ClientStreamCall {
            writer,
            req_codec: Arc::new(req_codec),
            responses: Streaming::with_cancel(rx, deadline, cancel),
        })
    }

    pub async fn bidi<ReqC, RespC>(
        &self,
        service: &str,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        options: CallOptions,
    ) -> Result<BidiCall<ReqC, RespC>>
    where
        ReqC: MessageCodec,
        RespC: MessageCodec,
    {
        let (writer, records, cancel, deadline) = self
            .start_call(service, method, CallKind::Bidi, &options)
            .await?;
        let rx = spawn_response_pump(
            records,
            Arc::new(resp_codec),
            Arc::clone(&writer),
            cancel.clone(),
            self.config.max_message_size,
            Arc::clone(&self.streams),
            Arc::clone(&self.closed),
        );
        Ok(BidiCall {
            sender: BidiSender {
                writer,
                codec: Arc::new(req_codec),
            },
            responses: Streaming::with_cancel(rx, deadline, cancel),
        })
    }

    /// Cancel all in-flight calls, wait out the drain window, close the
    /// transport. Subsequent calls fail with UNAVAILABLE. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let deadline = Instant::now() + self.config.drain_window;
        while !self.streams.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = self.transport.close().await;
    }
}
