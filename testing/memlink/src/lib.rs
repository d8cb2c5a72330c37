//! In-process transport pair backed by tokio channels.
//!
//! Every record sent on one half surfaces in the peer half's incoming
//! feed, with per-stream order preserved by the channel. Used by the
//! muxbus test suites; real deployments plug in a wire transport instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use muxbus_core::metadata::Metadata;
use muxbus_core::status::{Result, Status};
use muxbus_core::transport::{IncomingRecord, IncomingRecords, Transport};

const LINK_BUFFER: usize = 64;

/// One half of a connected in-process link.
pub struct MemTransport {
    outbound: Mutex<Option<mpsc::Sender<IncomingRecord>>>,
    inbound: Mutex<Option<mpsc::Receiver<IncomingRecord>>>,
    next_stream_id: AtomicU64,
    closed: AtomicBool,
}

/// A connected transport pair: `(initiator, acceptor)`.
///
/// The initiator half allocates odd stream ids; the acceptor half holds
/// the even range reserved for server-assigned streams.
pub fn pair() -> (Arc<MemTransport>, Arc<MemTransport>) {
    let (to_acceptor, from_initiator) = mpsc::channel(LINK_BUFFER);
    let (to_initiator, from_acceptor) = mpsc::channel(LINK_BUFFER);
    let initiator = Arc::new(MemTransport::new(to_acceptor, from_acceptor, 1));
    let acceptor = Arc::new(MemTransport::new(to_initiator, from_initiator, 2));
    (initiator, acceptor)
}

impl MemTransport {
    fn new(
        outbound: mpsc::Sender<IncomingRecord>,
        inbound: mpsc::Receiver<IncomingRecord>,
        first_stream_id: u64,
    ) -> MemTransport {
        MemTransport {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            next_stream_id: AtomicU64::new(first_stream_id),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<IncomingRecord>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("transport is closed"));
        }
        self.outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Status::unavailable("transport is closed"))
    }

    async fn deliver(&self, record: IncomingRecord) -> Result<()> {
        let sender = self.sender()?;
        sender
            .send(record)
            .await
            .map_err(|_| Status::unavailable("peer transport is closed"))
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn create_stream(&self) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("transport is closed"));
        }
        Ok(self.next_stream_id.fetch_add(2, Ordering::SeqCst))
    }

    async fn send_metadata(
        &self,
        stream_id: u64,
        metadata: Metadata,
        end_of_stream: bool,
    ) -> Result<()> {
        self.deliver(IncomingRecord::headers(stream_id, metadata, end_of_stream))
            .await
    }

    async fn send_message(
        &self,
        stream_id: u64,
        payload: Bytes,
        end_of_stream: bool,
    ) -> Result<()> {
        self.deliver(IncomingRecord::message(stream_id, payload, end_of_stream))
            .await
    }

    async fn finish_sending(&self, stream_id: u64) -> Result<()> {
        self.deliver(IncomingRecord::end(stream_id)).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound.lock().unwrap().take();
        self.inbound.lock().unwrap().take();
        Ok(())
    }

    fn incoming(&self) -> IncomingRecords {
        match self.inbound.lock().unwrap().take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(tokio_stream::empty()),
        }
    }
}

/// Dials new links into a [`MemAcceptor`].
#[derive(Clone)]
pub struct MemConnector {
    tx: mpsc::Sender<Arc<MemTransport>>,
}

/// Receives the acceptor halves of dialed links.
pub struct MemAcceptor {
    rx: tokio::sync::Mutex<mpsc::Receiver<Arc<MemTransport>>>,
}

/// An in-process listener: connectors dial, the acceptor accepts.
pub fn hub() -> (MemConnector, MemAcceptor) {
    let (tx, rx) = mpsc::channel(16);
    (
        MemConnector { tx },
        MemAcceptor {
            rx: tokio::sync::Mutex::new(rx),
        },
    )
}

impl MemConnector {
    pub async fn connect(&self) -> Result<Arc<MemTransport>> {
        let (initiator, acceptor) = pair();
        self.tx
            .send(acceptor)
            .await
            .map_err(|_| Status::unavailable("listener is closed"))?;
        Ok(initiator)
    }
}

impl MemAcceptor {
    pub async fn accept(&self) -> Result<Arc<MemTransport>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Status::unavailable("all connectors are gone"))
    }
}
