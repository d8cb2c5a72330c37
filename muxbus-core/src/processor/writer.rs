use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::framing::encode_frame;
use crate::metadata::Metadata;
use crate::status::{Result, Status};
use crate::transport::Transport;

/// The serialised outgoing half of one stream.
///
/// Writes may come from any task; the internal mutex drains in-flight
/// writes before a termination frame goes out. Initial headers are sent
/// exactly once, before whatever goes out first. After a trailer or a
/// cancel, later termination calls are no-ops and later writes fail.
pub(crate) struct StreamWriter {
    transport: Arc<dyn Transport>,
    stream_id: u64,
    state: Mutex<WriterState>,
}

struct WriterState {
    initial: Option<Metadata>,
    trailer_sent: bool,
    finished: bool,
    cancelled: bool,
}

impl StreamWriter {
    pub fn new(transport: Arc<dyn Transport>, stream_id: u64, initial: Metadata) -> StreamWriter {
        StreamWriter {
            transport,
            stream_id,
            state: Mutex::new(WriterState {
                initial: Some(initial),
                trailer_sent: false,
                finished: false,
                cancelled: false,
            }),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Send the initial headers now instead of before the first frame.
    pub async fn send_headers(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_headers(&mut state).await
    }

    async fn flush_headers(&self, state: &mut WriterState) -> Result<()> {
        if let Some(metadata) = state.initial.take() {
            self.transport
                .send_metadata(self.stream_id, metadata, false)
                .await?;
        }
        Ok(())
    }

    /// Frame and send one message.
    pub async fn send_message(&self, message: Bytes, end_of_stream: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancelled {
            return Err(Status::cancelled("call is cancelled"));
        }
        if state.trailer_sent || state.finished {
            return Err(Status::failed_precondition("sending side is closed"));
        }
        self.flush_headers(&mut state).await?;
        self.transport
            .send_message(self.stream_id, encode_frame(&message), end_of_stream)
            .await?;
        if end_of_stream {
            state.finished = true;
        }
        Ok(())
    }

    /// Responder-side termination: the one trailer that closes the stream.
    pub async fn send_trailer(&self, status: &Status) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.trailer_sent {
            return Ok(());
        }
        state.trailer_sent = true;
        self.flush_headers(&mut state).await?;
        let trailer = Metadata::for_trailer(status.code(), Some(status.message()));
        self.transport
            .send_metadata(self.stream_id, trailer, true)
            .await
    }

    /// Caller-side half-close: no more requests will be sent.
    pub async fn finish(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancelled {
            return Err(Status::cancelled("call is cancelled"));
        }
        if state.finished || state.trailer_sent {
            return Ok(());
        }
        self.flush_headers(&mut state).await?;
        self.transport.finish_sending(self.stream_id).await?;
        state.finished = true;
        Ok(())
    }

    /// Caller-side cancellation signal: a status-bearing metadata frame
    /// with end-of-stream set. Valid even after a half-close (it acts as
    /// the stream reset), a no-op once the exchange is over.
    pub async fn send_cancel(&self, status: &Status) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancelled || state.trailer_sent {
            return Ok(());
        }
        state.cancelled = true;
        self.flush_headers(&mut state).await?;
        let signal = Metadata::for_trailer(status.code(), Some(status.message()));
        self.transport
            .send_metadata(self.stream_id, signal, true)
            .await
    }
}
