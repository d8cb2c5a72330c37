//! Per-call state machines.
//!
//! Both sides of a call share one outgoing discipline, `StreamWriter`:
//! initial headers go out lazily before the first frame, writes from any
//! task are serialised, and termination (trailer, half-close, cancel) is
//! idempotent. The inbound halves live in `responder` and `caller`.

mod caller;
mod responder;
mod writer;

pub(crate) use caller::spawn_response_pump;
pub(crate) use responder::{
    run_bidi, run_client_stream, run_server_stream, run_unary, spawn_request_pump,
};
pub(crate) use writer::StreamWriter;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;
use crate::transport::IncomingRecord;

/// Everything a responder-side runner needs for one inbound stream.
pub(crate) struct ResponderContext {
    pub stream_id: u64,
    /// Request headers from the stream's first record (may be empty when
    /// the transport bundles headers with the first data frame).
    pub headers: Metadata,
    /// The filtered record feed for this stream.
    pub records: mpsc::Receiver<IncomingRecord>,
    pub writer: std::sync::Arc<StreamWriter>,
    pub cancel: CancellationToken,
    pub max_message_size: usize,
}

/// Resolves when the optional deadline fires; pends forever without one.
pub(crate) async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Decode every message completed by one inbound chunk.
pub(crate) fn decode_payload<C: crate::codec::MessageCodec>(
    decoder: &mut crate::framing::FrameDecoder,
    codec: &C,
    chunk: &[u8],
) -> crate::status::Result<Vec<C::Message>> {
    let mut messages = Vec::new();
    for payload in decoder.push(chunk)? {
        messages.push(codec.decode(payload)?);
    }
    Ok(messages)
}
