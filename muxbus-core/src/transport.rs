use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use tokio_stream::StreamExt;

use crate::metadata::Metadata;
use crate::status::Result;

/// One record from a transport's unified incoming feed.
///
/// Records for different streams interleave arbitrarily; per-stream order
/// is the transport's responsibility. The method path of a new inbound
/// stream travels as the `:path` entry of the record's metadata.
#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub stream_id: u64,
    pub metadata: Option<Metadata>,
    pub payload: Option<Bytes>,
    pub end_of_stream: bool,
}

impl IncomingRecord {
    pub fn headers(stream_id: u64, metadata: Metadata, end_of_stream: bool) -> IncomingRecord {
        IncomingRecord {
            stream_id,
            metadata: Some(metadata),
            payload: None,
            end_of_stream,
        }
    }

    pub fn message(stream_id: u64, payload: Bytes, end_of_stream: bool) -> IncomingRecord {
        IncomingRecord {
            stream_id,
            metadata: None,
            payload: Some(payload),
            end_of_stream,
        }
    }

    /// A bare end-of-stream marker with no metadata or payload.
    pub fn end(stream_id: u64) -> IncomingRecord {
        IncomingRecord {
            stream_id,
            metadata: None,
            payload: None,
            end_of_stream: true,
        }
    }

    /// The `/Service/Method` path, when this record opens a stream.
    pub fn method_path(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|md| md.path())
    }
}

/// The incoming feed: finite, non-restartable, errors terminate it.
pub type IncomingRecords = Pin<Box<dyn Stream<Item = Result<IncomingRecord>> + Send>>;

/// A multiplexing byte transport beneath the call layer.
///
/// Implementations must accept sends from multiple producer tasks and
/// preserve per-stream ordering. A send that cannot proceed because the
/// peer is not ready must await rather than spin or fail. Once the
/// transport is closed every send fails with UNAVAILABLE.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Allocate a fresh initiator-side stream id (odd).
    async fn create_stream(&self) -> Result<u64>;

    /// Send a metadata frame (headers or trailer) on a stream.
    async fn send_metadata(
        &self,
        stream_id: u64,
        metadata: Metadata,
        end_of_stream: bool,
    ) -> Result<()>;

    /// Send a data frame on a stream.
    async fn send_message(&self, stream_id: u64, payload: Bytes, end_of_stream: bool)
        -> Result<()>;

    /// Half-close the sending side of a stream.
    async fn finish_sending(&self, stream_id: u64) -> Result<()>;

    /// Close the transport; terminates the peer's incoming feed.
    async fn close(&self) -> Result<()>;

    /// Take the unified incoming feed.
    ///
    /// May be consumed once; implementations return an already-terminated
    /// feed on subsequent calls.
    fn incoming(&self) -> IncomingRecords;
}

/// Restrict a feed to the records of one stream. Feed-level errors are
/// passed through since they affect every stream.
pub fn messages_for(feed: IncomingRecords, stream_id: u64) -> IncomingRecords {
    Box::pin(feed.filter(move |item| match item {
        Ok(record) => record.stream_id == stream_id,
        Err(_) => true,
    }))
}
