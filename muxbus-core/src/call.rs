use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::MessageCodec;
use crate::metadata::Metadata;
use crate::processor::StreamWriter;
use crate::status::{Result, Status};

/// A boxed lazy sequence, the shape of every streaming half.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Per-call knobs: an optional deadline and extra request metadata.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Duration>,
    pub metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> CallOptions {
        CallOptions::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> CallOptions {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> CallOptions {
        self.metadata = metadata;
        self
    }
}

/// A sequence of inbound messages for one call.
///
/// `message()` yields the next item, `Ok(None)` on clean completion, and
/// an error exactly once as the final item. On the caller side the
/// sequence enforces the call deadline and, when dropped before
/// completion, cancels the call on the wire.
pub struct Streaming<T> {
    rx: mpsc::Receiver<Result<T>>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
    done: bool,
}

impl<T> Streaming<T> {
    pub(crate) fn new(rx: mpsc::Receiver<Result<T>>) -> Streaming<T> {
        Streaming {
            rx,
            deadline: None,
            cancel: None,
            done: false,
        }
    }

    pub(crate) fn with_cancel(
        rx: mpsc::Receiver<Result<T>>,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Streaming<T> {
        Streaming {
            rx,
            deadline,
            cancel: Some(cancel),
            done: false,
        }
    }

    /// Await the next message.
    pub async fn message(&mut self) -> Result<Option<T>> {
        if self.done {
            return Ok(None);
        }
        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                self.done = true;
                // Prefer the pump's terminal status over buffered items.
                while let Ok(item) = self.rx.try_recv() {
                    if let Err(status) = item {
                        return Err(status);
                    }
                }
                return Err(Status::cancelled("call cancelled"));
            }
        }
        let item = match self.deadline {
            Some(at) => match tokio::time::timeout_at(at, self.rx.recv()).await {
                Ok(item) => item,
                Err(_) => {
                    self.done = true;
                    if let Some(cancel) = &self.cancel {
                        cancel.cancel();
                    }
                    return Err(Status::deadline_exceeded("call deadline expired"));
                }
            },
            None => self.rx.recv().await,
        };
        match item {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(status)) => {
                self.done = true;
                Err(status)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Cancel the call. On the caller side the cancellation goes out on
    /// the wire and the sequence ends with a CANCELLED error; on the
    /// handler side the sequence simply ends.
    pub fn cancel(&mut self) {
        match &self.cancel {
            Some(cancel) => cancel.cancel(),
            None => self.done = true,
        }
    }
}

impl<T> Drop for Streaming<T> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
        }
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Err(status))) => {
                self.done = true;
                Poll::Ready(Some(Err(status)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Await the single response of a unary-shaped exchange.
async fn recv_single<T>(responses: &mut Streaming<T>) -> Result<T> {
    let response = match responses.message().await? {
        Some(response) => response,
        None => return Err(Status::internal("call completed without a response")),
    };
    match responses.message().await? {
        None => Ok(response),
        Some(_) => Err(Status::internal("expected exactly one response")),
    }
}

/// One request, one response.
pub struct UnaryCall<ReqC: MessageCodec, RespC: MessageCodec> {
    pub(crate) writer: Arc<StreamWriter>,
    pub(crate) req_codec: Arc<ReqC>,
    pub(crate) responses: Streaming<RespC::Message>,
}

impl<ReqC: MessageCodec, RespC: MessageCodec> std::fmt::Debug for UnaryCall<ReqC, RespC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryCall").finish()
    }
}

impl<ReqC: MessageCodec, RespC: MessageCodec> UnaryCall<ReqC, RespC> {
    pub async fn call(mut self, request: ReqC::Message) -> Result<RespC::Message> {
        let encoded = self.req_codec.encode(&request)?;
        self.writer.send_message(encoded, true).await?;
        recv_single(&mut self.responses).await
    }
}

/// One request, a response sequence.
pub struct ServerStreamCall<ReqC: MessageCodec, RespC: MessageCodec> {
    pub(crate) writer: Arc<StreamWriter>,
    pub(crate) req_codec: Arc<ReqC>,
    pub(crate) responses: Streaming<RespC::Message>,
}

impl<ReqC: MessageCodec, RespC: MessageCodec> std::fmt::Debug for ServerStreamCall<ReqC, RespC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStreamCall").finish()
    }
}

impl<ReqC: MessageCodec, RespC: MessageCodec> ServerStreamCall<ReqC, RespC> {
    pub async fn call(self, request: ReqC::Message) -> Result<Streaming<RespC::Message>> {
        let ServerStreamCall {
            writer,
            req_codec,
            responses,
        } = self;
        let encoded = req_codec.encode(&request)?;
        writer.send_message(encoded, true).await?;
        Ok(responses)
    }
}

/// A request sequence, one response after `finish()`.
pub struct ClientStreamCall<ReqC: MessageCodec, RespC: MessageCodec> {
    pub(crate) writer: Arc<StreamWriter>,
    pub(crate) req_codec: Arc<ReqC>,
    pub(crate) responses: Streaming<RespC::Message>,
}

impl<ReqC: MessageCodec, RespC: MessageCodec> ClientStreamCall<ReqC, RespC> {
    pub async fn send(&self, request: &ReqC::Message) -> Result<()> {
        let encoded = self.req_codec.encode(request)?;
        self.writer.send_message(encoded, false).await
    }

    pub async fn finish(mut self) -> Result<RespC::Message> {
        self.writer.finish().await?;
        recv_single(&mut self.responses).await
    }
}

/// The sending half of a bidirectional call.
pub struct BidiSender<ReqC: MessageCodec> {
    pub(crate) writer: Arc<StreamWriter>,
    pub(crate) codec: Arc<ReqC>,
}

impl<ReqC: MessageCodec> Clone for BidiSender<ReqC> {
    fn clone(&self) -> Self {
        BidiSender {
            writer: Arc::clone(&self.writer),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<ReqC: MessageCodec> BidiSender<ReqC> {
    pub async fn send(&self, request: &ReqC::Message) -> Result<()> {
        let encoded = self.codec.encode(request)?;
        self.writer.send_message(encoded, false).await
    }

    /// Half-close: no more requests will follow.
    pub async fn finish(&self) -> Result<()> {
        self.writer.finish().await
    }
}

/// Independent request and response sequences over one stream.
pub struct BidiCall<ReqC: MessageCodec, RespC: MessageCodec> {
    pub(crate) sender: BidiSender<ReqC>,
    pub(crate) responses: Streaming<RespC::Message>,
}

impl<ReqC: MessageCodec, RespC: MessageCodec> BidiCall<ReqC, RespC> {
    pub async fn send(&self, request: &ReqC::Message) -> Result<()> {
        self.sender.send(request).await
    }

    pub async fn finish_sending(&self) -> Result<()> {
        self.sender.finish().await
    }

    pub async fn message(&mut self) -> Result<Option<RespC::Message>> {
        self.responses.message().await
    }

    pub fn cancel(&mut self) {
        self.responses.cancel();
    }

    /// Split for concurrent sending and receiving from separate tasks.
    pub fn into_parts(self) -> (BidiSender<ReqC>, Streaming<RespC::Message>) {
        (self.sender, self.responses)
    }
}
