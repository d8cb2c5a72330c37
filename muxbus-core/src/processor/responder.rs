use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::call::{BoxStream, Streaming};
use crate::codec::MessageCodec;
use crate::framing::FrameDecoder;
use crate::metadata::Metadata;
use crate::processor::{decode_payload, sleep_until_deadline, ResponderContext, StreamWriter};
use crate::status::{Result, Status};
use crate::transport::IncomingRecord;

const REQUEST_BUFFER: usize = 32;

/// Turn the raw record feed of one inbound stream into a typed request
/// sequence.
///
/// The pump owns the frame parser and the request codec. A decode or
/// framing failure closes the call with the failing status; a peer cancel
/// signal (status-bearing metadata) answers with a CANCELLED trailer and
/// silently discards whatever else was in flight.
pub(crate) fn spawn_request_pump<C>(
    mut records: mpsc::Receiver<IncomingRecord>,
    codec: Arc<C>,
    writer: Arc<StreamWriter>,
    cancel: CancellationToken,
    max_message_size: usize,
) -> Streaming<C::Message>
where
    C: MessageCodec,
{
    let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_max_message_size(max_message_size);
        // After the half-close the request sequence ends, but the pump
        // keeps watching the stream for a late cancel signal until the
        // runner finishes and the endpoint drops the record feed.
        let mut tx = Some(tx);
        'pump: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'pump,
                record = records.recv() => {
                    let Some(record) = record else {
                        if let Some(tx) = &tx {
                            let _ = tx.send(Err(Status::unavailable("transport closed mid-call"))).await;
                            cancel.cancel();
                        }
                        break 'pump;
                    };
                    if let Some(peer_status) = record.metadata.as_ref().and_then(|md| md.status()) {
                        debug!(
                            stream_id = record.stream_id,
                            code = %peer_status.code(),
                            "peer cancelled stream"
                        );
                        let _ = writer
                            .send_trailer(&Status::cancelled("call cancelled by peer"))
                            .await;
                        cancel.cancel();
                        break 'pump;
                    }
                    if let Some(payload) = &record.payload {
                        match decode_payload(&mut decoder, codec.as_ref(), payload) {
                            Ok(requests) => {
                                if let Some(tx) = &tx {
                                    for request in requests {
                                        let _ = tx.send(Ok(request)).await;
                                    }
                                }
                            }
                            Err(status) => {
                                let _ = writer.send_trailer(&status).await;
                                if let Some(tx) = &tx {
                                    let _ = tx.send(Err(status)).await;
                                }
                                cancel.cancel();
                                break 'pump;
                            }
                        }
                    }
                    if record.end_of_stream {
                        // Close the request sequence; keep listening.
                        tx.take();
                    }
                }
            }
        }
    });
    Streaming::new(rx)
}

/// Await the stream's single request and its half-close.
///
/// Returns None once the call is already settled (trailer sent or pump
/// aborted); the caller just returns in that case.
async fn single_request<T>(
    requests: &mut Streaming<T>,
    writer: &StreamWriter,
    cancel: &CancellationToken,
) -> Option<T> {
    let first = match requests.message().await {
        Ok(Some(request)) => request,
        Ok(None) => {
            if cancel.is_cancelled() {
                let _ = writer
                    .send_trailer(&Status::unavailable("endpoint closed"))
                    .await;
            } else {
                let _ = writer
                    .send_trailer(&Status::invalid_argument(
                        "call ended before a request arrived",
                    ))
                    .await;
                cancel.cancel();
            }
            return None;
        }
        Err(_) => return None,
    };
    match requests.message().await {
        Ok(None) => Some(first),
        Ok(Some(_)) => {
            let _ = writer
                .send_trailer(&Status::invalid_argument("expected exactly one request"))
                .await;
            cancel.cancel();
            None
        }
        Err(_) => None,
    }
}

/// Send one response followed by an OK trailer.
async fn send_single_response<C: MessageCodec>(
    codec: &C,
    writer: &StreamWriter,
    response: &C::Message,
) {
    match codec.encode(response) {
        Ok(encoded) => {
            if writer.send_message(encoded, false).await.is_ok() {
                let _ = writer.send_trailer(&Status::ok()).await;
            }
        }
        Err(status) => {
            let _ = writer.send_trailer(&status).await;
        }
    }
}

/// Drain a handler's response stream to the wire, then terminate.
///
/// The trailer is OK iff the stream completes; a stream error carries its
/// status onto the trailer.
async fn forward_response_stream<C: MessageCodec>(
    mut stream: BoxStream<C::Message>,
    codec: Arc<C>,
    writer: Arc<StreamWriter>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
) {
    let deadline_fired = sleep_until_deadline(deadline);
    tokio::pin!(deadline_fired);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.send_trailer(&Status::unavailable("endpoint closed")).await;
                return;
            }
            _ = &mut deadline_fired => {
                let _ = writer.send_trailer(&Status::cancelled("deadline exceeded")).await;
                cancel.cancel();
                return;
            }
            item = stream.next() => match item {
                Some(Ok(response)) => {
                    let encoded = match codec.encode(&response) {
                        Ok(encoded) => encoded,
                        Err(status) => {
                            let _ = writer.send_trailer(&status).await;
                            return;
                        }
                    };
                    if writer.send_message(encoded, false).await.is_err() {
                        return;
                    }
                }
                Some(Err(status)) => {
                    let _ = writer.send_trailer(&status).await;
                    return;
                }
                None => {
                    let _ = writer.send_trailer(&Status::ok()).await;
                    return;
                }
            }
        }
    }
}

/// Unary: exactly one request, exactly one response, OK trailer.
pub(crate) async fn run_unary<ReqC, RespC, H, Fut>(
    ctx: ResponderContext,
    req_codec: Arc<ReqC>,
    resp_codec: Arc<RespC>,
    handler: Arc<H>,
) where
    ReqC: MessageCodec,
    RespC: MessageCodec,
    H: Fn(ReqC::Message, Metadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RespC::Message>> + Send + 'static,
{
    let ResponderContext {
        headers,
        records,
        writer,
        cancel,
        max_message_size,
        ..
    } = ctx;
    let deadline = headers.timeout().map(|t| Instant::now() + t);
    let mut requests =
        spawn_request_pump(records, req_codec, writer.clone(), cancel.clone(), max_message_size);

    let Some(request) = single_request(&mut requests, &writer, &cancel).await else {
        return;
    };

    let deadline_fired = sleep_until_deadline(deadline);
    tokio::pin!(deadline_fired);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = writer.send_trailer(&Status::unavailable("endpoint closed")).await;
            return;
        }
        _ = &mut deadline_fired => {
            let _ = writer.send_trailer(&Status::cancelled("deadline exceeded")).await;
            cancel.cancel();
            return;
        }
        outcome = handler(request, headers) => outcome,
    };
    match outcome {
        Ok(response) => send_single_response(resp_codec.as_ref(), &writer, &response).await,
        Err(status) => {
            let _ = writer.send_trailer(&status).await;
        }
    }
}

/// Server-stream: one request in, an arbitrary response sequence out.
pub(crate) async fn run_server_stream<ReqC, RespC, H, Fut>(
    ctx: ResponderContext,
    req_codec: Arc<ReqC>,
    resp_codec: Arc<RespC>,
    handler: Arc<H>,
) where
    ReqC: MessageCodec,
    RespC: MessageCodec,
    H: Fn(ReqC::Message, Metadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<RespC::Message>>> + Send + 'static,
{
    let ResponderContext {
        headers,
        records,
        writer,
        cancel,
        max_message_size,
        ..
    } = ctx;
    let deadline = headers.timeout().map(|t| Instant::now() + t);
    let mut requests =
        spawn_request_pump(records, req_codec, writer.clone(), cancel.clone(), max_message_size);

    let Some(request) = single_request(&mut requests, &writer, &cancel).await else {
        return;
    };

    let deadline_fired = sleep_until_deadline(deadline);
    tokio::pin!(deadline_fired);
    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = writer.send_trailer(&Status::unavailable("endpoint closed")).await;
            return;
        }
        _ = &mut deadline_fired => {
            let _ = writer.send_trailer(&Status::cancelled("deadline exceeded")).await;
            cancel.cancel();
            return;
        }
        outcome = handler(request, headers) => match outcome {
            Ok(stream) => stream,
            Err(status) => {
                let _ = writer.send_trailer(&status).await;
                return;
            }
        },
    };
    forward_response_stream(stream, resp_codec, writer, cancel, deadline).await;
}

/// Client-stream: any number of requests, one response after half-close.
pub(crate) async fn run_client_stream<ReqC, RespC, H, Fut>(
    ctx: ResponderContext,
    req_codec: Arc<ReqC>,
    resp_codec: Arc<RespC>,
    handler: Arc<H>,
) where
    ReqC: MessageCodec,
    RespC: MessageCodec,
    H: Fn(Streaming<ReqC::Message>, Metadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RespC::Message>> + Send + 'static,
{
    let ResponderContext {
        headers,
        records,
        writer,
        cancel,
        max_message_size,
        ..
    } = ctx;
    let deadline = headers.timeout().map(|t| Instant::now() + t);
    let requests =
        spawn_request_pump(records, req_codec, writer.clone(), cancel.clone(), max_message_size);

    let deadline_fired = sleep_until_deadline(deadline);
    tokio::pin!(deadline_fired);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = writer.send_trailer(&Status::unavailable("endpoint closed")).await;
            return;
        }
        _ = &mut deadline_fired => {
            let _ = writer.send_trailer(&Status::cancelled("deadline exceeded")).await;
            cancel.cancel();
            return;
        }
        outcome = handler(requests, headers) => outcome,
    };
    match outcome {
        Ok(response) => send_single_response(resp_codec.as_ref(), &writer, &response).await,
        Err(status) => {
            let _ = writer.send_trailer(&status).await;
        }
    }
}

/// Bidirectional: both halves flow independently; the trailer follows the
/// completion of the handler's output.
pub(crate) async fn run_bidi<ReqC, RespC, H, Fut>(
    ctx: ResponderContext,
    req_codec: Arc<ReqC>,
    resp_codec: Arc<RespC>,
    handler: Arc<H>,
) where
    ReqC: MessageCodec,
    RespC: MessageCodec,
    H: Fn(Streaming<ReqC::Message>, Metadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<RespC::Message>>> + Send + 'static,
{
    let ResponderContext {
        headers,
        records,
        writer,
        cancel,
        max_message_size,
        ..
    } = ctx;
    let deadline = headers.timeout().map(|t| Instant::now() + t);
    let requests =
        spawn_request_pump(records, req_codec, writer.clone(), cancel.clone(), max_message_size);

    let deadline_fired = sleep_until_deadline(deadline);
    tokio::pin!(deadline_fired);
    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = writer.send_trailer(&Status::unavailable("endpoint closed")).await;
            return;
        }
        _ = &mut deadline_fired => {
            let _ = writer.send_trailer(&Status::cancelled("deadline exceeded")).await;
            cancel.cancel();
            return;
        }
        outcome = handler(requests, headers) => match outcome {
            Ok(stream) => stream,
            Err(status) => {
                let _ = writer.send_trailer(&status).await;
                return;
            }
        },
    };
    forward_response_stream(stream, resp_codec, writer, cancel, deadline).await;
}
