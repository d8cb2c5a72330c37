use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::codec::MessageCodec;
use crate::framing::FrameDecoder;
use crate::processor::{decode_payload, StreamWriter};
use crate::status::{Result, Status};
use crate::transport::IncomingRecord;

const RESPONSE_BUFFER: usize = 32;

/// Turn the record feed of one outbound call into a typed response
/// sequence.
///
/// A trailer ends the sequence: OK terminates it cleanly, any other code
/// arrives as the final error item. A feed that dies before the trailer
/// surfaces UNAVAILABLE. Cancellation (deadline, explicit cancel, or the
/// owner abandoning the call) sends the cancel signal on the wire and
/// stops reading; responses still in flight are discarded.
pub(crate) fn spawn_response_pump<C>(
    mut records: mpsc::Receiver<IncomingRecord>,
    codec: Arc<C>,
    writer: Arc<StreamWriter>,
    cancel: CancellationToken,
    max_message_size: usize,
    streams: Arc<Mutex<HashMap<u64, mpsc::Sender<IncomingRecord>>>>,
    endpoint_closed: Arc<AtomicBool>,
) -> mpsc::Receiver<Result<C::Message>>
where
    C: MessageCodec,
{
    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
    let stream_id = writer.stream_id();
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_max_message_size(max_message_size);
        'pump: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // An endpoint-wide close surfaces UNAVAILABLE; a
                    // per-call cancel (deadline, explicit, owner drop)
                    // surfaces CANCELLED.
                    let status = if endpoint_closed.load(Ordering::SeqCst) {
                        Status::unavailable("endpoint closed")
                    } else {
                        Status::cancelled("call cancelled")
                    };
                    let _ = writer.send_cancel(&Status::cancelled("call cancelled")).await;
                    let _ = tx.try_send(Err(status));
                    break 'pump;
                }
                record = records.recv() => {
                    let Some(record) = record else {
                        let _ = tx
                            .send(Err(Status::unavailable("transport closed before the trailer")))
                            .await;
                        break 'pump;
                    };
                    if let Some(status) = record.metadata.as_ref().and_then(|md| md.status()) {
                        if !status.is_ok() {
                            let _ = tx.send(Err(status)).await;
                        }
                        break 'pump;
                    }
                    if let Some(payload) = &record.payload {
                        match decode_payload(&mut decoder, codec.as_ref(), payload) {
                            Ok(responses) => {
                                for response in responses {
                                    if tx.send(Ok(response)).await.is_err() {
                                        trace!(stream_id, "response receiver dropped");
                                        cancel.cancel();
                                        continue 'pump;
                                    }
                                }
                            }
                            Err(status) => {
                                let _ = writer.send_cancel(&status).await;
                                let _ = tx.send(Err(status)).await;
                                cancel.cancel();
                                break 'pump;
                            }
                        }
                    }
                    if record.end_of_stream {
                        let _ = tx
                            .send(Err(Status::unavailable("stream ended without a trailer")))
                            .await;
                        break 'pump;
                    }
                }
            }
        }
        streams.lock().unwrap().remove(&stream_id);
    });
    rx
}
