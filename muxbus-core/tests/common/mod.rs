// Each integration test file is compiled as its own binary crate, each
// pulling in its own copy of this module; helpers used by one binary but
// not another would otherwise trip "dead code" warnings.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use muxbus_core::call::{BoxStream, Streaming};
use muxbus_core::codec::{JsonCodec, Utf8Codec};
use muxbus_core::metadata::Metadata;
use muxbus_core::service::{MethodRegistrar, ServiceContract};
use muxbus_core::status::Status;
use muxbus_core::{CallerEndpoint, ResponderEndpoint};

/// Wire up a connected caller/responder pair over an in-process link.
///
/// `register` adds service contracts before the responder starts.
pub fn start_pair(register: impl FnOnce(&ResponderEndpoint)) -> (CallerEndpoint, ResponderEndpoint) {
    let (client_transport, server_transport) = memlink::pair();
    let responder = ResponderEndpoint::new(server_transport);
    register(&responder);
    responder.start().expect("responder starts once");
    let caller = CallerEndpoint::new(client_transport);
    (caller, responder)
}

/// `Echo.SayHello` returns its input; `Echo.Fail` always errors.
pub struct EchoService;

impl ServiceContract for EchoService {
    fn service_name(&self) -> &str {
        "Echo"
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        methods.add_unary("SayHello", Utf8Codec, Utf8Codec, |req: String, _md| async move {
            Ok(req)
        });
        methods.add_unary("Fail", Utf8Codec, Utf8Codec, |_req: String, _md| async move {
            Err::<String, Status>(Status::internal("handler exploded"))
        });
    }
}

/// `Meta.Header` echoes back the request header named by the request.
pub struct MetaService;

impl ServiceContract for MetaService {
    fn service_name(&self) -> &str {
        "Meta"
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        methods.add_unary(
            "Header",
            Utf8Codec,
            Utf8Codec,
            |name: String, md: Metadata| async move {
                Ok(md.get_str(&name).unwrap_or("<missing>").to_string())
            },
        );
    }
}

/// `Slow.Sleep` stalls long enough for deadline and shutdown tests.
pub struct SlowService;

impl ServiceContract for SlowService {
    fn service_name(&self) -> &str {
        "Slow"
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        methods.add_unary("Sleep", Utf8Codec, Utf8Codec, |req: String, _md| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(req)
        });
    }
}

/// `Ticker.Count` streams "1".."n", pacing items so a caller can cancel
/// mid-stream; the flag records that the handler observed the cancel.
pub struct TickerService {
    pub cancelled: Arc<AtomicBool>,
}

impl TickerService {
    pub fn new() -> TickerService {
        TickerService {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ServiceContract for TickerService {
    fn service_name(&self) -> &str {
        "Ticker"
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        let cancelled = Arc::clone(&self.cancelled);
        methods.add_server_stream("Count", Utf8Codec, Utf8Codec, move |req: String, _md| {
            let cancelled = Arc::clone(&cancelled);
            async move {
                let n: u32 = req
                    .parse()
                    .map_err(|_| Status::invalid_argument("count must be a number"))?;
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    for i in 1..=n {
                        if tx.send(Ok(i.to_string())).await.is_err() {
                            cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                let stream: BoxStream<String> = Box::pin(ReceiverStream::new(rx));
                Ok(stream)
            }
        });
    }
}

/// `Sum.Collect` adds up a request stream of integers.
pub struct SumService;

impl ServiceContract for SumService {
    fn service_name(&self) -> &str {
        "Sum"
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        methods.add_client_stream(
            "Collect",
            JsonCodec::<i64>::new(),
            JsonCodec::<i64>::new(),
            |mut requests: Streaming<i64>, _md| async move {
                let mut total = 0i64;
                while let Some(value) = requests.message().await? {
                    total += value;
                }
                Ok(total)
            },
        );
    }
}

/// `Chat.Exchange` echoes each line uppercased, one at a time.
pub struct ChatService;

impl ServiceContract for ChatService {
    fn service_name(&self) -> &str {
        "Chat"
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        methods.add_bidi(
            "Exchange",
            Utf8Codec,
            Utf8Codec,
            |mut requests: Streaming<String>, _md| async move {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    loop {
                        match requests.message().await {
                            Ok(Some(line)) => {
                                if tx.send(Ok(line.to_uppercase())).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => return,
                            Err(status) => {
                                let _ = tx.send(Err(status)).await;
                                return;
                            }
                        }
                    }
                });
                let stream: BoxStream<String> = Box::pin(ReceiverStream::new(rx));
                Ok(stream)
            },
        );
    }
}

/// Poll a condition until it holds or a second passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
