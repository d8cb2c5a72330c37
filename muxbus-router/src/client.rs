use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use muxbus_core::call::{BidiSender, CallOptions, Streaming};
use muxbus_core::codec::JsonCodec;
use muxbus_core::status::{Result, Status};
use muxbus_core::transport::Transport;
use muxbus_core::CallerEndpoint;

use crate::core::{PingRequest, PongResponse, RegisterRequest, RegisterResponse};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::event::SystemEvent;
use crate::registry::{ClientFilter, ClientInfo};
use crate::service::ROUTER_SERVICE;

type EnvelopeCodec = JsonCodec<Envelope>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Vec<u8>>>>>>;

/// Caller-side convenience over one router connection.
///
/// Owns the pending-request map: request/response correlation is
/// end-to-end between clients, the router only forwards. A live
/// correlation id is unique; reusing one while the first request is
/// pending fails locally with FAILED_PRECONDITION.
pub struct RouterClient {
    endpoint: CallerEndpoint,
    client_id: Mutex<Option<String>>,
    p2p: Mutex<Option<BidiSender<EnvelopeCodec>>>,
    pending: PendingMap,
    next_correlation: AtomicU64,
    cancel: CancellationToken,
}

impl RouterClient {
    pub fn new(transport: Arc<dyn Transport>) -> RouterClient {
        RouterClient {
            endpoint: CallerEndpoint::new(transport),
            client_id: Mutex::new(None),
            p2p: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_correlation: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// The id assigned by `register`, once registered.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().unwrap().clone()
    }

    fn require_id(&self) -> Result<String> {
        self.client_id()
            .ok_or_else(|| Status::failed_precondition("client is not registered"))
    }

    fn p2p_sender(&self) -> Result<BidiSender<EnvelopeCodec>> {
        self.p2p
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Status::failed_precondition("p2p stream is not initialised"))
    }

    /// Register with the router and remember the assigned id.
    pub async fn register(
        &self,
        client_name: &str,
        groups: Vec<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        let response = self
            .register_request(RegisterRequest {
                client_name: client_name.to_string(),
                groups,
                metadata,
                client_id: None,
            })
            .await?;
        Ok(response.client_id)
    }

    /// Register with full control over the request, including an explicit
    /// client id (which may collide with ALREADY_EXISTS).
    pub async fn register_request(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let call = self
            .endpoint
            .unary(
                ROUTER_SERVICE,
                "register",
                JsonCodec::<RegisterRequest>::new(),
                JsonCodec::<RegisterResponse>::new(),
                CallOptions::new(),
            )
            .await?;
        let response = call.call(request).await?;
        debug!(client_id = %response.client_id, "registered");
        *self.client_id.lock().unwrap() = Some(response.client_id.clone());
        Ok(response)
    }

    /// Open the long-lived P2P stream and start the read loop.
    ///
    /// `on_message` receives every envelope that is not a correlated
    /// response: unicast/multicast/broadcast traffic, inbound requests,
    /// and router error reports without a pending entry.
    pub async fn init_p2p(
        &self,
        on_message: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> Result<()> {
        let client_id = self.require_id()?;
        let call = self
            .endpoint
            .bidi(
                ROUTER_SERVICE,
                "p2p",
                EnvelopeCodec::new(),
                EnvelopeCodec::new(),
                CallOptions::new(),
            )
            .await?;
        let (sender, mut responses) = call.into_parts();

        // The first envelope identifies this stream to the router.
        sender.send(&Envelope::heartbeat(&client_id)).await?;
        *self.p2p.lock().unwrap() = Some(sender);

        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = responses.message() => match message {
                        Ok(Some(envelope)) => {
                            dispatch_inbound(&pending, &on_message, envelope);
                        }
                        Ok(None) => {
                            debug!("p2p stream closed by the router");
                            fail_pending(&pending, Status::unavailable("p2p stream closed"));
                            break;
                        }
                        Err(status) => {
                            warn!(%status, "p2p stream failed");
                            fail_pending(&pending, status);
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn send_unicast(&self, target_id: &str, payload: Vec<u8>) -> Result<()> {
        let client_id = self.require_id()?;
        self.p2p_sender()?
            .send(&Envelope::unicast(&client_id, target_id, payload))
            .await
    }

    pub async fn send_multicast(&self, groups: Vec<String>, payload: Vec<u8>) -> Result<()> {
        let client_id = self.require_id()?;
        self.p2p_sender()?
            .send(&Envelope::multicast(&client_id, groups, payload))
            .await
    }

    pub async fn send_broadcast(&self, payload: Vec<u8>) -> Result<()> {
        let client_id = self.require_id()?;
        self.p2p_sender()?
            .send(&Envelope::broadcast(&client_id, payload))
            .await
    }

    /// Request/response with an auto-allocated correlation id.
    pub async fn send_request(
        &self,
        target_id: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let client_id = self.require_id()?;
        let correlation_id = format!(
            "{client_id}-{}",
            self.next_correlation.fetch_add(1, Ordering::SeqCst)
        );
        self.send_request_with_correlation(target_id, &correlation_id, payload, deadline)
            .await
    }

    /// Request/response with a caller-chosen correlation id.
    pub async fn send_request_with_correlation(
        &self,
        target_id: &str,
        correlation_id: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let client_id = self.require_id()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(correlation_id) {
                return Err(Status::failed_precondition(format!(
                    "correlation id {correlation_id} is already in flight"
                )));
            }
            pending.insert(correlation_id.to_string(), tx);
        }

        let envelope = Envelope::request(&client_id, target_id, correlation_id, payload);
        let sender = match self.p2p_sender() {
            Ok(sender) => sender,
            Err(status) => {
                self.pending.lock().unwrap().remove(correlation_id);
                return Err(status);
            }
        };
        if let Err(status) = sender.send(&envelope).await {
            self.pending.lock().unwrap().remove(correlation_id);
            return Err(status);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Status::unavailable("router client closed")),
            Err(_) => {
                self.pending.lock().unwrap().remove(correlation_id);
                Err(Status::deadline_exceeded(format!(
                    "request {correlation_id} timed out"
                )))
            }
        }
    }

    /// Answer an inbound `request` envelope.
    pub async fn send_response(
        &self,
        target_id: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let client_id = self.require_id()?;
        self.p2p_sender()?
            .send(&Envelope::response(&client_id, target_id, correlation_id, payload))
            .await
    }

    /// Replace this client's metadata on the router.
    pub async fn update_metadata(&self, metadata: HashMap<String, String>) -> Result<()> {
        let client_id = self.require_id()?;
        self.p2p_sender()?
            .send(&Envelope::metadata_update(&client_id, &metadata))
            .await
    }

    /// An empty envelope over P2P, refreshing `last_seen_at`.
    pub async fn heartbeat(&self) -> Result<()> {
        let client_id = self.require_id()?;
        self.p2p_sender()?
            .send(&Envelope::heartbeat(&client_id))
            .await
    }

    /// Unary ping; also refreshes `last_seen_at` when registered.
    pub async fn ping(&self, nonce: &str) -> Result<PongResponse> {
        let call = self
            .endpoint
            .unary(
                ROUTER_SERVICE,
                "ping",
                JsonCodec::<PingRequest>::new(),
                JsonCodec::<PongResponse>::new(),
                CallOptions::new(),
            )
            .await?;
        call.call(PingRequest {
            nonce: nonce.to_string(),
            client_id: self.client_id(),
        })
        .await
    }

    /// Snapshot of connected clients, optionally filtered.
    pub async fn get_online_clients(&self, filter: ClientFilter) -> Result<Vec<ClientInfo>> {
        let call = self
            .endpoint
            .unary(
                ROUTER_SERVICE,
                "getOnlineClients",
                JsonCodec::<ClientFilter>::new(),
                JsonCodec::<Vec<ClientInfo>>::new(),
                CallOptions::new(),
            )
            .await?;
        call.call(filter).await
    }

    /// Subscribe to router system events from now on.
    pub async fn subscribe_events(&self) -> Result<Streaming<SystemEvent>> {
        let call = self
            .endpoint
            .server_stream(
                ROUTER_SERVICE,
                "events",
                JsonCodec::<serde_json::Value>::new(),
                JsonCodec::<SystemEvent>::new(),
                CallOptions::new(),
            )
            .await?;
        call.call(serde_json::Value::Null).await
    }

    /// Tear down the P2P stream and the endpoint; pending requests fail
    /// with UNAVAILABLE.
    pub async fn close(&self) {
        self.cancel.cancel();
        fail_pending(&self.pending, Status::unavailable("router client closed"));
        self.p2p.lock().unwrap().take();
        self.endpoint.close().await;
    }
}

/// Route one inbound P2P envelope: correlated responses and errors settle
/// their pending entry, everything else goes to the message callback.
fn dispatch_inbound(
    pending: &PendingMap,
    on_message: &(impl Fn(Envelope) + Send + Sync),
    envelope: Envelope,
) {
    let correlated = matches!(envelope.kind, EnvelopeKind::Response | EnvelopeKind::Error);
    if correlated {
        if let Some(correlation_id) = envelope.correlation_id.clone() {
            let slot = pending.lock().unwrap().remove(&correlation_id);
            if let Some(tx) = slot {
                let outcome = match envelope.kind {
                    EnvelopeKind::Error => {
                        let status = envelope
                            .routing_error()
                            .map(|e| Status::new(e.code(), e.message))
                            .unwrap_or_else(|| {
                                Status::new(
                                    muxbus_core::status::Code::Unknown,
                                    "error envelope with unreadable payload",
                                )
                            });
                        Err(status)
                    }
                    _ => Ok(envelope.payload),
                };
                let _ = tx.send(outcome);
                return;
            }
        }
    }
    on_message(envelope);
}

/// Complete every pending request with the given status.
fn fail_pending(pending: &PendingMap, status: Status) {
    let drained: Vec<_> = pending.lock().unwrap().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(status.clone()));
    }
}
