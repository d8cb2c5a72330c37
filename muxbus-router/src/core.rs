use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use muxbus_core::call::{BoxStream, Streaming};
use muxbus_core::status::{Code, Result, Status};

use crate::envelope::{now_millis, Envelope, EnvelopeKind, RoutingError, ROUTER_ID};
use crate::event::SystemEvent;
use crate::registry::{ClientFilter, ClientInfo, Registry};

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How often the health loop scans for silent clients.
    pub health_interval: Duration,
    /// How long a client may stay silent before it is removed.
    pub client_timeout: Duration,
    /// Per-client P2P delivery queue capacity.
    pub p2p_buffer: usize,
    /// Per-subscriber event queue capacity; a full queue drops the
    /// subscriber.
    pub event_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            health_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(300),
            p2p_buffer: 32,
            event_buffer: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Optional caller-supplied id; collisions fail with ALREADY_EXISTS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub client_id: String,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub nonce: String,
    /// Lets the router refresh `last_seen_at` when the sender is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongResponse {
    pub nonce: String,
    pub server_time: i64,
}

/// The fan-out/fan-in hub shared by every responder endpoint of one
/// router process.
///
/// Owns the client registry and the P2P write handles. Dispatch reads a
/// snapshot of targets, then delivers without holding any lock. All state
/// is in memory and gone on restart.
pub struct RouterCore {
    registry: Registry,
    subscribers: Mutex<Vec<mpsc::Sender<SystemEvent>>>,
    config: RouterConfig,
    shutdown: CancellationToken,
    health_started: AtomicBool,
}

impl RouterCore {
    pub fn new(config: RouterConfig) -> Arc<RouterCore> {
        Arc::new(RouterCore {
            registry: Registry::new(),
            subscribers: Mutex::new(Vec::new()),
            config,
            shutdown: CancellationToken::new(),
            health_started: AtomicBool::new(false),
        })
    }

    /// Start the background health-check loop. Idempotent.
    pub fn start(self: Arc<Self>) {
        if self.health_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = core.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for client_id in core.registry.expired(core.config.client_timeout) {
                            debug!(%client_id, "client timed out");
                            core.remove_client(&client_id, "timeout");
                        }
                    }
                }
            }
        });
    }

    /// Dispose the core: stop the health loop, drop every client record
    /// and P2P handle, end every event subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.clear();
        self.subscribers.lock().unwrap().clear();
    }

    pub(crate) fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let info = self.registry.register(
            request.client_id,
            &request.client_name,
            request.groups,
            request.metadata,
        )?;
        debug!(client_id = %info.client_id, client_name = %info.client_name, "client registered");
        self.emit_event(SystemEvent::ClientJoined {
            id: info.client_id.clone(),
            name: info.client_name.clone(),
            groups: info.groups.clone(),
        });
        Ok(RegisterResponse {
            client_id: info.client_id,
            client_name: info.client_name,
        })
    }

    pub(crate) fn online_clients(&self, filter: &ClientFilter) -> Vec<ClientInfo> {
        self.registry.snapshot(filter)
    }

    pub(crate) fn ping(&self, request: PingRequest) -> PongResponse {
        if let Some(client_id) = &request.client_id {
            self.registry.touch(client_id);
        }
        PongResponse {
            nonce: request.nonce,
            server_time: now_millis(),
        }
    }

    /// Open an event subscription; events flow from now on.
    pub(crate) fn subscribe_events(&self) -> mpsc::Receiver<SystemEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn emit_event(&self, event: SystemEvent) {
        // A subscriber that is gone or cannot keep up is dropped; events
        // are best-effort like every other fan-out.
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.try_send(event.clone()).is_ok());
    }

    /// Remove a client, dropping its P2P stream, and announce it.
    pub(crate) fn remove_client(&self, client_id: &str, reason: &str) {
        if let Some(info) = self.registry.remove(client_id) {
            debug!(%client_id, reason, "client removed");
            self.emit_event(SystemEvent::ClientLeft {
                id: info.client_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Serve one client's P2P stream: authenticate on the first inbound
    /// envelope, attach the delivery queue, then dispatch everything that
    /// follows. The response half is the delivery queue itself, so it
    /// closes exactly when the record goes away.
    pub(crate) async fn run_p2p(
        self: Arc<Self>,
        mut requests: Streaming<Envelope>,
    ) -> Result<BoxStream<Envelope>> {
        let first = match requests.message().await? {
            Some(envelope) => envelope,
            None => {
                return Err(Status::unauthenticated(
                    "p2p stream ended before identification",
                ))
            }
        };
        let client_id = first.sender_id.clone();
        if !self.registry.contains(&client_id) {
            warn!(%client_id, "p2p stream from unregistered sender");
            return Err(Status::unauthenticated(format!(
                "sender {client_id} is not a registered client"
            )));
        }

        let (tx, rx) = mpsc::channel(self.config.p2p_buffer);
        self.registry.attach_p2p(&client_id, tx)?;
        self.dispatch(&client_id, first).await;

        let core = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match requests.message().await {
                    Ok(Some(envelope)) => core.dispatch(&client_id, envelope).await,
                    Ok(None) => {
                        core.remove_client(&client_id, "disconnected");
                        break;
                    }
                    Err(status) => {
                        debug!(%client_id, %status, "p2p stream failed");
                        core.remove_client(&client_id, "disconnected");
                        break;
                    }
                }
            }
        });

        let stream: BoxStream<Envelope> = Box::pin(ReceiverStream::new(rx).map(Ok));
        Ok(stream)
    }

    /// Route one inbound envelope. Never fails; bad envelopes are
    /// dropped, or answered with an error report where the sender can
    /// act on one.
    pub(crate) async fn dispatch(&self, sender_id: &str, envelope: Envelope) {
        self.registry.touch(sender_id);

        if envelope.sender_id != sender_id {
            warn!(
                %sender_id,
                claimed = %envelope.sender_id,
                "envelope sender does not match the stream owner; dropped"
            );
            return;
        }

        match envelope.kind {
            EnvelopeKind::Unicast | EnvelopeKind::Request => {
                // An empty target list is a keepalive, not an error.
                if envelope.target_ids.is_empty() {
                    return;
                }
                let targets = envelope.target_ids.clone();
                self.deliver(targets, &envelope, true).await;
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                let targets = envelope.target_ids.clone();
                self.deliver(targets, &envelope, true).await;
            }
            EnvelopeKind::Multicast => {
                let members = self.registry.group_members(&envelope.target_ids, sender_id);
                self.deliver(members, &envelope, false).await;
            }
            EnvelopeKind::Broadcast => {
                let targets = self.registry.all_except(sender_id);
                self.deliver(targets, &envelope, false).await;
            }
            EnvelopeKind::MetadataUpdate => {
                let Some(metadata) = envelope.metadata_payload() else {
                    warn!(%sender_id, "metadata-update with unreadable payload dropped");
                    return;
                };
                if let Some(info) = self.registry.update_metadata(sender_id, metadata) {
                    self.emit_event(SystemEvent::ClientMetadataUpdated {
                        id: info.client_id,
                        metadata: info.metadata,
                    });
                }
            }
            EnvelopeKind::SystemEvent => {
                // Only the router originates these.
                warn!(%sender_id, "client-sent system-event dropped");
                self.report_error(
                    sender_id,
                    RoutingError::new(
                        Code::InvalidArgument,
                        "system-event envelopes are router-originated only",
                    ),
                    envelope.correlation_id.clone(),
                )
                .await;
            }
        }
    }

    /// Deliver to each target in turn. A target whose stream is gone is
    /// unregistered on the spot; `report_missing` additionally sends one
    /// error envelope per failed target back to the sender, carrying the
    /// original correlation id.
    async fn deliver(&self, targets: Vec<String>, envelope: &Envelope, report_missing: bool) {
        for target in targets {
            let delivered = match self.registry.p2p_handle(&target) {
                Some(handle) => {
                    if handle.send(envelope.clone()).await.is_ok() {
                        true
                    } else {
                        self.remove_client(&target, "disconnected");
                        false
                    }
                }
                None => false,
            };
            if !delivered && report_missing {
                self.report_error(
                    &envelope.sender_id,
                    RoutingError::new(Code::NotFound, format!("client {target} not found")),
                    envelope.correlation_id.clone(),
                )
                .await;
            }
        }
    }

    /// Best-effort error envelope back to a client.
    async fn report_error(
        &self,
        client_id: &str,
        error: RoutingError,
        correlation_id: Option<String>,
    ) {
        let Some(handle) = self.registry.p2p_handle(client_id) else {
            return;
        };
        let envelope = Envelope::error(ROUTER_ID, client_id, correlation_id, &error);
        if handle.send(envelope).await.is_err() {
            self.remove_client(client_id, "disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RouterConfig {
        RouterConfig {
            health_interval: Duration::from_millis(20),
            client_timeout: Duration::from_millis(80),
            ..RouterConfig::default()
        }
    }

    fn register(core: &Arc<RouterCore>, name: &str) -> String {
        core.register(RegisterRequest {
            client_name: name.into(),
            groups: Vec::new(),
            metadata: HashMap::new(),
            client_id: None,
        })
        .unwrap()
        .client_id
    }

    #[tokio::test]
    async fn register_emits_client_joined() {
        let core = RouterCore::new(RouterConfig::default());
        let mut events = core.subscribe_events();

        let id = register(&core, "alice");
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SystemEvent::ClientJoined {
                id,
                name: "alice".into(),
                groups: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn subscribers_see_no_replay() {
        let core = RouterCore::new(RouterConfig::default());
        register(&core, "alice");

        let mut events = core.subscribe_events();
        let bob = register(&core, "bob");

        match events.recv().await.unwrap() {
            SystemEvent::ClientJoined { id, name, .. } => {
                assert_eq!(id, bob);
                assert_eq!(name, "bob");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_loop_removes_silent_clients() {
        let core = RouterCore::new(test_config());
        let mut events = core.subscribe_events();
        let id = register(&core, "alice");
        Arc::clone(&core).start();

        // client-joined first, then the timeout removal.
        assert!(matches!(
            events.recv().await.unwrap(),
            SystemEvent::ClientJoined { .. }
        ));
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for client-left")
            .unwrap();
        assert_eq!(
            event,
            SystemEvent::ClientLeft {
                id: id.clone(),
                reason: "timeout".into(),
            }
        );
        assert!(core.online_clients(&ClientFilter::default()).is_empty());
        core.shutdown();
    }

    #[tokio::test]
    async fn ping_refreshes_last_seen() {
        let core = RouterCore::new(test_config());
        let id = register(&core, "alice");

        let pong = core.ping(PingRequest {
            nonce: "n-1".into(),
            client_id: Some(id),
        });
        assert_eq!(pong.nonce, "n-1");
        assert!(pong.server_time > 0);
    }

    #[tokio::test]
    async fn unicast_to_unknown_target_reports_not_found() {
        let core = RouterCore::new(RouterConfig::default());
        let alice = register(&core, "alice");

        let (tx, mut rx) = mpsc::channel(8);
        core.registry.attach_p2p(&alice, tx).unwrap();

        core.dispatch(&alice, Envelope::unicast(&alice, "c-999999", b"x".to_vec()))
            .await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Error);
        assert_eq!(envelope.sender_id, ROUTER_ID);
        let error = envelope.routing_error().unwrap();
        assert_eq!(error.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn mismatched_sender_id_is_dropped() {
        let core = RouterCore::new(RouterConfig::default());
        let alice = register(&core, "alice");
        let bob = register(&core, "bob");

        let (tx, mut rx) = mpsc::channel(8);
        core.registry.attach_p2p(&bob, tx).unwrap();

        // alice's stream claims to be bob; nothing is delivered.
        core.dispatch(&alice, Envelope::unicast(&bob, &bob, b"x".to_vec()))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_broadcast_sends_nothing() {
        let core = RouterCore::new(RouterConfig::default());
        let alice = register(&core, "alice");
        // No other clients; dispatch must simply return.
        core.dispatch(&alice, Envelope::broadcast(&alice, b"x".to_vec()))
            .await;
    }
}
