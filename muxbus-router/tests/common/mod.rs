// Each integration test file compiles as its own binary crate with its
// own copy of this module; not every binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use muxbus_core::status::Result;
use muxbus_core::transport::Transport;
use muxbus_router::{
    Envelope, EnvelopeKind, RouterClient, RouterConfig, RouterCore, RouterServer, TransportSource,
};

/// Adapts the in-process hub acceptor to the router's listener contract.
pub struct MemListener(pub memlink::MemAcceptor);

#[async_trait]
impl TransportSource for MemListener {
    async fn accept(&self) -> Result<Arc<dyn Transport>> {
        let transport = self.0.accept().await?;
        Ok(transport as Arc<dyn Transport>)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Boot a router over an in-process hub and serve it in the background.
pub fn start_router(config: RouterConfig) -> (Arc<RouterServer>, memlink::MemConnector) {
    let core = RouterCore::new(config);
    let server = Arc::new(RouterServer::new(core));
    let (connector, acceptor) = memlink::hub();
    let handle = Arc::clone(&server);
    tokio::spawn(async move { handle.serve(MemListener(acceptor)).await });
    (server, connector)
}

/// Connect, register, and open P2P with an inbox collecting every
/// envelope the callback sees.
pub async fn join(
    connector: &memlink::MemConnector,
    name: &str,
    groups: Vec<String>,
) -> (Arc<RouterClient>, String, mpsc::Receiver<Envelope>) {
    let client = Arc::new(RouterClient::new(connector.connect().await.unwrap()));
    let client_id = client
        .register(name, groups, HashMap::new())
        .await
        .unwrap();
    let (tx, rx) = mpsc::channel(32);
    client
        .init_p2p(move |envelope| {
            let _ = tx.try_send(envelope);
        })
        .await
        .unwrap();
    (client, client_id, rx)
}

/// Like `join`, but answers every inbound request with `payload + ":ack"`.
pub async fn join_echoing(
    connector: &memlink::MemConnector,
    name: &str,
) -> (Arc<RouterClient>, String) {
    let client = Arc::new(RouterClient::new(connector.connect().await.unwrap()));
    let client_id = client
        .register(name, Vec::new(), HashMap::new())
        .await
        .unwrap();
    let responder = Arc::clone(&client);
    client
        .init_p2p(move |envelope| {
            if envelope.kind != EnvelopeKind::Request {
                return;
            }
            let Some(correlation_id) = envelope.correlation_id.clone() else {
                return;
            };
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                let mut payload = envelope.payload.clone();
                payload.extend_from_slice(b":ack");
                let _ = responder
                    .send_response(&envelope.sender_id, &correlation_id, payload)
                    .await;
            });
        })
        .await
        .unwrap();
    (client, client_id)
}
