use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muxbus_core::status::Result;
use muxbus_core::transport::Transport;
use muxbus_core::{EndpointConfig, ResponderEndpoint};

use crate::core::RouterCore;
use crate::service::RouterService;

/// A source of connected transports; the concrete wire protocol lives
/// outside this crate.
#[async_trait]
pub trait TransportSource: Send + Sync {
    async fn accept(&self) -> Result<Arc<dyn Transport>>;
    async fn close(&self) -> Result<()>;
}

/// Accepts transports and attaches each to a responder endpoint sharing
/// one router core.
pub struct RouterServer {
    core: Arc<RouterCore>,
    endpoint_config: EndpointConfig,
    endpoints: Mutex<Vec<Arc<ResponderEndpoint>>>,
    shutdown: CancellationToken,
}

impl RouterServer {
    pub fn new(core: Arc<RouterCore>) -> RouterServer {
        RouterServer::with_endpoint_config(core, EndpointConfig::default())
    }

    pub fn with_endpoint_config(core: Arc<RouterCore>, endpoint_config: EndpointConfig) -> RouterServer {
        RouterServer {
            core,
            endpoint_config,
            endpoints: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn core(&self) -> &Arc<RouterCore> {
        &self.core
    }

    /// Accept transports from one listener until shutdown or until the
    /// listener fails. Several listeners may be served concurrently
    /// against the same server.
    pub async fn serve(&self, listener: impl TransportSource) {
        Arc::clone(&self.core).start();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        debug!("transport accepted");
                        let endpoint = Arc::new(ResponderEndpoint::with_config(
                            transport,
                            self.endpoint_config.clone(),
                        ));
                        endpoint.add_service(&RouterService::new(Arc::clone(&self.core)));
                        match endpoint.start() {
                            Ok(()) => self.endpoints.lock().unwrap().push(endpoint),
                            Err(status) => warn!(%status, "endpoint failed to start"),
                        }
                    }
                    Err(status) => {
                        info!(%status, "listener stopped");
                        break;
                    }
                }
            }
        }
        let _ = listener.close().await;
    }

    /// Graceful shutdown: stop accepting, drain every endpoint up to its
    /// drain window, then dispose the core.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let endpoints: Vec<_> = self.endpoints.lock().unwrap().drain(..).collect();
        for endpoint in endpoints {
            endpoint.close().await;
        }
        self.core.shutdown();
    }
}
