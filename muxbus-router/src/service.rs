use std::sync::Arc;

use muxbus_core::codec::JsonCodec;
use muxbus_core::service::{MethodRegistrar, ServiceContract};

use crate::core::{PingRequest, PongResponse, RegisterRequest, RegisterResponse, RouterCore};
use crate::envelope::Envelope;
use crate::event::SystemEvent;
use crate::registry::{ClientFilter, ClientInfo};

/// The service name the router registers under.
pub const ROUTER_SERVICE: &str = "Router";

/// Wires the router core's operations onto a responder endpoint.
///
/// All payloads are JSON: the envelope for `p2p`, plain request/response
/// structs for the unary methods, system events for `events`.
pub struct RouterService {
    core: Arc<RouterCore>,
}

impl RouterService {
    pub fn new(core: Arc<RouterCore>) -> RouterService {
        RouterService { core }
    }
}

impl ServiceContract for RouterService {
    fn service_name(&self) -> &str {
        ROUTER_SERVICE
    }

    fn setup(&self, methods: &mut MethodRegistrar<'_>) {
        let core = Arc::clone(&self.core);
        methods.add_unary(
            "register",
            JsonCodec::<RegisterRequest>::new(),
            JsonCodec::<RegisterResponse>::new(),
            move |request, _md| {
                let core = Arc::clone(&core);
                async move { core.register(request) }
            },
        );

        let core = Arc::clone(&self.core);
        methods.add_unary(
            "getOnlineClients",
            JsonCodec::<ClientFilter>::new(),
            JsonCodec::<Vec<ClientInfo>>::new(),
            move |filter, _md| {
                let core = Arc::clone(&core);
                async move { Ok(core.online_clients(&filter)) }
            },
        );

        let core = Arc::clone(&self.core);
        methods.add_unary(
            "ping",
            JsonCodec::<PingRequest>::new(),
            JsonCodec::<PongResponse>::new(),
            move |request, _md| {
                let core = Arc::clone(&core);
                async move { Ok(core.ping(request)) }
            },
        );

        let core = Arc::clone(&self.core);
        methods.add_bidi(
            "p2p",
            JsonCodec::<Envelope>::new(),
            JsonCodec::<Envelope>::new(),
            move |requests, _md| {
                let core = Arc::clone(&core);
                async move { core.run_p2p(requests).await }
            },
        );

        let core = Arc::clone(&self.core);
        methods.add_server_stream(
            "events",
            JsonCodec::<serde_json::Value>::new(),
            JsonCodec::<SystemEvent>::new(),
            move |_request, _md| {
                let core = Arc::clone(&core);
                async move {
                    use tokio_stream::StreamExt;
                    let rx = core.subscribe_events();
                    let stream: muxbus_core::call::BoxStream<SystemEvent> = Box::pin(
                        tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok),
                    );
                    Ok(stream)
                }
            },
        );
    }
}
