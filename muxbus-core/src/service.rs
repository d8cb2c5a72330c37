use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::call::{BoxStream, Streaming};
use crate::codec::MessageCodec;
use crate::metadata::Metadata;
use crate::processor::{self, ResponderContext};
use crate::status::Result;

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    ServerStream,
    ClientStream,
    Bidi,
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type MethodRunner = Arc<dyn Fn(ResponderContext) -> BoxFuture<()> + Send + Sync>;

/// One registered method: its shape plus the type-erased runner carrying
/// codec pair and handler. Built eagerly at registration so dispatch is a
/// plain map lookup.
#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub kind: CallKind,
    pub runner: MethodRunner,
}

/// Declarative per-service registration.
///
/// `setup` is invoked once when the contract is added to a responder
/// endpoint and registers every method with its shape, codec pair, and
/// handler.
pub trait ServiceContract: Send + Sync {
    fn service_name(&self) -> &str;
    fn setup(&self, methods: &mut MethodRegistrar<'_>);
}

/// Records methods into an endpoint's dispatch table under
/// `/Service/Method` keys.
pub struct MethodRegistrar<'a> {
    service: String,
    table: &'a mut HashMap<String, MethodEntry>,
}

impl<'a> MethodRegistrar<'a> {
    pub(crate) fn new(service: &str, table: &'a mut HashMap<String, MethodEntry>) -> Self {
        MethodRegistrar {
            service: service.to_string(),
            table,
        }
    }

    fn insert(&mut self, method: &str, kind: CallKind, runner: MethodRunner) {
        let path = format!("/{}/{}", self.service, method);
        self.table.insert(path, MethodEntry { kind, runner });
    }

    pub fn add_unary<ReqC, RespC, H, Fut>(
        &mut self,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        handler: H,
    ) where
        ReqC: MessageCodec,
        RespC: MessageCodec,
        H: Fn(ReqC::Message, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RespC::Message>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let runner: MethodRunner = Arc::new(move |ctx| {
            let future: BoxFuture<()> = Box::pin(processor::run_unary(
                ctx,
                Arc::clone(&req_codec),
                Arc::clone(&resp_codec),
                Arc::clone(&handler),
            ));
            future
        });
        self.insert(method, CallKind::Unary, runner);
    }

    pub fn add_server_stream<ReqC, RespC, H, Fut>(
        &mut self,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        handler: H,
    ) where
        ReqC: MessageCodec,
        RespC: MessageCodec,
        H: Fn(ReqC::Message, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BoxStream<RespC::Message>>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let runner: MethodRunner = Arc::new(move |ctx| {
            let future: BoxFuture<()> = Box::pin(processor::run_server_stream(
                ctx,
                Arc::clone(&req_codec),
                Arc::clone(&resp_codec),
                Arc::clone(&handler),
            ));
            future
        });
        self.insert(method, CallKind::ServerStream, runner);
    }

    pub fn add_client_stream<ReqC, RespC, H, Fut>(
        &mut self,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        handler: H,
    ) where
        ReqC: MessageCodec,
        RespC: MessageCodec,
        H: Fn(Streaming<ReqC::Message>, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RespC::Message>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let runner: MethodRunner = Arc::new(move |ctx| {
            let future: BoxFuture<()> = Box::pin(processor::run_client_stream(
                ctx,
                Arc::clone(&req_codec),
                Arc::clone(&resp_codec),
                Arc::clone(&handler),
            ));
            future
        });
        self.insert(method, CallKind::ClientStream, runner);
    }

    pub fn add_bidi<ReqC, RespC, H, Fut>(
        &mut self,
        method: &str,
        req_codec: ReqC,
        resp_codec: RespC,
        handler: H,
    ) where
        ReqC: MessageCodec,
        RespC: MessageCodec,
        H: Fn(Streaming<ReqC::Message>, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BoxStream<RespC::Message>>> + Send + 'static,
    {
        let req_codec = Arc::new(req_codec);
        let resp_codec = Arc::new(resp_codec);
        let handler = Arc::new(handler);
        let runner: MethodRunner = Arc::new(move |ctx| {
            let future: BoxFuture<()> = Box::pin(processor::run_bidi(
                ctx,
                Arc::clone(&req_codec),
                Arc::clone(&resp_codec),
                Arc::clone(&handler),
            ));
            future
        });
        self.insert(method, CallKind::Bidi, runner);
    }
}
