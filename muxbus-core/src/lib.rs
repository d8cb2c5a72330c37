//! Core stream engine for muxbus.
//!
//! Multiplexes four RPC call shapes (unary, server-stream, client-stream,
//! bidirectional) over any full-duplex byte transport that can deliver
//! ordered records on numbered streams. Messages are length-prefix framed,
//! calls carry initial and trailing metadata, and every call terminates
//! with exactly one status-bearing trailer.
//!
//! The crate is transport-agnostic: implement [`transport::Transport`]
//! over whatever carries your bytes, register services on a
//! [`endpoint::ResponderEndpoint`], and originate calls through a
//! [`endpoint::CallerEndpoint`].

pub mod call;
pub mod codec;
pub mod endpoint;
pub mod framing;
pub mod metadata;
mod processor;
pub mod service;
pub mod status;
pub mod transport;

pub use call::{
    BidiCall, BidiSender, BoxStream, CallOptions, ClientStreamCall, ServerStreamCall, Streaming,
    UnaryCall,
};
pub use codec::{BytesCodec, JsonCodec, MessageCodec, Utf8Codec};
pub use endpoint::{CallerEndpoint, EndpointConfig, ResponderEndpoint};
pub use metadata::Metadata;
pub use service::{CallKind, MethodRegistrar, ServiceContract};
pub use status::{Code, Result, Status};
pub use transport::{IncomingRecord, IncomingRecords, Transport};
