//! Caller and responder endpoints: each owns one transport and the map
//! from live stream ids to per-call state.

mod caller;
mod responder;

pub use caller::CallerEndpoint;
pub use responder::ResponderEndpoint;

use std::time::Duration;

use crate::framing::DEFAULT_MAX_MESSAGE_SIZE;

/// Endpoint tuning knobs.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Cap on a single decoded message.
    pub max_message_size: usize,
    /// Per-stream record channel capacity.
    pub stream_buffer: usize,
    /// How long `close()` waits for in-flight calls before force-closing.
    pub drain_window: Duration,
    /// Caller side only: reject calls to methods that were never
    /// registered. Off by default for dynamic use.
    pub validate_methods: bool,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stream_buffer: 32,
            drain_window: Duration::from_secs(5),
            validate_methods: false,
        }
    }
}
