use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use muxbus_core::status::Code;

/// The sender id the router uses on envelopes it originates itself
/// (error reports and system events).
pub const ROUTER_ID: &str = "router";

/// Router message classes.
///
/// `system-event` only ever travels router-to-client; `metadata-update`
/// only client-to-router. Everything else is forwarded between clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Unicast,
    Multicast,
    Broadcast,
    Request,
    Response,
    Error,
    SystemEvent,
    MetadataUpdate,
}

/// The unit routed between clients.
///
/// The payload is opaque to the router and passes through unchanged; in
/// the JSON form it is base64. A `response` or `error` answering a
/// `request` carries the request's `correlation_id` verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "opaque_payload")]
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

/// Carried as the payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingError {
    pub code: i32,
    pub message: String,
}

impl RoutingError {
    pub fn new(code: Code, message: impl Into<String>) -> RoutingError {
        RoutingError {
            code: code.as_i32(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        Code::from_i32(self.code)
    }
}

/// Milliseconds since the epoch, the envelope timestamp base.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Envelope {
    fn new(
        kind: EnvelopeKind,
        sender_id: &str,
        target_ids: Vec<String>,
        correlation_id: Option<String>,
        payload: Vec<u8>,
    ) -> Envelope {
        Envelope {
            kind,
            sender_id: sender_id.to_string(),
            target_ids,
            correlation_id,
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn unicast(sender_id: &str, target_id: &str, payload: Vec<u8>) -> Envelope {
        Envelope::new(
            EnvelopeKind::Unicast,
            sender_id,
            vec![target_id.to_string()],
            None,
            payload,
        )
    }

    pub fn multicast(sender_id: &str, groups: Vec<String>, payload: Vec<u8>) -> Envelope {
        Envelope::new(EnvelopeKind::Multicast, sender_id, groups, None, payload)
    }

    pub fn broadcast(sender_id: &str, payload: Vec<u8>) -> Envelope {
        Envelope::new(EnvelopeKind::Broadcast, sender_id, Vec::new(), None, payload)
    }

    pub fn request(
        sender_id: &str,
        target_id: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Envelope {
        Envelope::new(
            EnvelopeKind::Request,
            sender_id,
            vec![target_id.to_string()],
            Some(correlation_id.to_string()),
            payload,
        )
    }

    pub fn response(
        sender_id: &str,
        target_id: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Envelope {
        Envelope::new(
            EnvelopeKind::Response,
            sender_id,
            vec![target_id.to_string()],
            Some(correlation_id.to_string()),
            payload,
        )
    }

    pub fn error(
        sender_id: &str,
        target_id: &str,
        correlation_id: Option<String>,
        error: &RoutingError,
    ) -> Envelope {
        let payload = serde_json::to_vec(error).unwrap_or_default();
        Envelope::new(
            EnvelopeKind::Error,
            sender_id,
            vec![target_id.to_string()],
            correlation_id,
            payload,
        )
    }

    /// An empty envelope; its only effect is refreshing `last_seen_at`.
    pub fn heartbeat(sender_id: &str) -> Envelope {
        Envelope::new(EnvelopeKind::Unicast, sender_id, Vec::new(), None, Vec::new())
    }

    pub fn metadata_update(sender_id: &str, metadata: &HashMap<String, String>) -> Envelope {
        let payload = serde_json::to_vec(metadata).unwrap_or_default();
        Envelope::new(
            EnvelopeKind::MetadataUpdate,
            sender_id,
            Vec::new(),
            None,
            payload,
        )
    }

    /// Parse the payload of an `error` envelope.
    pub fn routing_error(&self) -> Option<RoutingError> {
        if self.kind != EnvelopeKind::Error {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }

    /// Parse the payload of a `metadata-update` envelope.
    pub fn metadata_payload(&self) -> Option<HashMap<String, String>> {
        serde_json::from_slice(&self.payload).ok()
    }
}

mod opaque_payload {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
