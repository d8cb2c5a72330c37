use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Events the router emits to `events` subscribers.
///
/// Subscribers see events from subscription time forward; there is no
/// replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SystemEvent {
    ClientJoined {
        id: String,
        name: String,
        groups: Vec<String>,
    },
    ClientLeft {
        id: String,
        reason: String,
    },
    ClientMetadataUpdated {
        id: String,
        metadata: HashMap<String, String>,
    },
}
