use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use muxbus_core::status::{Result, Status};

use crate::envelope::{now_millis, Envelope};

/// The externally visible part of a client record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub connected_at: i64,
}

/// Restricts a `getOnlineClients` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
}

struct ClientEntry {
    info: ClientInfo,
    last_seen_at: Instant,
    p2p: Option<mpsc::Sender<Envelope>>,
}

/// The client registry: one short-lived mutex, no await inside it.
///
/// Two records may share a `client_name`; `client_id` is the routing key.
/// A record's lifetime is tied to its P2P handle - dropping the handle
/// (remove) is what disconnects the client's stream.
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
}

struct RegistryState {
    clients: HashMap<String, ClientEntry>,
    groups: HashMap<String, HashSet<String>>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            state: Mutex::new(RegistryState {
                clients: HashMap::new(),
                groups: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Insert a new record. An explicit id may collide (ALREADY_EXISTS);
    /// allocated ids never do.
    pub fn register(
        &self,
        explicit_id: Option<String>,
        name: &str,
        groups: Vec<String>,
        metadata: HashMap<String, String>,
    ) -> Result<ClientInfo> {
        let mut state = self.state.lock().unwrap();
        let client_id = match explicit_id {
            Some(id) => {
                if state.clients.contains_key(&id) {
                    return Err(Status::already_exists(format!(
                        "client id {id} is already registered"
                    )));
                }
                id
            }
            None => loop {
                state.next_id += 1;
                let id = format!("c-{:06}", state.next_id);
                if !state.clients.contains_key(&id) {
                    break id;
                }
            },
        };

        let info = ClientInfo {
            client_id: client_id.clone(),
            client_name: name.to_string(),
            groups: groups.clone(),
            metadata,
            connected_at: now_millis(),
        };
        for group in &groups {
            state
                .groups
                .entry(group.clone())
                .or_default()
                .insert(client_id.clone());
        }
        state.clients.insert(
            client_id,
            ClientEntry {
                info: info.clone(),
                last_seen_at: Instant::now(),
                p2p: None,
            },
        );
        Ok(info)
    }

    /// Refresh `last_seen_at`. Returns false for unknown ids.
    pub fn touch(&self, client_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.clients.get_mut(client_id) {
            Some(entry) => {
                entry.last_seen_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.state.lock().unwrap().clients.contains_key(client_id)
    }

    /// Replace the record's metadata; returns the updated info.
    pub fn update_metadata(
        &self,
        client_id: &str,
        metadata: HashMap<String, String>,
    ) -> Option<ClientInfo> {
        let mut state = self.state.lock().unwrap();
        let entry = state.clients.get_mut(client_id)?;
        entry.info.metadata = metadata;
        entry.last_seen_at = Instant::now();
        Some(entry.info.clone())
    }

    /// Attach the write handle of a freshly opened P2P stream. A second
    /// stream for the same client replaces the first, whose response
    /// stream then ends.
    pub fn attach_p2p(&self, client_id: &str, handle: mpsc::Sender<Envelope>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.clients.get_mut(client_id) {
            Some(entry) => {
                entry.p2p = Some(handle);
                entry.last_seen_at = Instant::now();
                Ok(())
            }
            None => Err(Status::unauthenticated(format!(
                "sender {client_id} is not a registered client"
            ))),
        }
    }

    /// Snapshot a client's P2P write handle.
    pub fn p2p_handle(&self, client_id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.state
            .lock()
            .unwrap()
            .clients
            .get(client_id)
            .and_then(|entry| entry.p2p.clone())
    }

    /// Remove a record, dropping its P2P handle and group memberships.
    /// A no-op on unknown ids, so concurrent removal paths tolerate each
    /// other.
    pub fn remove(&self, client_id: &str) -> Option<ClientInfo> {
        let mut state = self.state.lock().unwrap();
        let entry = state.clients.remove(client_id)?;
        for group in &entry.info.groups {
            if let Some(members) = state.groups.get_mut(group) {
                members.remove(client_id);
                if members.is_empty() {
                    state.groups.remove(group);
                }
            }
        }
        Some(entry.info)
    }

    /// Snapshot matching clients.
    pub fn snapshot(&self, filter: &ClientFilter) -> Vec<ClientInfo> {
        let state = self.state.lock().unwrap();
        state
            .clients
            .values()
            .filter(|entry| {
                if let Some(group) = &filter.group {
                    if !entry.info.groups.contains(group) {
                        return false;
                    }
                }
                if let Some(prefix) = &filter.name_prefix {
                    if !entry.info.client_name.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
                true
            })
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Current members of the named groups, minus the excluded sender.
    pub fn group_members(&self, groups: &[String], exclude: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for group in groups {
            if let Some(ids) = state.groups.get(group) {
                for id in ids {
                    if id != exclude && seen.insert(id.clone()) {
                        members.push(id.clone());
                    }
                }
            }
        }
        members
    }

    /// Every connected client except the excluded sender.
    pub fn all_except(&self, exclude: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .clients
            .keys()
            .filter(|id| id.as_str() != exclude)
            .cloned()
            .collect()
    }

    /// Ids whose `last_seen_at` is older than the timeout.
    pub fn expired(&self, timeout: Duration) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .clients
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop every record; used at core disposal.
    pub fn clear(&self) -> Vec<ClientInfo> {
        let mut state = self.state.lock().unwrap();
        state.groups.clear();
        state
            .clients
            .drain()
            .map(|(_, entry)| entry.info)
            .collect()
    }
}
