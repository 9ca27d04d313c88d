use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::utils::{BrokerError, Result};

/// Represents a connected client in the broker.
///
/// Each client is uniquely identified by an `id` while it is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Unique identifier for the client, chosen by the client.
    pub id: String,

    /// Milliseconds since UNIX epoch at registration.
    pub connected_at: i64,
}

impl ClientInfo {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            connected_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A subscription owned by a client, as `(channel, subscription id)`.
pub type SubRef = (String, u64);

#[derive(Debug)]
struct ClientEntry {
    info: ClientInfo,
    subs: BTreeSet<SubRef>,
}

/// Connected clients and the subscriptions each one owns.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientEntry>> {
        // Entries hold plain data, a poisoned lock still holds a usable map.
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a client; fails if the id is already connected.
    pub fn register(&self, info: ClientInfo) -> Result<()> {
        let mut clients = self.lock();
        if clients.contains_key(&info.id) {
            return Err(BrokerError::already_exists("client", info.id));
        }
        clients.insert(
            info.id.clone(),
            ClientEntry {
                info,
                subs: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Removes a client and returns the subscriptions it owned.
    pub fn unregister(&self, client_id: &str) -> Option<Vec<SubRef>> {
        self.lock()
            .remove(client_id)
            .map(|entry| entry.subs.into_iter().collect())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn add_sub(&self, client_id: &str, channel: &str, sub_id: u64) {
        if let Some(entry) = self.lock().get_mut(client_id) {
            entry.subs.insert((channel.to_string(), sub_id));
        }
    }

    pub fn remove_sub(&self, client_id: &str, channel: &str, sub_id: u64) {
        if let Some(entry) = self.lock().get_mut(client_id) {
            entry.subs.remove(&(channel.to_string(), sub_id));
        }
    }

    /// Drops every reference to subscriptions of `channel`.
    pub fn remove_channel(&self, channel: &str) {
        for entry in self.lock().values_mut() {
            entry.subs.retain(|(name, _)| name != channel);
        }
    }

    pub fn subs(&self, client_id: &str) -> Vec<SubRef> {
        self.lock()
            .get(client_id)
            .map(|entry| entry.subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn infos(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<_> = self.lock().values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn ids(&self) -> Vec<String> {
        self.infos().into_iter().map(|info| info.id).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
