//! Channel registry: joined password channels and the active selection.
//!
//! Every mutation of the joined set is written through to a `SecureStore`
//! under a fixed key and reloaded on construction, so channels survive
//! restarts. Persistence is best-effort: a failing store is logged and the
//! in-memory registry stays authoritative.
//!
//! Stored record: JSON object mapping normalized channel name to the hex of
//! `key(32) ‖ channel_id(16) ‖ epoch_length_secs(8, BE)`. The active channel
//! name is stored separately as plain UTF-8.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use zeroize::Zeroize;

use meshwire_core::crypto::{normalize_channel_name, ChannelId, ChannelKey, CryptoError};
use meshwire_core::packet::ChannelEncryptedPacket;

use crate::store::SecureStore;

/// Storage key for the persisted channel map.
pub const CHANNELS_STORAGE_KEY: &str = "meshwire.channels.v1";

/// Storage key for the active channel name.
pub const ACTIVE_STORAGE_KEY: &str = "meshwire.active.v1";

const EVENT_CAPACITY: usize = 64;

/// Registry change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Joined(String),
    Left(String),
    ActiveChanged(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel name is empty after normalization")]
    EmptyName,

    #[error("channel name {0:?} contains the reserved '|' separator")]
    ReservedCharacter(String),
}

#[derive(Default)]
struct ChannelState {
    joined: BTreeMap<String, ChannelKey>,
    active: Option<String>,
}

/// Joined channels keyed by normalized name. Clones share the same state.
#[derive(Clone)]
pub struct ChannelRegistry {
    state: Arc<RwLock<ChannelState>>,
    store: Arc<dyn SecureStore>,
    events: broadcast::Sender<ChannelEvent>,
    epoch_length_secs: u64,
}

impl ChannelRegistry {
    /// Create a registry backed by `store`, loading any persisted channels.
    ///
    /// Newly joined channels rotate keys every `epoch_length_secs` (0 = never).
    /// After a reload the persisted active channel is restored if it is still
    /// joined, otherwise the lexicographically first channel is active.
    pub fn new(store: Arc<dyn SecureStore>, epoch_length_secs: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Self {
            state: Arc::new(RwLock::new(ChannelState::default())),
            store,
            events,
            epoch_length_secs,
        };
        registry.load_from_store();
        registry
    }

    /// Join a channel, replacing the key if it was already joined.
    /// Becomes active only when nothing else is.
    pub fn join(&self, name: &str, password: &str) -> Result<ChannelId, ChannelError> {
        let name = normalize_channel_name(name);
        if name.is_empty() {
            return Err(ChannelError::EmptyName);
        }
        if name.contains('|') {
            return Err(ChannelError::ReservedCharacter(name));
        }
        let key = ChannelKey::derive_with_epoch(&name, password, self.epoch_length_secs);
        let channel_id = *key.channel_id();

        let mut events = vec![ChannelEvent::Joined(name.clone())];
        {
            let mut state = self.write_state();
            state.joined.insert(name.clone(), key);
            if state.active.is_none() {
                state.active = Some(name.clone());
                events.push(ChannelEvent::ActiveChanged(Some(name.clone())));
                self.save_active(&state);
            }
            self.save_to_store(&state);
        }

        tracing::info!(channel = %name, id = %hex::encode(&channel_id[..8]), "channel joined");
        self.publish(events);
        Ok(channel_id)
    }

    /// Leave a channel. If it was active, the lexicographically first
    /// remaining channel becomes active. Returns false if it was not joined.
    pub fn leave(&self, name: &str) -> bool {
        let name = normalize_channel_name(name);

        let mut events = Vec::new();
        {
            let mut state = self.write_state();
            if state.joined.remove(&name).is_none() {
                return false;
            }
            events.push(ChannelEvent::Left(name.clone()));
            if state.active.as_deref() == Some(name.as_str()) {
                state.active = state.joined.keys().next().cloned();
                events.push(ChannelEvent::ActiveChanged(state.active.clone()));
                self.save_active(&state);
            }
            self.save_to_store(&state);
        }

        tracing::info!(channel = %name, "channel left");
        self.publish(events);
        true
    }

    /// Make a joined channel active. Returns true if the active channel
    /// changed; unknown names are ignored.
    pub fn select(&self, name: &str) -> bool {
        let name = normalize_channel_name(name);
        {
            let mut state = self.write_state();
            if !state.joined.contains_key(&name) || state.active.as_deref() == Some(name.as_str())
            {
                return false;
            }
            state.active = Some(name.clone());
            self.save_active(&state);
        }

        tracing::debug!(channel = %name, "active channel changed");
        self.publish(vec![ChannelEvent::ActiveChanged(Some(name))]);
        true
    }

    /// Joined channel names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.read_state().joined.keys().cloned().collect()
    }

    pub fn active(&self) -> Option<String> {
        self.read_state().active.clone()
    }

    pub fn key_for(&self, name: &str) -> Option<ChannelKey> {
        self.read_state()
            .joined
            .get(&normalize_channel_name(name))
            .cloned()
    }

    pub fn key_for_active(&self) -> Option<ChannelKey> {
        let state = self.read_state();
        state
            .active
            .as_ref()
            .and_then(|name| state.joined.get(name))
            .cloned()
    }

    /// Seal with the active channel's key. `Ok(None)` when nothing is active.
    pub fn seal_active(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Option<ChannelEncryptedPacket>, CryptoError> {
        match self.key_for_active() {
            Some(key) => key.seal(plaintext, associated_data).map(Some),
            None => Ok(None),
        }
    }

    /// Try every joined key against `packet`. Returns the channel name and
    /// plaintext for the first key that opens it.
    pub fn open_with_known(
        &self,
        packet: &ChannelEncryptedPacket,
        associated_data: &[u8],
    ) -> Option<(String, Vec<u8>)> {
        let state = self.read_state();
        for (name, key) in &state.joined {
            match key.open(packet, associated_data) {
                Ok(Some(plaintext)) => return Some((name.clone(), plaintext)),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(channel = %name, error = %e, "envelope rejected");
                }
            }
        }
        None
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<ChannelEvent>) {
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChannelState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChannelState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChannelRegistry {
    /// Serialize the joined map to the store. Best-effort, logs on failure.
    fn save_to_store(&self, state: &ChannelState) {
        let mut snapshot: BTreeMap<&str, String> = state
            .joined
            .iter()
            .map(|(name, key)| (name.as_str(), hex::encode(&key.to_bytes()[..])))
            .collect();

        let result = serde_json::to_vec_pretty(&snapshot);
        snapshot.values_mut().for_each(|v| v.zeroize());

        match result {
            Ok(mut json) => {
                if let Err(e) = self.store.save(CHANNELS_STORAGE_KEY, &json) {
                    tracing::warn!(error = %e, "failed to persist channels");
                }
                json.zeroize();
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize channels");
            }
        }
    }

    /// Record the active channel name. Best-effort, logs on failure.
    fn save_active(&self, state: &ChannelState) {
        let name = state.active.as_deref().unwrap_or_default();
        if let Err(e) = self.store.save(ACTIVE_STORAGE_KEY, name.as_bytes()) {
            tracing::warn!(error = %e, "failed to persist active channel");
        }
    }

    fn load_active(&self) -> Option<String> {
        match self.store.load(ACTIVE_STORAGE_KEY) {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read active channel");
                None
            }
        }
    }

    /// Load channels from the store. Called once during construction.
    fn load_from_store(&self) {
        let mut bytes = match self.store.load(CHANNELS_STORAGE_KEY) {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted channels");
                return;
            }
        };
        let parsed = serde_json::from_slice::<BTreeMap<String, String>>(&bytes);
        bytes.zeroize();
        let mut map = match parsed {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse persisted channels");
                return;
            }
        };

        let mut state = self.write_state();
        for (name, record) in &map {
            let name = normalize_channel_name(name);
            if name.is_empty() || name.contains('|') {
                continue;
            }
            let key = hex::decode(record)
                .ok()
                .and_then(|mut raw| {
                    let key = ChannelKey::from_bytes(&raw);
                    raw.zeroize();
                    key.ok()
                });
            match key {
                Some(key) => {
                    state.joined.insert(name, key);
                }
                None => {
                    tracing::warn!(channel = %name, "skipping invalid persisted channel");
                }
            }
        }
        map.values_mut().for_each(|v| v.zeroize());

        state.active = self
            .load_active()
            .filter(|name| state.joined.contains_key(name))
            .or_else(|| state.joined.keys().next().cloned());
        if !state.joined.is_empty() {
            tracing::info!(count = state.joined.len(), "loaded persisted channels");
        }
    }
}
