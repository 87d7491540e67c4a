//! Persisted session state.
//!
//! A bencoded dictionary of optional, self-describing sections. Readers
//! ignore unknown keys and unknown sections, so newer writers stay
//! compatible with older readers and vice versa.

use super::settings::SessionSettings;
use crate::bencode::{decode, encode, BencodeError, Value};

/// What the engine persists across runs.
#[derive(Debug, Default)]
pub struct SavedState {
    pub settings: Option<SavedSettings>,
    /// The DHT section (node id and node table), produced by
    /// [`crate::dht::DhtNode::save_state`].
    pub dht_state: Option<Value>,
    /// Tracker key, so the swarm identity survives restarts.
    pub tracker_key: Option<u32>,
}

/// The subset of settings worth persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSettings {
    pub connections_limit: usize,
    pub unchoke_slots: usize,
    pub upload_rate_limit: u64,
    pub download_rate_limit: u64,
    pub active_downloads: i32,
    pub active_seeds: i32,
    pub active_limit: i32,
}

impl SavedSettings {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            connections_limit: settings.connections_limit,
            unchoke_slots: settings.unchoke_slots,
            upload_rate_limit: settings.upload_rate_limit,
            download_rate_limit: settings.download_rate_limit,
            active_downloads: settings.active_downloads,
            active_seeds: settings.active_seeds,
            active_limit: settings.active_limit,
        }
    }

    pub fn apply_to(&self, settings: &mut SessionSettings) {
        settings.connections_limit = self.connections_limit;
        settings.unchoke_slots = self.unchoke_slots;
        settings.upload_rate_limit = self.upload_rate_limit;
        settings.download_rate_limit = self.download_rate_limit;
        settings.active_downloads = self.active_downloads;
        settings.active_seeds = self.active_seeds;
        settings.active_limit = self.active_limit;
    }
}

/// Encodes the state dictionary.
pub fn save_state(state: &SavedState) -> Vec<u8> {
    let mut root = Value::dict();

    if let Some(settings) = &state.settings {
        let mut section = Value::dict();
        section.insert(b"connections_limit", Value::Int(settings.connections_limit as i64));
        section.insert(b"unchoke_slots", Value::Int(settings.unchoke_slots as i64));
        section.insert(b"upload_rate_limit", Value::Int(settings.upload_rate_limit as i64));
        section.insert(
            b"download_rate_limit",
            Value::Int(settings.download_rate_limit as i64),
        );
        section.insert(b"active_downloads", Value::Int(settings.active_downloads as i64));
        section.insert(b"active_seeds", Value::Int(settings.active_seeds as i64));
        section.insert(b"active_limit", Value::Int(settings.active_limit as i64));
        root.insert(b"settings", section);
    }

    if let Some(dht) = &state.dht_state {
        root.insert(b"dht state", dht.clone());
    }

    if let Some(key) = state.tracker_key {
        root.insert(b"key", Value::Int(key as i64));
    }

    encode(&root)
}

/// Decodes a state dictionary, ignoring anything unrecognized
/// (`proxy`, `encryption`, sections from other versions).
pub fn load_state(data: &[u8]) -> Result<SavedState, BencodeError> {
    let root = decode(data)?;
    let mut state = SavedState::default();

    if let Some(section) = root.get(b"settings") {
        let read = |key: &[u8], default: i64| section.get_int(key).unwrap_or(default);
        state.settings = Some(SavedSettings {
            connections_limit: read(b"connections_limit", 200).max(2) as usize,
            unchoke_slots: read(b"unchoke_slots", 8).max(0) as usize,
            upload_rate_limit: read(b"upload_rate_limit", 0).max(0) as u64,
            download_rate_limit: read(b"download_rate_limit", 0).max(0) as u64,
            active_downloads: read(b"active_downloads", 3) as i32,
            active_seeds: read(b"active_seeds", 5) as i32,
            active_limit: read(b"active_limit", 15) as i32,
        });
    }

    if let Some(dht) = root.get(b"dht state") {
        state.dht_state = Some(dht.clone());
    }

    state.tracker_key = root.get_int(b"key").map(|k| k as u32);

    Ok(state)
}
