//! Publisher side of a mirrored subsystem.
//!
//! A cluster publishes its objects under its own per-subsystem prefix and,
//! once the initial snapshot has been fully written, a synced canary.
//! Peers that advertise the `synced_canaries` capability are only
//! considered synchronized after the canary shows up.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::keys;
use crate::store::StateStore;
use crate::types::Subsystem;

/// Writes one cluster's objects of one subsystem into a store.
#[derive(Clone)]
pub struct SyncStore {
    store: StateStore,
    cluster: String,
    subsystem: Subsystem,
}

#[derive(Serialize)]
struct Canary {
    synced_at: u64,
}

impl SyncStore {
    /// Create a publisher for `cluster`'s `subsystem` objects.
    pub fn new(store: StateStore, cluster: &str, subsystem: Subsystem) -> Self {
        Self {
            store,
            cluster: cluster.to_string(),
            subsystem,
        }
    }

    /// Full store key for the object `name`.
    pub fn key_for(&self, name: &str) -> String {
        format!("{}{name}", self.subsystem.cluster_prefix(&self.cluster))
    }

    /// Insert or update an object.
    pub fn upsert<T: Serialize>(&self, name: &str, value: &T) -> StateResult<u64> {
        let raw = serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store.put(&self.key_for(name), &raw)
    }

    /// Remove an object. Returns true if it existed.
    pub fn delete(&self, name: &str) -> StateResult<bool> {
        self.store.delete(&self.key_for(name))
    }

    /// Write the synced canary, certifying the initial snapshot is complete.
    pub fn synced(&self) -> StateResult<u64> {
        let canary = Canary {
            synced_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let raw = serde_json::to_vec(&canary).map_err(|e| StateError::Serialize(e.to_string()))?;
        let key = keys::synced_canary_key(&self.cluster, self.subsystem.name());
        let revision = self.store.put(&key, &raw)?;
        info!(cluster = %self.cluster, subsystem = %self.subsystem, revision, "synced canary written");
        Ok(revision)
    }

    /// Withdraw every object and the canary for this cluster and subsystem.
    pub fn clear(&self) -> StateResult<usize> {
        let removed = self
            .store
            .delete_prefix(&self.subsystem.cluster_prefix(&self.cluster))?;
        self.store
            .delete(&keys::synced_canary_key(&self.cluster, self.subsystem.name()))?;
        debug!(cluster = %self.cluster, subsystem = %self.subsystem, removed, "published objects cleared");
        Ok(removed)
    }
}
