//! Sinks for objects mirrored from remote clusters.
//!
//! Each mirrored subsystem has at most one [`ObjectObserver`]. Remote
//! clusters call `on_update` for every object they receive and
//! `on_delete` both for remote deletions and, on teardown, for every
//! object they contributed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use warpmesh_state::Subsystem;

/// An object received from a remote cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteObject {
    pub cluster: String,
    pub subsystem: Subsystem,
    /// Name relative to the cluster's subsystem prefix.
    pub key: String,
    pub value: serde_json::Value,
}

/// Receives mirrored objects for one subsystem.
pub trait ObjectObserver: Send + Sync {
    fn on_update(&self, object: &RemoteObject);
    fn on_delete(&self, object: &RemoteObject);
}

/// Observer per subsystem. Subsystems without one are still mirrored and
/// tracked for readiness.
pub type Observers = HashMap<Subsystem, Arc<dyn ObjectObserver>>;

type CacheKey = (Subsystem, String, String);

/// In-memory view of every object mirrored from every remote cluster.
#[derive(Clone, Default)]
pub struct ObjectCache {
    objects: Arc<Mutex<BTreeMap<CacheKey, serde_json::Value>>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<CacheKey, serde_json::Value>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This cache registered as the observer of every subsystem.
    pub fn observers(&self) -> Observers {
        Subsystem::ALL
            .into_iter()
            .map(|s| (s, Arc::new(self.clone()) as Arc<dyn ObjectObserver>))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Objects of `subsystem` across all clusters.
    pub fn count(&self, subsystem: Subsystem) -> usize {
        self.objects().keys().filter(|(s, _, _)| *s == subsystem).count()
    }

    /// Objects of any subsystem contributed by `cluster`.
    pub fn count_for_cluster(&self, cluster: &str) -> usize {
        self.objects().keys().filter(|(_, c, _)| c == cluster).count()
    }

    pub fn get(&self, subsystem: Subsystem, cluster: &str, key: &str) -> Option<serde_json::Value> {
        self.objects()
            .get(&(subsystem, cluster.to_string(), key.to_string()))
            .cloned()
    }

    /// Every cached object of `subsystem`, ordered by cluster and key.
    pub fn list(&self, subsystem: Subsystem) -> Vec<RemoteObject> {
        self.objects()
            .iter()
            .filter(|((s, _, _), _)| *s == subsystem)
            .map(|((s, cluster, key), value)| RemoteObject {
                cluster: cluster.clone(),
                subsystem: *s,
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

impl ObjectObserver for ObjectCache {
    fn on_update(&self, object: &RemoteObject) {
        self.objects().insert(
            (object.subsystem, object.cluster.clone(), object.key.clone()),
            object.value.clone(),
        );
    }

    fn on_delete(&self, object: &RemoteObject) {
        self.objects()
            .remove(&(object.subsystem, object.cluster.clone(), object.key.clone()));
    }
}
