//! Cluster ID allocator — the mesh-wide registry of cluster IDs in use.
//!
//! A remote cluster's ID is chosen by the remote itself; the allocator only
//! arbitrates. It is the single source of truth for collisions: an ID is
//! recorded once its owner's configuration has been validated and removed
//! when the owner tears its session down. The table lock is held only for
//! the map operation itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use warpmesh_state::ClusterId;

use crate::error::{MeshError, MeshResult};

/// Thread-safe `cluster ID → cluster name` registry.
#[derive(Debug, Default)]
pub struct ClusterIdAllocator {
    /// The local cluster's ID and name; never part of the table.
    local: Option<(ClusterId, String)>,
    used: Mutex<HashMap<ClusterId, String>>,
}

impl ClusterIdAllocator {
    /// Empty allocator with no local cluster ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that also refuses the local cluster's ID. An ID of 0
    /// means the local cluster has none.
    pub fn with_local(id: ClusterId, name: &str) -> Self {
        Self {
            local: (id != 0).then(|| (id, name.to_string())),
            used: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ClusterId, String>> {
        // Each critical section is a single map operation, so a poisoned
        // table is still consistent.
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` for `cluster`.
    ///
    /// Reserving an ID the same cluster already holds succeeds without
    /// change. An ID held by another cluster (or by the local cluster) is
    /// reported as a collision and the table is left untouched.
    pub fn reserve(&self, id: ClusterId, cluster: &str) -> MeshResult<()> {
        if let Some((local_id, local_name)) = &self.local {
            if *local_id == id {
                warn!(cluster_id = id, %cluster, "cluster ID collides with the local cluster");
                return Err(MeshError::ClusterIdCollision {
                    id,
                    owner: local_name.clone(),
                });
            }
        }

        let mut used = self.table();
        match used.get(&id) {
            Some(owner) if owner == cluster => Ok(()),
            Some(owner) => {
                warn!(cluster_id = id, %cluster, %owner, "cluster ID already in use");
                Err(MeshError::ClusterIdCollision {
                    id,
                    owner: owner.clone(),
                })
            }
            None => {
                used.insert(id, cluster.to_string());
                debug!(cluster_id = id, %cluster, "cluster ID reserved");
                Ok(())
            }
        }
    }

    /// Release `id`. Releasing an ID that is not reserved is a no-op.
    /// Returns the previous owner, if any.
    pub fn release(&self, id: ClusterId) -> Option<String> {
        let owner = self.table().remove(&id);
        if let Some(owner) = &owner {
            debug!(cluster_id = id, cluster = %owner, "cluster ID released");
        }
        owner
    }

    /// Number of reserved remote cluster IDs.
    pub fn size(&self) -> usize {
        self.table().len()
    }

    /// Whether `id` is currently reserved by a remote cluster.
    pub fn contains(&self, id: ClusterId) -> bool {
        self.table().contains_key(&id)
    }

    /// Cluster currently holding `id`.
    pub fn owner(&self, id: ClusterId) -> Option<String> {
        self.table().get(&id).cloned()
    }

    /// Copy of the whole table, ordered by ID.
    pub fn snapshot(&self) -> BTreeMap<ClusterId, String> {
        self.table()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }
}
