//! ClusterMesh — the set of remote clusters, driven by descriptor events.
//!
//! Every descriptor version gets its own [`RemoteCluster`] instance,
//! identified by a generation number. Replacing or removing a descriptor
//! starts closing the old instance right away (so it stops counting as
//! ready) while its task finishes teardown in the background; the slot is
//! dropped by that task once teardown is complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warpmesh_state::ClusterId;

use crate::allocator::ClusterIdAllocator;
use crate::backend::Dialer;
use crate::config::MeshConfig;
use crate::descriptor::{ClusterDescriptor, DescriptorEvent, DescriptorEventKind};
use crate::observer::Observers;
use crate::remote::{ClusterStatus, MeshContext, RemoteCluster};

struct Slot {
    cluster: Arc<RemoteCluster>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slots {
    /// Every instance that has not finished teardown.
    by_generation: HashMap<u64, Slot>,
    /// Cluster name → generation of its live instance.
    current: HashMap<String, u64>,
}

/// Manages connections to all configured remote clusters.
pub struct ClusterMesh {
    ctx: MeshContext,
    slots: Arc<RwLock<Slots>>,
    next_generation: AtomicU64,
}

impl ClusterMesh {
    pub fn new(config: MeshConfig, dialer: Arc<dyn Dialer>, observers: Observers) -> Self {
        let allocator = ClusterIdAllocator::with_local(config.cluster_id, &config.cluster_name);
        Self {
            ctx: MeshContext {
                config: Arc::new(config),
                allocator: Arc::new(allocator),
                dialer,
                observers: Arc::new(observers),
            },
            slots: Arc::new(RwLock::new(Slots::default())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.ctx.config
    }

    pub fn allocator(&self) -> &Arc<ClusterIdAllocator> {
        &self.ctx.allocator
    }

    /// Start (or replace) the remote cluster described by `descriptor`.
    ///
    /// An identical descriptor is a no-op. A changed one closes the
    /// running instance and starts a fresh one that connects only after
    /// the old one has torn down.
    pub async fn upsert_cluster(&self, descriptor: ClusterDescriptor) {
        let name = descriptor.name.clone();
        if name == self.ctx.config.cluster_name {
            debug!(cluster = %name, "ignoring descriptor of the local cluster");
            return;
        }

        let mut slots = self.slots.write().await;
        if let Some(generation) = slots.current.get(&name) {
            if let Some(slot) = slots.by_generation.get(generation) {
                if slot.cluster.descriptor().fingerprint == descriptor.fingerprint {
                    debug!(cluster = %name, "descriptor unchanged");
                    return;
                }
                slot.cluster.begin_close();
                info!(cluster = %name, generation, "descriptor changed, replacing remote cluster");
            }
        }

        // The newest retiring instance of this name, which itself waits
        // for any older one.
        let predecessor = slots
            .by_generation
            .values()
            .filter(|slot| slot.cluster.name() == name)
            .max_by_key(|slot| slot.cluster.generation())
            .map(|slot| Arc::clone(&slot.cluster));

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cluster = Arc::new(RemoteCluster::new(descriptor, generation, self.ctx.clone()));

        let handle = tokio::spawn({
            let cluster = Arc::clone(&cluster);
            let slots = Arc::clone(&self.slots);
            async move {
                let name = cluster.name().to_string();
                cluster.run(predecessor).await;

                let mut slots = slots.write().await;
                slots.by_generation.remove(&generation);
                if slots.current.get(&name) == Some(&generation) {
                    slots.current.remove(&name);
                }
            }
        });

        slots.current.insert(name.clone(), generation);
        slots.by_generation.insert(
            generation,
            Slot {
                cluster,
                handle: Some(handle),
            },
        );
        info!(cluster = %name, generation, "remote cluster added");
    }

    /// Start tearing down the remote cluster called `name`.
    pub async fn remove_cluster(&self, name: &str) {
        let mut slots = self.slots.write().await;
        let Some(generation) = slots.current.remove(name) else {
            debug!(cluster = %name, "removal of unknown cluster ignored");
            return;
        };
        if let Some(slot) = slots.by_generation.get(&generation) {
            slot.cluster.begin_close();
        }
        info!(cluster = %name, generation, "remote cluster removed");
    }

    /// Apply one descriptor source event.
    pub async fn handle_event(&self, event: DescriptorEvent) {
        match (event.kind, event.descriptor) {
            (DescriptorEventKind::Added | DescriptorEventKind::Modified, Some(descriptor)) => {
                self.upsert_cluster(descriptor).await
            }
            (DescriptorEventKind::Removed, _) => self.remove_cluster(&event.name).await,
            (kind, None) => {
                warn!(cluster = %event.name, ?kind, "descriptor event without descriptor");
            }
        }
    }

    /// Consume descriptor events until the feed ends or `shutdown` fires,
    /// then close every remote cluster.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<DescriptorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(cluster = %self.ctx.config.cluster_name, "cluster mesh started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        self.close().await;
    }

    /// Number of remote clusters currently `Ready`.
    pub async fn num_ready_clusters(&self) -> usize {
        let slots = self.slots.read().await;
        slots
            .by_generation
            .values()
            .filter(|slot| slot.cluster.is_ready())
            .count()
    }

    /// Names of the configured (not retiring) remote clusters.
    pub async fn cluster_names(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        let mut names: Vec<String> = slots.current.keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every instance, retiring ones included, by name then
    /// generation.
    pub async fn cluster_statuses(&self) -> Vec<ClusterStatus> {
        let slots = self.slots.read().await;
        let mut statuses: Vec<ClusterStatus> = slots
            .by_generation
            .values()
            .map(|slot| slot.cluster.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name).then(a.generation.cmp(&b.generation)));
        statuses
    }

    /// Status of the live instance of `name`.
    pub async fn status(&self, name: &str) -> Option<ClusterStatus> {
        let slots = self.slots.read().await;
        let generation = slots.current.get(name)?;
        slots
            .by_generation
            .get(generation)
            .map(|slot| slot.cluster.status())
    }

    /// Cluster IDs currently reserved by remote clusters.
    pub fn used_cluster_ids(&self) -> BTreeMap<ClusterId, String> {
        self.ctx.allocator.snapshot()
    }

    /// Close every remote cluster and wait for all teardowns.
    pub async fn close(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.write().await;
            slots.current.clear();
            slots
                .by_generation
                .values_mut()
                .filter_map(|slot| {
                    slot.cluster.begin_close();
                    slot.handle.take()
                })
                .collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "remote cluster task failed");
            }
        }
        info!(remaining_ids = self.ctx.allocator.size(), "cluster mesh closed");
    }
}
