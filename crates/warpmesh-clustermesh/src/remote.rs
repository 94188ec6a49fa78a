//! RemoteCluster — the connection lifecycle of one peer.
//!
//! ```text
//!   Connecting ──► WaitingForConfig ──► (reserve ID) ──► Syncing ──► Ready
//!       ▲                 │                  │              │          │
//!       │ backoff         │ invalid/collide  ▼              │          │
//!       └─── lost ◄───────┴──────────── Failed ◄────────────┘          │
//!                                   (config edit re-admits)            │
//!   any state ──► Closing (descriptor removed or replaced)  ◄──────────┘
//! ```
//!
//! Each connection attempt is a *session*. A session owns the remote
//! handle, the reserved cluster ID and the subsystem watcher tasks; it is
//! always torn down in the same order: stop watchers, retract every
//! contributed object, release the ID, close the connection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use warpmesh_state::{ClusterCapabilities, ClusterId, Subsystem, keys};

use crate::allocator::ClusterIdAllocator;
use crate::backend::{Dialer, RemoteStore, WatchEvent};
use crate::backoff::Backoff;
use crate::cluster_config::{ConfigLookup, ConfigWatch};
use crate::config::MeshConfig;
use crate::descriptor::ClusterDescriptor;
use crate::error::{MeshError, MeshResult};
use crate::observer::{ObjectObserver, Observers, RemoteObject};
use crate::sync::{SyncPolicy, SyncTracker};

/// Everything a remote cluster shares with the rest of the mesh.
#[derive(Clone)]
pub struct MeshContext {
    pub config: Arc<MeshConfig>,
    pub allocator: Arc<ClusterIdAllocator>,
    pub dialer: Arc<dyn Dialer>,
    pub observers: Arc<Observers>,
}

/// Lifecycle state of a remote cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Connecting,
    WaitingForConfig,
    Syncing,
    Ready,
    Failed,
    Closing,
}

/// Point-in-time diagnostics of one remote cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub generation: u64,
    pub state: ClusterState,
    pub cluster_id: Option<ClusterId>,
    pub capabilities: Option<ClusterCapabilities>,
    pub sync_policy: Option<SyncPolicy>,
    /// Why the cluster is `Failed`.
    pub failure: Option<String>,
    pub synced: BTreeMap<Subsystem, bool>,
    /// Objects currently contributed, per subsystem.
    pub objects: BTreeMap<Subsystem, usize>,
    /// Consecutive connection failures.
    pub num_failures: u32,
    pub last_failure: Option<String>,
}

fn unsynced() -> BTreeMap<Subsystem, bool> {
    Subsystem::ALL.into_iter().map(|s| (s, false)).collect()
}

/// Objects contributed by one cluster, by subsystem and relative key.
#[derive(Default)]
struct Ledger {
    objects: BTreeMap<Subsystem, BTreeMap<String, serde_json::Value>>,
}

impl Ledger {
    fn record(&mut self, subsystem: Subsystem, key: &str, value: serde_json::Value) {
        self.objects
            .entry(subsystem)
            .or_default()
            .insert(key.to_string(), value);
    }

    fn forget(&mut self, subsystem: Subsystem, key: &str) -> Option<serde_json::Value> {
        self.objects.get_mut(&subsystem)?.remove(key)
    }

    fn counts(&self) -> BTreeMap<Subsystem, usize> {
        self.objects
            .iter()
            .map(|(s, objects)| (*s, objects.len()))
            .collect()
    }

    fn drain(&mut self) -> Vec<(Subsystem, String, serde_json::Value)> {
        std::mem::take(&mut self.objects)
            .into_iter()
            .flat_map(|(s, objects)| objects.into_iter().map(move |(k, v)| (s, k, v)))
            .collect()
    }
}

fn lock_ledger(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Progress reports from watcher tasks to the lifecycle driver.
enum SyncSignal {
    Listed(Subsystem),
    Canary(Subsystem),
    Lost(MeshError),
}

/// A validated configuration with its ID (if any) reserved.
struct Admission {
    cluster_id: Option<ClusterId>,
    capabilities: ClusterCapabilities,
    policy: SyncPolicy,
}

/// How a session ended.
enum Outcome {
    Closed,
    Reconnect,
    Lost(MeshError),
}

#[derive(Default)]
struct Session {
    remote: Option<Arc<dyn RemoteStore>>,
    cluster_id: Option<ClusterId>,
    watchers: JoinSet<()>,
}

/// One remote cluster instance. Replaced, never patched, when its
/// descriptor changes.
pub struct RemoteCluster {
    descriptor: ClusterDescriptor,
    generation: u64,
    ctx: MeshContext,
    status: Mutex<ClusterStatus>,
    ledger: Arc<Mutex<Ledger>>,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

/// Resolves once `begin_close` has been called.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

impl RemoteCluster {
    pub fn new(descriptor: ClusterDescriptor, generation: u64, ctx: MeshContext) -> Self {
        let status = ClusterStatus {
            name: descriptor.name.clone(),
            generation,
            state: ClusterState::Connecting,
            cluster_id: None,
            capabilities: None,
            sync_policy: None,
            failure: None,
            synced: unsynced(),
            objects: BTreeMap::new(),
            num_failures: 0,
            last_failure: None,
        };
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            descriptor,
            generation,
            ctx,
            status: Mutex::new(status),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            shutdown,
            done,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    fn lock_status(&self) -> MutexGuard<'_, ClusterStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ClusterState {
        self.lock_status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClusterState::Ready
    }

    pub fn status(&self) -> ClusterStatus {
        let mut status = self.lock_status().clone();
        status.objects = lock_ledger(&self.ledger).counts();
        status
    }

    /// Stop counting this cluster and cancel its lifecycle. Teardown
    /// completes asynchronously; see [`RemoteCluster::closed`].
    pub fn begin_close(&self) {
        self.lock_status().state = ClusterState::Closing;
        self.shutdown.send_replace(true);
        debug!(cluster = %self.name(), generation = self.generation, "remote cluster closing");
    }

    /// Whether teardown has fully completed.
    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until teardown has fully completed.
    pub async fn closed(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    fn update_status(&self, f: impl FnOnce(&mut ClusterStatus)) {
        f(&mut self.lock_status());
    }

    /// Closing is terminal; every other transition is allowed.
    fn set_state(&self, state: ClusterState) {
        let mut status = self.lock_status();
        if status.state == ClusterState::Closing {
            return;
        }
        if status.state != state {
            debug!(cluster = %self.name(), from = ?status.state, to = ?state, "remote cluster state changed");
        }
        status.state = state;
        if state != ClusterState::Failed {
            status.failure = None;
        }
    }

    fn fail(&self, reason: &str) {
        warn!(cluster = %self.name(), %reason, "remote cluster failed, waiting for a configuration change");
        self.set_state(ClusterState::Failed);
        self.update_status(|s| {
            if s.state == ClusterState::Failed {
                s.failure = Some(reason.to_string());
            }
        });
    }

    /// Drive the lifecycle until `begin_close`, then tear down.
    ///
    /// A replacement instance does not connect before its predecessor
    /// has retracted everything it published.
    pub(crate) async fn run(self: Arc<Self>, predecessor: Option<Arc<RemoteCluster>>) {
        if let Some(prev) = predecessor {
            debug!(cluster = %self.name(), generation = self.generation, "waiting for previous instance to close");
            prev.closed().await;
        }

        let config = Arc::clone(&self.ctx.config);
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);
        let mut session = Session::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                _ = cancelled(&mut shutdown) => Outcome::Closed,
                outcome = self.drive(&mut session, &mut backoff) => outcome,
            };
            self.teardown(&mut session).await;

            match outcome {
                Outcome::Closed => break,
                Outcome::Reconnect => {
                    info!(cluster = %self.name(), "remote configuration changed, reconnecting");
                }
                Outcome::Lost(e) => {
                    let delay = backoff.next_delay();
                    let failures = backoff.failures();
                    warn!(cluster = %self.name(), error = %e, failures, ?delay, "remote cluster connection failed");
                    self.set_state(ClusterState::Connecting);
                    self.update_status(|s| {
                        s.num_failures = failures;
                        s.last_failure = Some(e.to_string());
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut shutdown) => break,
                    }
                }
            }
        }

        info!(cluster = %self.name(), generation = self.generation, "remote cluster closed");
        self.done.send_replace(true);
    }

    /// One session: connect, admit, synchronize, then stay ready until
    /// something ends it.
    async fn drive(&self, session: &mut Session, backoff: &mut Backoff) -> Outcome {
        let config = &self.ctx.config;

        self.set_state(ClusterState::Connecting);
        // Each endpoint gets its own connect_timeout inside the dialer.
        let attempts = u32::try_from(self.descriptor.endpoints.len().max(1)).unwrap_or(u32::MAX);
        let budget = config.connect_timeout.saturating_mul(attempts);
        let remote = match tokio::time::timeout(budget, self.ctx.dialer.connect(&self.descriptor))
            .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => return Outcome::Lost(e),
            Err(_) => {
                return Outcome::Lost(MeshError::Connect(format!(
                    "timed out after {budget:?} across {attempts} endpoint(s)"
                )));
            }
        };
        session.remote = Some(Arc::clone(&remote));

        self.set_state(ClusterState::WaitingForConfig);
        let mut config_watch = match ConfigWatch::open(remote.as_ref(), self.name()).await {
            Ok(watch) => watch,
            Err(e) => return Outcome::Lost(e),
        };
        let mut lookup = match config_watch.initial(config.config_timeout).await {
            Ok(lookup) => lookup,
            Err(e) => return Outcome::Lost(e),
        };

        let admission = loop {
            match self.admit(session, &lookup) {
                Ok(admission) => break admission,
                Err(e) => {
                    self.fail(&e.to_string());
                    lookup = match config_watch.changed().await {
                        Ok(lookup) => lookup,
                        Err(e) => return Outcome::Lost(e),
                    };
                    info!(cluster = %self.name(), "remote configuration changed, revalidating");
                    self.set_state(ClusterState::WaitingForConfig);
                }
            }
        };

        let mut signals = self.start_watchers(session, &remote, admission.policy);
        let mut tracker = SyncTracker::new(admission.policy, &config.required_subsystems);
        self.update_status(|s| {
            s.cluster_id = admission.cluster_id;
            s.capabilities = Some(admission.capabilities.clone());
            s.sync_policy = Some(admission.policy);
            s.synced = tracker.snapshot();
        });
        self.set_state(ClusterState::Syncing);
        info!(
            cluster = %self.name(),
            cluster_id = ?admission.cluster_id,
            policy = ?admission.policy,
            "remote cluster admitted, synchronizing"
        );
        self.mark_ready_if_synced(&tracker, backoff);

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    match signal {
                        Some(SyncSignal::Listed(subsystem)) => tracker.listing_done(subsystem),
                        Some(SyncSignal::Canary(subsystem)) => tracker.canary_seen(subsystem),
                        Some(SyncSignal::Lost(e)) => return Outcome::Lost(e),
                        None => {
                            return Outcome::Lost(MeshError::ConnectionLost(
                                "subsystem watchers stopped".into(),
                            ));
                        }
                    }
                    self.update_status(|s| s.synced = tracker.snapshot());
                    self.mark_ready_if_synced(&tracker, backoff);
                }
                changed = config_watch.changed() => match changed {
                    Ok(next) if next == lookup => {
                        debug!(cluster = %self.name(), "unchanged cluster configuration republished");
                    }
                    Ok(_) => return Outcome::Reconnect,
                    Err(e) => return Outcome::Lost(e),
                },
            }
        }
    }

    /// Validate the advertised (or fallback) configuration and reserve its
    /// cluster ID. Errors are structural and park the cluster.
    fn admit(&self, session: &mut Session, lookup: &ConfigLookup) -> MeshResult<Admission> {
        let config = &self.ctx.config;
        let (cluster_id, capabilities) = match lookup {
            ConfigLookup::Present(remote) => (Some(remote.id), remote.capabilities.clone()),
            ConfigLookup::Absent => (self.descriptor.cluster_id, ClusterCapabilities::default()),
            ConfigLookup::Malformed(reason) => {
                warn!(cluster = %self.name(), %reason, "malformed cluster configuration, treating as absent");
                (self.descriptor.cluster_id, ClusterCapabilities::default())
            }
        };

        if let (Some(local), Some(remote)) = (
            config.max_connected_clusters,
            capabilities.max_connected_clusters,
        ) {
            if local != remote {
                return Err(MeshError::InvalidConfig(format!(
                    "max_connected_clusters mismatch: local {local}, remote {remote}"
                )));
            }
        }

        match cluster_id {
            Some(id) => {
                if id == 0 || id > config.max_cluster_id {
                    return Err(MeshError::InvalidConfig(format!(
                        "cluster ID {id} outside 1..={}",
                        config.max_cluster_id
                    )));
                }
                self.ctx.allocator.reserve(id, self.name())?;
                session.cluster_id = Some(id);
            }
            None if config.require_cluster_id => {
                return Err(MeshError::InvalidConfig(
                    "no cluster ID advertised or configured".to_string(),
                ));
            }
            None => debug!(cluster = %self.name(), "legacy peer without cluster ID"),
        }

        Ok(Admission {
            cluster_id,
            policy: SyncPolicy::for_capabilities(&capabilities),
            capabilities,
        })
    }

    fn mark_ready_if_synced(&self, tracker: &SyncTracker, backoff: &mut Backoff) {
        if !tracker.all_synced() || self.state() != ClusterState::Syncing {
            return;
        }
        self.set_state(ClusterState::Ready);
        self.update_status(|s| s.num_failures = 0);
        backoff.reset();
        info!(cluster = %self.name(), policy = ?tracker.policy(), "remote cluster ready");
    }

    fn start_watchers(
        &self,
        session: &mut Session,
        remote: &Arc<dyn RemoteStore>,
        policy: SyncPolicy,
    ) -> mpsc::Receiver<SyncSignal> {
        let (tx, rx) = mpsc::channel(32);
        for subsystem in Subsystem::ALL {
            let mirror = Mirror {
                cluster: self.name().to_string(),
                subsystem,
                remote: Arc::clone(remote),
                observer: self.ctx.observers.get(&subsystem).cloned(),
                ledger: Arc::clone(&self.ledger),
                signals: tx.clone(),
            };
            session.watchers.spawn(mirror.run());
        }
        if policy == SyncPolicy::SyncedCanary {
            session
                .watchers
                .spawn(watch_canaries(self.name().to_string(), Arc::clone(remote), tx));
        }
        rx
    }

    async fn teardown(&self, session: &mut Session) {
        session.watchers.shutdown().await;
        let retracted = self.retract();

        if let Some(id) = session.cluster_id.take() {
            self.ctx.allocator.release(id);
        }

        if let Some(remote) = session.remote.take() {
            match tokio::time::timeout(self.ctx.config.connect_timeout, remote.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(cluster = %self.name(), error = %e, "failed to close remote connection"),
                Err(_) => warn!(cluster = %self.name(), "closing remote connection timed out"),
            }
        }

        self.update_status(|s| {
            s.cluster_id = None;
            s.capabilities = None;
            s.sync_policy = None;
            s.synced = unsynced();
        });
        debug!(cluster = %self.name(), retracted, "remote cluster session torn down");
    }

    /// Withdraw every contributed object from its observer.
    fn retract(&self) -> usize {
        let drained = lock_ledger(&self.ledger).drain();
        for (subsystem, key, value) in &drained {
            if let Some(observer) = self.ctx.observers.get(subsystem) {
                observer.on_delete(&RemoteObject {
                    cluster: self.name().to_string(),
                    subsystem: *subsystem,
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        drained.len()
    }
}

/// Mirrors one subsystem of one remote cluster into its observer.
struct Mirror {
    cluster: String,
    subsystem: Subsystem,
    remote: Arc<dyn RemoteStore>,
    observer: Option<Arc<dyn ObjectObserver>>,
    ledger: Arc<Mutex<Ledger>>,
    signals: mpsc::Sender<SyncSignal>,
}

impl Mirror {
    async fn run(self) {
        let prefix = self.subsystem.cluster_prefix(&self.cluster);
        let mut stream = match self.remote.list_and_watch(prefix.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.signals.send(SyncSignal::Lost(e)).await;
                return;
            }
        };

        loop {
            match stream.next().await {
                Ok(WatchEvent::Upsert { key, value }) => self.upsert(&prefix, &key, &value),
                Ok(WatchEvent::Delete { key }) => self.delete(&prefix, &key),
                Ok(WatchEvent::ListDone) => {
                    debug!(cluster = %self.cluster, subsystem = %self.subsystem, "initial listing complete");
                    if self.signals.send(SyncSignal::Listed(self.subsystem)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = self.signals.send(SyncSignal::Lost(e)).await;
                    return;
                }
            }
        }
    }

    fn object(&self, key: &str, value: serde_json::Value) -> RemoteObject {
        RemoteObject {
            cluster: self.cluster.clone(),
            subsystem: self.subsystem,
            key: key.to_string(),
            value,
        }
    }

    fn upsert(&self, prefix: &str, key: &str, raw: &[u8]) {
        let Some(name) = key.strip_prefix(prefix) else {
            return;
        };
        let value: serde_json::Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(cluster = %self.cluster, subsystem = %self.subsystem, key = %name, error = %e, "skipping undecodable object");
                return;
            }
        };

        lock_ledger(&self.ledger).record(self.subsystem, name, value.clone());
        if let Some(observer) = &self.observer {
            observer.on_update(&self.object(name, value));
        }
    }

    fn delete(&self, prefix: &str, key: &str) {
        let Some(name) = key.strip_prefix(prefix) else {
            return;
        };
        let forgotten = lock_ledger(&self.ledger).forget(self.subsystem, name);
        if let (Some(value), Some(observer)) = (forgotten, &self.observer) {
            observer.on_delete(&self.object(name, value));
        }
    }
}

/// Report each synced canary the remote writes.
async fn watch_canaries(
    cluster: String,
    remote: Arc<dyn RemoteStore>,
    signals: mpsc::Sender<SyncSignal>,
) {
    let prefix = keys::synced_prefix(&cluster);
    let mut stream = match remote.list_and_watch(prefix.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = signals.send(SyncSignal::Lost(e)).await;
            return;
        }
    };

    loop {
        match stream.next().await {
            Ok(WatchEvent::Upsert { key, .. }) => {
                let Some(subsystem) = key.strip_prefix(&prefix).and_then(Subsystem::from_name)
                else {
                    continue;
                };
                debug!(%cluster, %subsystem, "synced canary observed");
                if signals.send(SyncSignal::Canary(subsystem)).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = signals.send(SyncSignal::Lost(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use warpmesh_state::{ClusterConfig, StateStore, SyncStore};

    use crate::backend::LocalDialer;
    use crate::observer::ObjectCache;

    struct Fixture {
        store: StateStore,
        cache: ObjectCache,
        ctx: MeshContext,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let dialer = LocalDialer::new();
        dialer.register("remote", store.clone());
        let cache = ObjectCache::new();
        let config = MeshConfig::new("local", 10).with_config_timeout(Duration::from_millis(50));
        let ctx = MeshContext {
            allocator: Arc::new(ClusterIdAllocator::with_local(10, "local")),
            config: Arc::new(config),
            dialer: Arc::new(dialer),
            observers: Arc::new(cache.observers()),
        };
        Fixture { store, cache, ctx }
    }

    fn spawn(ctx: &MeshContext, name: &str) -> (Arc<RemoteCluster>, tokio::task::JoinHandle<()>) {
        let descriptor = ClusterDescriptor::new(name, vec!["local://remote".into()]);
        let cluster = Arc::new(RemoteCluster::new(descriptor, 1, ctx.clone()));
        let handle = tokio::spawn(Arc::clone(&cluster).run(None));
        (cluster, handle)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn publish_nodes(store: &StateStore, cluster: &str, count: usize) -> SyncStore {
        let nodes = SyncStore::new(store.clone(), cluster, Subsystem::Nodes);
        for i in 0..count {
            nodes.upsert(&format!("node{i}"), &json!({ "name": i })).unwrap();
        }
        nodes
    }

    #[tokio::test]
    async fn legacy_peer_becomes_ready_from_listing() {
        let f = fixture();
        publish_nodes(&f.store, "east", 2);

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.is_ready()).await;

        let status = cluster.status();
        assert_eq!(status.cluster_id, None);
        assert_eq!(status.sync_policy, Some(SyncPolicy::ListingComplete));
        assert_eq!(f.cache.count_for_cluster("east"), 2);
        assert_eq!(f.ctx.allocator.size(), 0);

        cluster.begin_close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn canary_capable_peer_waits_for_canaries() {
        let f = fixture();
        f.store
            .set_cluster_config(
                "east",
                &ClusterConfig {
                    id: 3,
                    capabilities: ClusterCapabilities {
                        synced_canaries: true,
                        max_connected_clusters: None,
                    },
                },
            )
            .unwrap();

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.state() == ClusterState::Syncing).await;
        // Listings complete almost immediately; the canaries are still missing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.state(), ClusterState::Syncing);
        assert!(cluster.status().synced.values().all(|synced| !synced));

        for subsystem in Subsystem::ALL {
            SyncStore::new(f.store.clone(), "east", subsystem).synced().unwrap();
        }
        wait_until(|| cluster.is_ready()).await;
        assert!(f.ctx.allocator.contains(3));

        cluster.begin_close();
        handle.await.unwrap();
        assert!(!f.ctx.allocator.contains(3));
    }

    #[tokio::test]
    async fn close_retracts_and_releases() {
        let f = fixture();
        f.store
            .set_cluster_config("east", &ClusterConfig { id: 4, ..Default::default() })
            .unwrap();
        publish_nodes(&f.store, "east", 3);

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.is_ready()).await;
        assert_eq!(cluster.status().objects[&Subsystem::Nodes], 3);

        cluster.begin_close();
        // Not counted as ready from the moment closing starts.
        assert_eq!(cluster.state(), ClusterState::Closing);
        cluster.closed().await;
        handle.await.unwrap();

        assert!(cluster.is_closed());
        assert_eq!(f.cache.len(), 0);
        assert_eq!(f.ctx.allocator.size(), 0);
    }

    #[tokio::test]
    async fn out_of_range_id_fails_until_fixed() {
        let f = fixture();
        f.store
            .set_cluster_config("east", &ClusterConfig { id: 300, ..Default::default() })
            .unwrap();

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.state() == ClusterState::Failed).await;
        assert!(cluster.status().failure.unwrap().contains("300"));
        assert_eq!(f.ctx.allocator.size(), 0);

        f.store
            .set_cluster_config("east", &ClusterConfig { id: 30, ..Default::default() })
            .unwrap();
        wait_until(|| cluster.is_ready()).await;
        assert!(f.ctx.allocator.contains(30));

        cluster.begin_close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn local_id_is_rejected() {
        let f = fixture();
        f.store
            .set_cluster_config("east", &ClusterConfig { id: 10, ..Default::default() })
            .unwrap();

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.state() == ClusterState::Failed).await;

        cluster.begin_close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn required_id_rejects_legacy_peer() {
        let mut f = fixture();
        let config = (*f.ctx.config).clone().with_require_cluster_id(true);
        f.ctx.config = Arc::new(config);

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.state() == ClusterState::Failed).await;

        cluster.begin_close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_max_connected_clusters_fails() {
        let mut f = fixture();
        let config = (*f.ctx.config)
            .clone()
            .with_max_connected_clusters(Some(255));
        f.ctx.config = Arc::new(config);
        f.store
            .set_cluster_config(
                "east",
                &ClusterConfig {
                    id: 5,
                    capabilities: ClusterCapabilities {
                        synced_canaries: false,
                        max_connected_clusters: Some(511),
                    },
                },
            )
            .unwrap();

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.state() == ClusterState::Failed).await;
        assert!(cluster.status().failure.unwrap().contains("max_connected_clusters"));

        cluster.begin_close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_config_falls_back_to_legacy() {
        let f = fixture();
        f.store.put(&keys::cluster_config_key("east"), b"not json").unwrap();
        publish_nodes(&f.store, "east", 2);

        let (cluster, handle) = spawn(&f.ctx, "east");
        wait_until(|| cluster.is_ready()).await;

        let status = cluster.status();
        assert_eq!(status.sync_policy, Some(SyncPolicy::ListingComplete));
        assert_eq!(status.cluster_id, None);
        assert_eq!(f.cache.count_for_cluster("east"), 2);
        assert_eq!(f.ctx.allocator.size(), 0);

        cluster.begin_close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn descriptor_id_is_used_for_legacy_peer() {
        let f = fixture();
        publish_nodes(&f.store, "east", 1);

        let descriptor =
            ClusterDescriptor::new("east", vec!["local://remote".into()]).with_cluster_id(20);
        let cluster = Arc::new(RemoteCluster::new(descriptor, 1, f.ctx.clone()));
        let handle = tokio::spawn(Arc::clone(&cluster).run(None));
        wait_until(|| cluster.is_ready()).await;

        assert_eq!(cluster.status().cluster_id, Some(20));
        assert!(f.ctx.allocator.contains(20));

        cluster.begin_close();
        handle.await.unwrap();
        assert!(!f.ctx.allocator.contains(20));
    }
}
