//! Descriptor source — one TOML file per remote cluster in a directory.
//!
//! ```toml
//! # <config-dir>/cluster2
//! endpoints = ["http://10.0.2.1:7400"]
//! cluster_id = 2   # optional, fallback for peers without a config object
//! ```
//!
//! The file name is the cluster name. Any change to a file's bytes is a
//! modification, detected by SHA-256 fingerprint.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use warpmesh_state::ClusterId;

use crate::error::{MeshError, MeshResult};

/// Default directory poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Named connection parameters of one remote cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub name: String,
    /// Store endpoints, tried in order.
    pub endpoints: Vec<String>,
    /// Operator-provided ID, used only when the remote advertises none.
    pub cluster_id: Option<ClusterId>,
    /// Hex SHA-256 of the descriptor source.
    pub fingerprint: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFile {
    #[serde(default)]
    endpoints: Vec<String>,
    cluster_id: Option<ClusterId>,
}

fn fingerprint(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

impl ClusterDescriptor {
    /// Build a descriptor in code (tests, embedding).
    pub fn new(name: &str, endpoints: Vec<String>) -> Self {
        let fp = fingerprint(format!("{name}\n{}", endpoints.join("\n")).as_bytes());
        Self {
            name: name.to_string(),
            endpoints,
            cluster_id: None,
            fingerprint: fp,
        }
    }

    pub fn with_cluster_id(mut self, id: ClusterId) -> Self {
        self.cluster_id = Some(id);
        let fp = fingerprint(format!("{}{id}", self.fingerprint).as_bytes());
        self.fingerprint = fp;
        self
    }

    /// Parse the TOML content of a descriptor file.
    pub fn parse(name: &str, content: &str) -> MeshResult<Self> {
        let file: DescriptorFile = toml::from_str(content).map_err(|e| MeshError::Descriptor {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        if file.endpoints.is_empty() {
            return Err(MeshError::Descriptor {
                name: name.to_string(),
                reason: "no endpoints".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            endpoints: file.endpoints,
            cluster_id: file.cluster_id,
            fingerprint: fingerprint(content.as_bytes()),
        })
    }
}

/// What happened to a descriptor between two listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorEventKind {
    Added,
    Modified,
    Removed,
}

/// A single change in the descriptor set.
#[derive(Debug, Clone)]
pub struct DescriptorEvent {
    pub kind: DescriptorEventKind,
    pub name: String,
    /// New content; `None` for `Removed`.
    pub descriptor: Option<ClusterDescriptor>,
}

impl DescriptorEvent {
    pub fn added(descriptor: ClusterDescriptor) -> Self {
        Self {
            kind: DescriptorEventKind::Added,
            name: descriptor.name.clone(),
            descriptor: Some(descriptor),
        }
    }

    pub fn modified(descriptor: ClusterDescriptor) -> Self {
        Self {
            kind: DescriptorEventKind::Modified,
            name: descriptor.name.clone(),
            descriptor: Some(descriptor),
        }
    }

    pub fn removed(name: &str) -> Self {
        Self {
            kind: DescriptorEventKind::Removed,
            name: name.to_string(),
            descriptor: None,
        }
    }
}

/// Events turning `old` into `new`, ordered by cluster name.
pub fn diff(
    old: &HashMap<String, ClusterDescriptor>,
    new: &HashMap<String, ClusterDescriptor>,
) -> Vec<DescriptorEvent> {
    let mut names: BTreeMap<&str, ()> = BTreeMap::new();
    names.extend(old.keys().map(|k| (k.as_str(), ())));
    names.extend(new.keys().map(|k| (k.as_str(), ())));

    names
        .into_keys()
        .filter_map(|name| match (old.get(name), new.get(name)) {
            (None, Some(d)) => Some(DescriptorEvent::added(d.clone())),
            (Some(_), None) => Some(DescriptorEvent::removed(name)),
            (Some(prev), Some(d)) if prev.fingerprint != d.fingerprint => {
                Some(DescriptorEvent::modified(d.clone()))
            }
            _ => None,
        })
        .collect()
}

/// A directory of descriptor files.
#[derive(Debug, Clone)]
pub struct ConfigDirectory {
    path: PathBuf,
    poll_interval: Duration,
}

impl ConfigDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every valid descriptor currently in the directory.
    pub fn list(&self) -> MeshResult<HashMap<String, ClusterDescriptor>> {
        let mut descriptors = HashMap::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }

            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(cluster = %name, error = %e, "unreadable cluster descriptor");
                    continue;
                }
            };
            match ClusterDescriptor::parse(&name, &content) {
                Ok(d) => {
                    descriptors.insert(name, d);
                }
                Err(e) => warn!(cluster = %name, error = %e, "ignoring invalid cluster descriptor"),
            }
        }
        Ok(descriptors)
    }

    /// Poll the directory until `shutdown` fires.
    ///
    /// The first batch reports every descriptor present as `Added`.
    pub fn watch(&self, mut shutdown: watch::Receiver<bool>) -> mpsc::Receiver<DescriptorEvent> {
        let (tx, rx) = mpsc::channel(64);
        let dir = self.clone();

        tokio::spawn(async move {
            let mut known = HashMap::new();
            info!(path = %dir.path.display(), "watching cluster descriptors");

            loop {
                let listing = {
                    let dir = dir.clone();
                    tokio::task::spawn_blocking(move || dir.list()).await
                };
                match listing {
                    Ok(Ok(current)) => {
                        for event in diff(&known, &current) {
                            debug!(cluster = %event.name, kind = ?event.kind, "descriptor changed");
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        known = current;
                    }
                    Ok(Err(e)) => {
                        warn!(path = %dir.path.display(), error = %e, "failed to list descriptors")
                    }
                    Err(e) => warn!(error = %e, "descriptor listing task failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(dir.poll_interval) => {}
                    _ = shutdown.changed() => {
                        debug!("descriptor watch shutting down");
                        return;
                    }
                }
            }
        });

        rx
    }
}
