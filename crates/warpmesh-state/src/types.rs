//! Domain types stored in and emitted by the state store.

use serde::{Deserialize, Serialize};

use crate::keys;

/// Numeric identifier of a cluster within the mesh.
pub type ClusterId = u32;

// ── Cluster configuration ──────────────────────────────────────────

/// Configuration object a cluster advertises to its peers.
///
/// Stored as JSON under `mesh/cluster-config/<cluster>`. Peers that
/// predate this object simply don't publish it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterConfig {
    pub id: ClusterId,
    #[serde(default)]
    pub capabilities: ClusterCapabilities,
}

/// Feature flags advertised alongside the cluster ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterCapabilities {
    /// The cluster writes a sentinel key per subsystem once its initial
    /// snapshot has been fully published.
    #[serde(default)]
    pub synced_canaries: bool,
    /// Upper bound of connected clusters the publisher was configured
    /// with. Must agree with the local setting when both are known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connected_clusters: Option<u32>,
}

// ── Mirrored subsystems ────────────────────────────────────────────

/// An object type that is published per cluster and mirrored by peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Nodes,
    Services,
    Identities,
    IpCache,
}

impl Subsystem {
    /// Every subsystem, in the order they are synchronized.
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Nodes,
        Subsystem::Services,
        Subsystem::Identities,
        Subsystem::IpCache,
    ];

    /// Short name, also the last segment of the synced canary key.
    pub fn name(self) -> &'static str {
        match self {
            Subsystem::Nodes => "nodes",
            Subsystem::Services => "services",
            Subsystem::Identities => "identities",
            Subsystem::IpCache => "ipcache",
        }
    }

    /// Parse a short name produced by [`Subsystem::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Base key prefix (without cluster segment).
    pub fn base_prefix(self) -> &'static str {
        match self {
            Subsystem::Nodes => keys::NODES_PREFIX,
            Subsystem::Services => keys::SERVICES_PREFIX,
            Subsystem::Identities => keys::IDENTITIES_PREFIX,
            Subsystem::IpCache => keys::IPCACHE_PREFIX,
        }
    }

    /// Prefix under which `cluster` publishes objects of this type,
    /// including the trailing separator.
    pub fn cluster_prefix(self, cluster: &str) -> String {
        format!("{}/{cluster}/", self.base_prefix())
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Store records and events ───────────────────────────────────────

/// A single key-value pair read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// Kind of mutation recorded in an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Put,
    Delete,
}

/// A committed mutation, tagged with the revision that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for `Put`, empty for `Delete`.
    pub value: Vec<u8>,
    pub revision: u64,
}
