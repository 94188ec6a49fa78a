//! Reading and following a remote cluster's advertised configuration.

use std::time::Duration;

use tracing::debug;

use warpmesh_state::{ClusterConfig, keys};

use crate::backend::{RemoteStore, WatchEvent, WatchStream};
use crate::error::MeshResult;

/// What the remote currently advertises under its configuration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLookup {
    Present(ClusterConfig),
    /// No configuration object: a legacy peer.
    Absent,
    /// Content that does not decode; handled like `Absent`.
    Malformed(String),
}

impl ConfigLookup {
    fn decode(raw: &[u8]) -> Self {
        match serde_json::from_slice(raw) {
            Ok(config) => ConfigLookup::Present(config),
            Err(e) => ConfigLookup::Malformed(e.to_string()),
        }
    }
}

/// Live view of `mesh/cluster-config/<cluster>` on a remote store.
pub struct ConfigWatch {
    key: String,
    stream: WatchStream,
}

impl ConfigWatch {
    pub async fn open(remote: &dyn RemoteStore, cluster: &str) -> MeshResult<Self> {
        let key = keys::cluster_config_key(cluster);
        let stream = remote.list_and_watch(key.clone()).await?;
        Ok(Self { key, stream })
    }

    /// Current configuration. When none is listed, wait up to `timeout`
    /// for one to appear before reporting `Absent`.
    pub async fn initial(&mut self, timeout: Duration) -> MeshResult<ConfigLookup> {
        let mut listed = None;
        loop {
            match self.stream.next().await? {
                WatchEvent::Upsert { key, value } if key == self.key => listed = Some(value),
                WatchEvent::Delete { key } if key == self.key => listed = None,
                WatchEvent::ListDone => break,
                // Prefix siblings such as `<cluster>-2`.
                _ => {}
            }
        }

        if let Some(raw) = listed {
            return Ok(ConfigLookup::decode(&raw));
        }
        match tokio::time::timeout(timeout, self.changed()).await {
            Ok(lookup) => lookup,
            Err(_) => {
                debug!(key = %self.key, ?timeout, "no cluster configuration advertised");
                Ok(ConfigLookup::Absent)
            }
        }
    }

    /// Wait for the next edit of the configuration.
    pub async fn changed(&mut self) -> MeshResult<ConfigLookup> {
        loop {
            match self.stream.next().await? {
                WatchEvent::Upsert { key, value } if key == self.key => {
                    return Ok(ConfigLookup::decode(&value));
                }
                WatchEvent::Delete { key } if key == self.key => return Ok(ConfigLookup::Absent),
                _ => {}
            }
        }
    }
}
