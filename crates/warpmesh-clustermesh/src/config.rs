//! Runtime configuration of the cluster mesh.

use std::time::Duration;

use warpmesh_state::{ClusterId, Subsystem};

/// Highest cluster ID accepted by default.
pub const DEFAULT_MAX_CLUSTER_ID: ClusterId = 255;

/// Configuration shared by the mesh manager and every remote cluster.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Name of the local cluster. Descriptors with this name are ignored.
    pub cluster_name: String,
    /// ID of the local cluster; 0 when the local cluster has none.
    pub cluster_id: ClusterId,
    /// How long to wait for an absent remote configuration object to
    /// appear before treating the peer as a legacy cluster.
    pub config_timeout: Duration,
    /// Upper bound on establishing (and closing) a remote connection.
    pub connect_timeout: Duration,
    /// First reconnect delay after a connection failure.
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    pub backoff_max: Duration,
    /// Highest cluster ID a remote may advertise.
    pub max_cluster_id: ClusterId,
    /// When set, remotes advertising a different value are rejected.
    pub max_connected_clusters: Option<u32>,
    /// Reject legacy peers that have no ID from any source.
    pub require_cluster_id: bool,
    /// Subsystems that must be synchronized before a cluster is ready.
    pub required_subsystems: Vec<Subsystem>,
}

impl MeshConfig {
    /// Defaults for a local cluster called `cluster_name`.
    pub fn new(cluster_name: &str, cluster_id: ClusterId) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            cluster_id,
            config_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_cluster_id: DEFAULT_MAX_CLUSTER_ID,
            max_connected_clusters: None,
            require_cluster_id: false,
            required_subsystems: Subsystem::ALL.to_vec(),
        }
    }

    /// Set the bounded wait for an absent remote configuration.
    pub fn with_config_timeout(mut self, timeout: Duration) -> Self {
        self.config_timeout = timeout;
        self
    }

    /// Set the connect/close timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect backoff range.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_max_cluster_id(mut self, max: ClusterId) -> Self {
        self.max_cluster_id = max;
        self
    }

    pub fn with_max_connected_clusters(mut self, max: Option<u32>) -> Self {
        self.max_connected_clusters = max;
        self
    }

    pub fn with_require_cluster_id(mut self, require: bool) -> Self {
        self.require_cluster_id = require;
        self
    }

    pub fn with_required_subsystems(mut self, subsystems: Vec<Subsystem>) -> Self {
        self.required_subsystems = subsystems;
        self
    }
}

/// Parse durations written as "250ms", "2s", or "5m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration(" 10s "), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("12"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
        assert_eq!(
            parse_duration(&format!("{}m", u64::MAX / 60)),
            Some(Duration::from_secs(u64::MAX / 60 * 60))
        );
    }

    #[test]
    fn defaults_require_every_subsystem() {
        let config = MeshConfig::new("local", 1);
        assert_eq!(config.required_subsystems.len(), 4);
        assert_eq!(config.max_cluster_id, 255);
        assert!(!config.require_cluster_id);
    }
}
