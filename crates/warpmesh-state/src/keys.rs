//! Key layout shared by publishers and the mesh.
//!
//! ```text
//! mesh/cluster-config/<cluster>              ClusterConfig (JSON)
//! mesh/state/nodes/v1/<cluster>/<name>       node objects
//! mesh/state/services/v1/<cluster>/<name>    service objects
//! mesh/state/identities/v1/<cluster>/<id>    security identities
//! mesh/state/ip/v1/<cluster>/<prefix>        IP cache entries
//! mesh/synced/<cluster>/<subsystem>          synced canaries
//! ```

pub const CLUSTER_CONFIG_PREFIX: &str = "mesh/cluster-config";
pub const SYNCED_PREFIX: &str = "mesh/synced";

pub const NODES_PREFIX: &str = "mesh/state/nodes/v1";
pub const SERVICES_PREFIX: &str = "mesh/state/services/v1";
pub const IDENTITIES_PREFIX: &str = "mesh/state/identities/v1";
pub const IPCACHE_PREFIX: &str = "mesh/state/ip/v1";

/// Key of the configuration object advertised by `cluster`.
pub fn cluster_config_key(cluster: &str) -> String {
    format!("{CLUSTER_CONFIG_PREFIX}/{cluster}")
}

/// Prefix under which `cluster` writes its synced canaries.
pub fn synced_prefix(cluster: &str) -> String {
    format!("{SYNCED_PREFIX}/{cluster}/")
}

/// Canary key written by `cluster` once `subsystem` is fully published.
pub fn synced_canary_key(cluster: &str, subsystem: &str) -> String {
    format!("{SYNCED_PREFIX}/{cluster}/{subsystem}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_key_under_prefix() {
        let key = synced_canary_key("east", "nodes");
        assert!(key.starts_with(&synced_prefix("east")));
        assert_eq!(key, "mesh/synced/east/nodes");
    }

    #[test]
    fn cluster_config_key_layout() {
        assert_eq!(cluster_config_key("west"), "mesh/cluster-config/west");
    }
}
