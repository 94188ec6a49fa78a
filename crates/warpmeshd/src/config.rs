//! warpmeshd.toml parser.
//!
//! Every field is optional; CLI flags are merged on top before the file
//! is resolved into [`Settings`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use warpmesh_clustermesh::MeshConfig;
use warpmesh_clustermesh::config::parse_duration;
use warpmesh_state::ClusterId;

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_DATA_DIR: &str = "/var/lib/warpmesh";
pub const DEFAULT_DESCRIPTORS_DIR: &str = "/etc/warpmesh/clusters";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub cluster_name: Option<String>,
    pub cluster_id: Option<ClusterId>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub descriptors_dir: Option<PathBuf>,
    /// How often the descriptor directory is rescanned, e.g. "1s".
    pub poll_interval: Option<String>,
    pub config_timeout: Option<String>,
    pub connect_timeout: Option<String>,
    pub backoff_base: Option<String>,
    pub backoff_max: Option<String>,
    pub max_cluster_id: Option<ClusterId>,
    pub max_connected_clusters: Option<u32>,
    pub require_cluster_id: Option<bool>,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mesh: MeshConfig,
    pub port: u16,
    pub data_dir: PathBuf,
    pub descriptors_dir: PathBuf,
    pub poll_interval: Duration,
}

fn duration(field: &str, value: Option<&String>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => match parse_duration(raw) {
            Some(d) => Ok(d),
            None => bail!("invalid duration for {field}: {raw:?}"),
        },
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Values set in `overrides` win over values from this file.
    pub fn merge(mut self, overrides: DaemonConfig) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() { self.$field = overrides.$field; })*
            };
        }
        take!(
            cluster_name,
            cluster_id,
            port,
            data_dir,
            descriptors_dir,
            poll_interval,
            config_timeout,
            connect_timeout,
            backoff_base,
            backoff_max,
            max_cluster_id,
            max_connected_clusters,
            require_cluster_id
        );
        self
    }

    pub fn resolve(self) -> Result<Settings> {
        let Some(cluster_name) = self.cluster_name.filter(|n| !n.is_empty()) else {
            bail!("cluster_name is required");
        };
        let defaults = MeshConfig::new(&cluster_name, 0);

        let config_timeout = duration(
            "config_timeout",
            self.config_timeout.as_ref(),
            defaults.config_timeout,
        )?;
        let connect_timeout = duration(
            "connect_timeout",
            self.connect_timeout.as_ref(),
            defaults.connect_timeout,
        )?;
        let backoff_base = duration("backoff_base", self.backoff_base.as_ref(), defaults.backoff_base)?;
        let backoff_max = duration("backoff_max", self.backoff_max.as_ref(), defaults.backoff_max)?;
        if backoff_base > backoff_max {
            bail!("backoff_base ({backoff_base:?}) exceeds backoff_max ({backoff_max:?})");
        }

        let max_cluster_id = self.max_cluster_id.unwrap_or(defaults.max_cluster_id);
        let cluster_id = self.cluster_id.unwrap_or(0);
        if cluster_id > max_cluster_id {
            bail!("cluster_id {cluster_id} exceeds max_cluster_id {max_cluster_id}");
        }

        let mesh = MeshConfig::new(&cluster_name, cluster_id)
            .with_config_timeout(config_timeout)
            .with_connect_timeout(connect_timeout)
            .with_backoff(backoff_base, backoff_max)
            .with_max_cluster_id(max_cluster_id)
            .with_max_connected_clusters(self.max_connected_clusters)
            .with_require_cluster_id(self.require_cluster_id.unwrap_or(false));

        Ok(Settings {
            mesh,
            port: self.port.unwrap_or(DEFAULT_PORT),
            data_dir: self.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.into()),
            descriptors_dir: self
                .descriptors_dir
                .unwrap_or_else(|| DEFAULT_DESCRIPTORS_DIR.into()),
            poll_interval: duration("poll_interval", self.poll_interval.as_ref(), Duration::from_secs(1))?,
        })
    }
}
