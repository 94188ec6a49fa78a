//! Cluster mesh error types.

use thiserror::Error;

use warpmesh_state::ClusterId;

/// Errors that can occur while managing remote clusters.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection to remote store lost: {0}")]
    ConnectionLost(String),

    #[error("cluster ID {id} is already in use by cluster {owner}")]
    ClusterIdCollision { id: ClusterId, owner: String },

    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid descriptor {name}: {reason}")]
    Descriptor { name: String, reason: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] warpmesh_state::StateError),
}

pub type MeshResult<T> = Result<T, MeshError>;
