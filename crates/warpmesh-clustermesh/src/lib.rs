//! warpmesh-clustermesh — connections to the remote clusters of a mesh.
//!
//! Watches a set of cluster descriptors, keeps one connection per remote
//! cluster's state store, arbitrates cluster IDs across the mesh, and
//! mirrors each remote's published objects into local observers.
//!
//! # Architecture
//!
//! ```text
//! ConfigDirectory (descriptor files)
//!   └── DescriptorEvent { Added | Modified | Removed }
//!         └── ClusterMesh
//!               ├── ClusterIdAllocator (cluster ID → cluster name)
//!               └── RemoteCluster (one per descriptor version)
//!                     ├── Dialer::connect → RemoteStore
//!                     ├── ConfigWatch (mesh/cluster-config/<name>)
//!                     ├── Mirror per subsystem → ObjectObserver
//!                     └── canary watch (mesh/synced/<name>/)
//! ```
//!
//! `ClusterMesh::num_ready_clusters` counts instances that are connected,
//! admitted and fully synchronized. A cluster stops counting as soon as
//! it starts closing; its objects are retracted and its ID released
//! before its slot disappears.

pub mod allocator;
pub mod backend;
pub mod backoff;
pub mod cluster_config;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod mesh;
pub mod observer;
pub mod remote;
pub mod sync;

pub use allocator::ClusterIdAllocator;
pub use backend::{Dialer, HttpDialer, LocalDialer, RemoteStore, WatchEvent, WatchStream};
pub use config::MeshConfig;
pub use descriptor::{ClusterDescriptor, ConfigDirectory, DescriptorEvent, DescriptorEventKind};
pub use error::{MeshError, MeshResult};
pub use mesh::ClusterMesh;
pub use observer::{ObjectCache, ObjectObserver, Observers, RemoteObject};
pub use remote::{ClusterState, ClusterStatus, RemoteCluster};
pub use sync::SyncPolicy;
