//! warpmesh-state — the key-value store a cluster publishes into.
//!
//! Backed by [redb](https://docs.rs/redb), provides a revisioned key-value
//! store with prefix watches. Every cluster in the mesh runs one; peers
//! mirror its contents (cluster configuration, nodes, services,
//! identities, IP cache entries) into their own local subsystems.
//!
//! # Architecture
//!
//! Values are opaque bytes (JSON documents in practice). Each mutation
//! bumps a store-wide revision that is persisted alongside the data, and
//! is appended to a bounded in-memory event history so watchers can
//! resume from a revision or block until something newer arrives.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc`) and can
//! be shared across async tasks.

pub mod error;
pub mod keys;
pub mod store;
pub mod sync;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, Watch};
pub use sync::SyncStore;
pub use types::*;
