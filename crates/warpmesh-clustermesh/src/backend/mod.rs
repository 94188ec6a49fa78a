//! Remote store seam.
//!
//! A [`Dialer`] turns a descriptor into a connected [`RemoteStore`]; the
//! store hands out prefix streams that start with the current listing,
//! mark its end with [`WatchEvent::ListDone`], and then follow changes.
//! A stream that ends or yields an error means the connection is gone.

pub mod http;
pub mod local;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::descriptor::ClusterDescriptor;
use crate::error::{MeshError, MeshResult};

pub use http::HttpDialer;
pub use local::LocalDialer;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Buffer of a single prefix stream.
const STREAM_BUFFER: usize = 256;

/// One item of a prefix stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Upsert { key: String, value: Vec<u8> },
    Delete { key: String },
    /// Everything present when the stream started has been delivered.
    ListDone,
}

/// Receiving half of a prefix stream.
pub struct WatchStream {
    rx: mpsc::Receiver<MeshResult<WatchEvent>>,
}

/// Producer half handed to backend tasks.
pub type WatchSender = mpsc::Sender<MeshResult<WatchEvent>>;

impl WatchStream {
    pub fn channel() -> (WatchSender, WatchStream) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (tx, WatchStream { rx })
    }

    /// Next event. A closed stream is reported as a lost connection.
    pub async fn next(&mut self) -> MeshResult<WatchEvent> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(MeshError::ConnectionLost("watch stream ended".into())),
        }
    }
}

/// A connection to one remote cluster's store.
pub trait RemoteStore: Send + Sync {
    /// List everything under `prefix`, then follow changes.
    fn list_and_watch(&self, prefix: String) -> BoxFuture<'_, MeshResult<WatchStream>>;

    /// Release the connection. Open streams end.
    fn close(&self) -> BoxFuture<'_, MeshResult<()>>;
}

/// Establishes connections from descriptors.
pub trait Dialer: Send + Sync {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ClusterDescriptor,
    ) -> BoxFuture<'a, MeshResult<Arc<dyn RemoteStore>>>;
}
