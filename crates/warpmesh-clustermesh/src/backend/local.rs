//! In-process dialer over shared `StateStore` handles.
//!
//! Endpoints are registered by name and addressed as `local://<name>` (or
//! just `<name>`) in descriptors. An endpoint can be cut off to simulate a
//! network partition: live streams fail and new connects are refused until
//! it is restored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info};

use warpmesh_state::{EventKind, StateStore};

use super::{BoxFuture, Dialer, RemoteStore, WatchEvent, WatchStream};
use crate::descriptor::ClusterDescriptor;
use crate::error::{MeshError, MeshResult};

struct Endpoint {
    store: StateStore,
    online: bool,
    /// Bumped on every disconnect; connections made before fail.
    severed: watch::Sender<u64>,
}

/// Dialer resolving descriptors to stores living in this process.
#[derive(Clone, Default)]
pub struct LocalDialer {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl LocalDialer {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `store` reachable as `name`.
    pub fn register(&self, name: &str, store: StateStore) {
        let (severed, _) = watch::channel(0);
        self.endpoints().insert(
            name.to_string(),
            Endpoint {
                store,
                online: true,
                severed,
            },
        );
        debug!(endpoint = %name, "local endpoint registered");
    }

    /// Cut `name` off. Returns false if it is not registered.
    pub fn disconnect(&self, name: &str) -> bool {
        match self.endpoints().get_mut(name) {
            Some(endpoint) => {
                endpoint.online = false;
                endpoint.severed.send_modify(|epoch| *epoch += 1);
                info!(endpoint = %name, "local endpoint disconnected");
                true
            }
            None => false,
        }
    }

    /// Make `name` reachable again.
    pub fn reconnect(&self, name: &str) -> bool {
        match self.endpoints().get_mut(name) {
            Some(endpoint) => {
                endpoint.online = true;
                info!(endpoint = %name, "local endpoint reconnected");
                true
            }
            None => false,
        }
    }
}

impl Dialer for LocalDialer {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ClusterDescriptor,
    ) -> BoxFuture<'a, MeshResult<Arc<dyn RemoteStore>>> {
        Box::pin(async move {
            let endpoints = self.endpoints();
            let mut last_error = MeshError::Connect(format!(
                "no registered endpoint for cluster {}",
                descriptor.name
            ));
            for address in &descriptor.endpoints {
                let name = address.strip_prefix("local://").unwrap_or(address);
                let Some(endpoint) = endpoints.get(name) else {
                    continue;
                };
                if !endpoint.online {
                    last_error = MeshError::Connect(format!("endpoint {name} is unreachable"));
                    continue;
                }
                let (closed, _) = watch::channel(false);
                let store: Arc<dyn RemoteStore> = Arc::new(LocalStore {
                    endpoint: name.to_string(),
                    store: endpoint.store.clone(),
                    severed: endpoint.severed.subscribe(),
                    closed,
                });
                return Ok(store);
            }
            Err(last_error)
        })
    }
}

struct LocalStore {
    endpoint: String,
    store: StateStore,
    severed: watch::Receiver<u64>,
    closed: watch::Sender<bool>,
}

impl RemoteStore for LocalStore {
    fn list_and_watch(&self, prefix: String) -> BoxFuture<'_, MeshResult<WatchStream>> {
        Box::pin(async move {
            if *self.closed.borrow() {
                return Err(MeshError::ConnectionLost("connection closed".into()));
            }
            if self.severed.has_changed().unwrap_or(true) {
                return Err(MeshError::ConnectionLost(format!(
                    "endpoint {} disconnected",
                    self.endpoint
                )));
            }

            let mut watch = self.store.watch(&prefix)?;
            let (tx, stream) = WatchStream::channel();
            let mut severed = self.severed.clone();
            let mut closed = self.closed.subscribe();
            let endpoint = self.endpoint.clone();

            tokio::spawn(async move {
                for pair in watch.take_initial() {
                    let item = WatchEvent::Upsert {
                        key: pair.key,
                        value: pair.value,
                    };
                    if tx.send(Ok(item)).await.is_err() {
                        return;
                    }
                }
                if tx.send(Ok(WatchEvent::ListDone)).await.is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = closed.changed() => return,
                        _ = severed.changed() => {
                            let lost = MeshError::ConnectionLost(format!("endpoint {endpoint} disconnected"));
                            let _ = tx.send(Err(lost)).await;
                            return;
                        }
                        event = watch.next() => {
                            let item = match event {
                                Ok(ev) => Ok(match ev.kind {
                                    EventKind::Put => WatchEvent::Upsert { key: ev.key, value: ev.value },
                                    EventKind::Delete => WatchEvent::Delete { key: ev.key },
                                }),
                                Err(e) => Err(MeshError::ConnectionLost(e.to_string())),
                            };
                            let failed = item.is_err();
                            if tx.send(item).await.is_err() || failed {
                                return;
                            }
                        }
                    }
                }
            });

            Ok(stream)
        })
    }

    fn close(&self) -> BoxFuture<'_, MeshResult<()>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            debug!(endpoint = %self.endpoint, "local connection closed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (LocalDialer, StateStore, ClusterDescriptor) {
        let store = StateStore::open_in_memory().unwrap();
        let dialer = LocalDialer::new();
        dialer.register("east", store.clone());
        let descriptor = ClusterDescriptor::new("east", vec!["local://east".into()]);
        (dialer, store, descriptor)
    }

    #[tokio::test]
    async fn lists_then_follows() {
        let (dialer, store, descriptor) = setup();
        store.put("p/a", b"1").unwrap();

        let remote = dialer.connect(&descriptor).await.unwrap();
        let mut stream = remote.list_and_watch("p/".into()).await.unwrap();

        assert_eq!(
            stream.next().await.unwrap(),
            WatchEvent::Upsert {
                key: "p/a".into(),
                value: b"1".to_vec()
            }
        );
        assert_eq!(stream.next().await.unwrap(), WatchEvent::ListDone);

        store.put("p/b", b"2").unwrap();
        store.delete("p/a").unwrap();
        assert!(matches!(stream.next().await.unwrap(), WatchEvent::Upsert { key, .. } if key == "p/b"));
        assert_eq!(
            stream.next().await.unwrap(),
            WatchEvent::Delete { key: "p/a".into() }
        );
    }

    #[tokio::test]
    async fn disconnect_fails_streams_and_connects() {
        let (dialer, _store, descriptor) = setup();
        let remote = dialer.connect(&descriptor).await.unwrap();
        let mut stream = remote.list_and_watch("p/".into()).await.unwrap();
        assert_eq!(stream.next().await.unwrap(), WatchEvent::ListDone);

        assert!(dialer.disconnect("east"));
        assert!(matches!(
            stream.next().await,
            Err(MeshError::ConnectionLost(_))
        ));
        assert!(dialer.connect(&descriptor).await.is_err());
        assert!(remote.list_and_watch("p/".into()).await.is_err());

        assert!(dialer.reconnect("east"));
        assert!(dialer.connect(&descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let (dialer, _store, descriptor) = setup();
        let remote = dialer.connect(&descriptor).await.unwrap();
        let mut stream = remote.list_and_watch("p/".into()).await.unwrap();
        assert_eq!(stream.next().await.unwrap(), WatchEvent::ListDone);

        remote.close().await.unwrap();
        assert!(stream.next().await.is_err());
    }

    #[tokio::test]
    async fn unknown_endpoint_is_refused() {
        let dialer = LocalDialer::new();
        let descriptor = ClusterDescriptor::new("west", vec!["local://west".into()]);
        assert!(matches!(
            dialer.connect(&descriptor).await,
            Err(MeshError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_through_to_next() {
        let (dialer, _east, _) = setup();
        let west = StateStore::open_in_memory().unwrap();
        west.put("p/w", b"1").unwrap();
        dialer.register("west", west);
        assert!(dialer.disconnect("east"));

        let descriptor = ClusterDescriptor::new(
            "east",
            vec!["local://east".into(), "local://west".into()],
        );
        let remote = dialer.connect(&descriptor).await.unwrap();
        let mut stream = remote.list_and_watch("p/".into()).await.unwrap();
        assert!(matches!(stream.next().await.unwrap(), WatchEvent::Upsert { key, .. } if key == "p/w"));

        let only_east = ClusterDescriptor::new("east", vec!["local://east".into()]);
        let err = dialer.connect(&only_east).await.err().unwrap();
        assert!(err.to_string().contains("unreachable"));
    }
}
