//! HTTP dialer over the `warpmesh-api` store surface.
//!
//! Connect probes `/healthz` on each endpoint in turn. Streams list a
//! prefix once, then long-poll `/watch` from the listed revision. When the
//! server answers 410 (history compacted) the stream relists and emits
//! the difference against what it already delivered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warpmesh_api::wire::{ApiResponse, ListResponse, WatchResponse};
use warpmesh_state::EventKind;

use super::{BoxFuture, Dialer, RemoteStore, WatchEvent, WatchSender, WatchStream};
use crate::descriptor::ClusterDescriptor;
use crate::error::{MeshError, MeshResult};

type HttpClient = Client<HttpConnector, Empty<Bytes>>;

/// Default server-side long-poll duration.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Dialer for remote clusters served over HTTP.
#[derive(Clone)]
pub struct HttpDialer {
    client: HttpClient,
    connect_timeout: Duration,
    poll_timeout: Duration,
}

impl HttpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            connect_timeout,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Set how long a single watch request may be held by the server.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    async fn probe(&self, base: &str) -> MeshResult<()> {
        let uri = format!("{base}/healthz");
        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("user-agent", "warpmesh/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| MeshError::Http(e.to_string()))?;

        match tokio::time::timeout(self.connect_timeout, self.client.request(req)).await {
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(MeshError::Connect(format!("{uri}: {}", resp.status()))),
            Ok(Err(e)) => Err(MeshError::Connect(format!("{uri}: {e}"))),
            Err(_) => Err(MeshError::Connect(format!("{uri}: timed out"))),
        }
    }
}

impl Dialer for HttpDialer {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ClusterDescriptor,
    ) -> BoxFuture<'a, MeshResult<Arc<dyn RemoteStore>>> {
        Box::pin(async move {
            let mut last_error = MeshError::Connect(format!("cluster {} has no endpoints", descriptor.name));
            for endpoint in &descriptor.endpoints {
                let base = endpoint.trim_end_matches('/').to_string();
                match self.probe(&base).await {
                    Ok(()) => {
                        info!(cluster = %descriptor.name, endpoint = %base, "connected to remote store");
                        let (closed, _) = watch::channel(false);
                        let store: Arc<dyn RemoteStore> = Arc::new(HttpStore {
                            client: self.client.clone(),
                            base,
                            request_timeout: self.connect_timeout + self.poll_timeout,
                            poll_timeout: self.poll_timeout,
                            closed,
                        });
                        return Ok(store);
                    }
                    Err(e) => {
                        debug!(cluster = %descriptor.name, endpoint = %base, error = %e, "endpoint unreachable");
                        last_error = e;
                    }
                }
            }
            Err(last_error)
        })
    }
}

/// Result of a GET against the API.
enum Fetched<T> {
    Data(T),
    Gone,
}

#[derive(Clone)]
struct ApiClient {
    client: HttpClient,
    base: String,
    request_timeout: Duration,
}

impl ApiClient {
    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> MeshResult<Fetched<T>> {
        let uri = format!("{}{path_and_query}", self.base);
        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("user-agent", "warpmesh/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| MeshError::Http(e.to_string()))?;

        let resp = tokio::time::timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| MeshError::ConnectionLost(format!("{uri}: timed out")))?
            .map_err(|e| MeshError::ConnectionLost(format!("{uri}: {e}")))?;

        let status = resp.status();
        if status == StatusCode::GONE {
            return Ok(Fetched::Gone);
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| MeshError::ConnectionLost(e.to_string()))?
            .to_bytes();
        if !status.is_success() {
            return Err(MeshError::Http(format!("{uri}: {status}")));
        }

        let parsed: ApiResponse<T> =
            serde_json::from_slice(&body).map_err(|e| MeshError::Http(e.to_string()))?;
        match parsed.data {
            Some(data) => Ok(Fetched::Data(data)),
            None => Err(MeshError::Http(
                parsed.error.unwrap_or_else(|| "empty response".to_string()),
            )),
        }
    }

    async fn list(&self, prefix: &str) -> MeshResult<(BTreeMap<String, Vec<u8>>, u64)> {
        let path = format!("/api/v1/list?prefix={}", encode_query(prefix));
        let list: ListResponse = match self.get(&path).await? {
            Fetched::Data(list) => list,
            Fetched::Gone => return Err(MeshError::Http("list answered 410".into())),
        };
        let mut entries = BTreeMap::new();
        for entry in list.entries {
            let pair = entry.into_pair().map_err(|e| MeshError::Http(e.to_string()))?;
            entries.insert(pair.key, pair.value);
        }
        Ok((entries, list.revision))
    }
}

struct HttpStore {
    client: HttpClient,
    base: String,
    request_timeout: Duration,
    poll_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl RemoteStore for HttpStore {
    fn list_and_watch(&self, prefix: String) -> BoxFuture<'_, MeshResult<WatchStream>> {
        Box::pin(async move {
            if *self.closed.borrow() {
                return Err(MeshError::ConnectionLost("connection closed".into()));
            }
            let ctx = ApiClient {
                client: self.client.clone(),
                base: self.base.clone(),
                request_timeout: self.request_timeout,
            };
            let (known, revision) = ctx.list(&prefix).await?;

            let (tx, stream) = WatchStream::channel();
            let mut closed = self.closed.subscribe();
            let poll_timeout = self.poll_timeout;

            tokio::spawn(async move {
                tokio::select! {
                    _ = closed.changed() => {}
                    _ = follow(ctx, prefix, known, revision, poll_timeout, tx) => {}
                }
            });
            Ok(stream)
        })
    }

    fn close(&self) -> BoxFuture<'_, MeshResult<()>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            debug!(endpoint = %self.base, "http connection closed");
            Ok(())
        })
    }
}

/// Deliver the initial listing, then long-poll until the stream fails or
/// its receiver goes away.
async fn follow(
    ctx: ApiClient,
    prefix: String,
    mut known: BTreeMap<String, Vec<u8>>,
    mut revision: u64,
    poll_timeout: Duration,
    tx: WatchSender,
) {
    for (key, value) in &known {
        let item = WatchEvent::Upsert {
            key: key.clone(),
            value: value.clone(),
        };
        if tx.send(Ok(item)).await.is_err() {
            return;
        }
    }
    if tx.send(Ok(WatchEvent::ListDone)).await.is_err() {
        return;
    }

    let encoded = encode_query(&prefix);
    loop {
        let path = format!(
            "/api/v1/watch?prefix={encoded}&since={revision}&timeout_ms={}",
            poll_timeout.as_millis()
        );
        let polled = tokio::select! {
            _ = tx.closed() => return,
            polled = ctx.get::<WatchResponse>(&path) => polled,
        };

        let items = match polled {
            Ok(Fetched::Data(resp)) => {
                let mut items = Vec::with_capacity(resp.events.len());
                for wire in resp.events {
                    let event = match wire.into_event() {
                        Ok(event) => event,
                        Err(e) => {
                            let _ = tx.send(Err(MeshError::Http(e.to_string()))).await;
                            return;
                        }
                    };
                    match event.kind {
                        EventKind::Put => {
                            known.insert(event.key.clone(), event.value.clone());
                            items.push(WatchEvent::Upsert {
                                key: event.key,
                                value: event.value,
                            });
                        }
                        EventKind::Delete => {
                            known.remove(&event.key);
                            items.push(WatchEvent::Delete { key: event.key });
                        }
                    }
                }
                revision = revision.max(resp.revision);
                items
            }
            Ok(Fetched::Gone) => {
                warn!(%prefix, since = revision, "watch history compacted, relisting");
                match ctx.list(&prefix).await {
                    Ok((current, rev)) => {
                        let items = relist_diff(&known, &current);
                        known = current;
                        revision = rev;
                        items
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for item in items {
            if tx.send(Ok(item)).await.is_err() {
                return;
            }
        }
    }
}

/// Events turning an already delivered listing into `current`.
fn relist_diff(
    known: &BTreeMap<String, Vec<u8>>,
    current: &BTreeMap<String, Vec<u8>>,
) -> Vec<WatchEvent> {
    let mut items: Vec<WatchEvent> = known
        .keys()
        .filter(|key| !current.contains_key(*key))
        .map(|key| WatchEvent::Delete { key: key.clone() })
        .collect();
    items.extend(
        current
            .iter()
            .filter(|(key, value)| known.get(*key) != Some(*value))
            .map(|(key, value)| WatchEvent::Upsert {
                key: key.clone(),
                value: value.clone(),
            }),
    );
    items
}

/// Percent-encode a query value, keeping `/` readable.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
