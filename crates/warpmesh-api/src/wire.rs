//! JSON bodies exchanged between the store API and remote peers.
//!
//! Values travel hex-encoded inside JSON so arbitrary bytes survive the
//! round trip.

use serde::{Deserialize, Serialize};

use warpmesh_state::{EventKind, KvEvent, KvPair};

/// Header carrying the store revision on raw `GET /kv` responses.
pub const REVISION_HEADER: &str = "x-warpmesh-revision";

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// A key-value pair with a hex-encoded value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEntry {
    pub key: String,
    pub value: String,
}

impl WireEntry {
    pub fn into_pair(self) -> Result<KvPair, hex::FromHexError> {
        Ok(KvPair {
            key: self.key,
            value: hex::decode(self.value)?,
        })
    }
}

impl From<KvPair> for WireEntry {
    fn from(pair: KvPair) -> Self {
        Self {
            key: pair.key,
            value: hex::encode(pair.value),
        }
    }
}

/// `GET /list` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub revision: u64,
    pub entries: Vec<WireEntry>,
}

/// A committed mutation as sent to watchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEvent {
    pub kind: EventKind,
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub revision: u64,
}

impl WireEvent {
    pub fn into_event(self) -> Result<KvEvent, hex::FromHexError> {
        Ok(KvEvent {
            kind: self.kind,
            key: self.key,
            value: hex::decode(self.value)?,
            revision: self.revision,
        })
    }
}

impl From<KvEvent> for WireEvent {
    fn from(event: KvEvent) -> Self {
        Self {
            kind: event.kind,
            key: event.key,
            value: hex::encode(event.value),
            revision: event.revision,
        }
    }
}

/// `GET /watch` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct WatchResponse {
    pub revision: u64,
    pub events: Vec<WireEvent>,
}

/// `PUT` / `DELETE /kv` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existed: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_value_is_hex() {
        let wire = WireEntry::from(KvPair {
            key: "k".into(),
            value: b"{}".to_vec(),
        });
        assert_eq!(wire.value, "7b7d");
        assert_eq!(wire.into_pair().unwrap().value, b"{}");
    }

    #[test]
    fn list_envelope_decodes() {
        let body = serde_json::to_vec(&ApiResponse::ok(ListResponse {
            revision: 7,
            entries: vec![WireEntry {
                key: "mesh/a".into(),
                value: "7b7d".into(),
            }],
        }))
        .unwrap();

        let parsed: ApiResponse<ListResponse> = serde_json::from_slice(&body).unwrap();
        assert!(parsed.success);
        assert!(parsed.error.is_none());
        let list = parsed.data.unwrap();
        assert_eq!(list.revision, 7);
        assert_eq!(list.entries[0].key, "mesh/a");

        let failed: ApiResponse<ListResponse> =
            serde_json::from_str(r#"{"success":false,"error":"boom"}"#).unwrap();
        assert!(failed.data.is_none());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn bad_hex_is_rejected() {
        let wire = WireEvent {
            kind: EventKind::Put,
            key: "k".into(),
            value: "zz".into(),
            revision: 1,
        };
        assert!(wire.into_event().is_err());
    }
}
