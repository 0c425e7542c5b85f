//! Remote handles: the serializable reference to a value living on the server.

use serde::{Deserialize, Serialize};

use crate::payload::ArrayPayload;

/// Backend-defined shape/type description of a value.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Identifier of a value in the server's variable table.
///
/// Minted from UUID v4 so ids never collide across clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(String);

impl HandleId {
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HandleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    #[default]
    Remote,
}

/// Inline value carried by a handle.
///
/// Arrays are recognised by their `elementType`/`shape`/`bytes` fields;
/// any other JSON is a plain literal (numbers, strings, shapes, urls).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Array(ArrayPayload),
    Literal(serde_json::Value),
}

/// Reference to a server-side value, optionally carrying it inline.
///
/// With a payload the receiver decodes the value instead of looking it up.
/// A `null` payload means "look up `id` in the variable table".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteHandle {
    #[serde(default)]
    pub kind: HandleKind,
    pub id: HandleId,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl RemoteHandle {
    pub fn new(id: HandleId, metadata: Metadata) -> Self {
        Self {
            kind: HandleKind::Remote,
            id,
            metadata,
            payload: None,
        }
    }

    /// Handle under a fresh id carrying `payload` inline.
    pub fn array(payload: ArrayPayload) -> Self {
        Self::new(HandleId::mint(), payload.metadata()).with_payload(Payload::Array(payload))
    }

    /// Handle under a fresh id carrying a JSON literal inline.
    pub fn literal(value: serde_json::Value) -> Self {
        Self::new(HandleId::mint(), Metadata::new()).with_payload(Payload::Literal(value))
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Same handle without its inline payload.
    pub fn into_reference(mut self) -> Self {
        self.payload = None;
        self
    }

    pub fn stripped(&self) -> Self {
        Self {
            kind: self.kind,
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            payload: None,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.payload.is_none()
    }
}
