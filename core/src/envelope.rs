//! Debezium change envelope decoding.
//!
//! A change event arrives as an outer JSON envelope whose `payload` carries the operation
//! code and two string-encoded snapshots of the document:
//!
//! ```json
//! {
//!   "schema": { ... },
//!   "payload": {
//!     "op": "u",
//!     "after": "{\"_id\":{\"$oid\":\"abc123\"},\"Name\":\"Alice\",\"Age\":31}",
//!     "before": null
//!   }
//! }
//! ```
//!
//! Decoding is two-stage: this module only produces a [`ChangeEnvelope`] with the snapshots
//! still serialized. Turning a snapshot into a [`User`](crate::User) is the job of
//! [`User::from_json`](crate::User::from_json).

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding an envelope or an entity snapshot.
///
/// Decode errors are deterministic: replaying the same bytes fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The outer envelope is not well-formed JSON of the expected shape
    #[error("Malformed change envelope: {0}")]
    Envelope(String),

    /// The entity snapshot is malformed or lacks its identifier
    #[error("Malformed entity snapshot: {0}")]
    Entity(String),
}

/// The kind of change a CDC event describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `c`: document inserted
    Create,
    /// `u`: document updated
    Update,
    /// `r`: document read during an initial snapshot
    Read,
    /// `d`: document deleted
    Delete,
    /// Any other code, kept verbatim for logging. A missing `op` maps to an empty code.
    Unknown(String),
}

impl Operation {
    /// Map a Debezium operation code to an [`Operation`].
    ///
    /// # Example
    ///
    /// ```
    /// use user_sync_core::Operation;
    ///
    /// assert_eq!(Operation::from_code(Some("c")), Operation::Create);
    /// assert_eq!(Operation::from_code(Some("t")), Operation::Unknown("t".to_string()));
    /// assert_eq!(Operation::from_code(None), Operation::Unknown(String::new()));
    /// ```
    #[must_use]
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("c") => Self::Create,
            Some("u") => Self::Update,
            Some("r") => Self::Read,
            Some("d") => Self::Delete,
            other => Self::Unknown(other.unwrap_or_default().to_string()),
        }
    }

    /// The wire code for this operation.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Create => "c",
            Self::Update => "u",
            Self::Read => "r",
            Self::Delete => "d",
            Self::Unknown(code) => code,
        }
    }

    /// Whether this operation carries a post-image that should be upserted.
    #[must_use]
    pub const fn is_upsert(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Read)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Read => f.write_str("read"),
            Self::Delete => f.write_str("delete"),
            Self::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// A decoded change event with its snapshots still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEnvelope {
    /// What happened to the document
    pub operation: Operation,
    /// Serialized post-change document (create, update, read)
    pub after: Option<String>,
    /// Serialized pre-change document (delete)
    pub before: Option<String>,
}

impl ChangeEnvelope {
    /// Decode a raw message payload.
    ///
    /// Returns `Ok(None)` for an envelope that parses but carries no payload (a `null` or
    /// missing `payload`, a JSON `null` document, or an empty message body such as a Kafka
    /// tombstone). Callers skip those rather than treating them as failures.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Envelope`] if the bytes are not a JSON object of the expected
    /// shape.
    ///
    /// # Example
    ///
    /// ```
    /// use user_sync_core::{ChangeEnvelope, Operation};
    ///
    /// let raw = br#"{"payload":{"op":"d","before":"{}"}}"#;
    /// let envelope = ChangeEnvelope::decode(raw).unwrap().unwrap();
    /// assert_eq!(envelope.operation, Operation::Delete);
    /// assert_eq!(envelope.before.as_deref(), Some("{}"));
    ///
    /// assert_eq!(ChangeEnvelope::decode(br#"{"payload":null}"#).unwrap(), None);
    /// ```
    pub fn decode(raw: &[u8]) -> Result<Option<Self>, DecodeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let wire: Option<WireEnvelope> =
            serde_json::from_slice(raw).map_err(|e| DecodeError::Envelope(e.to_string()))?;

        let Some(payload) = wire.and_then(|envelope| envelope.payload) else {
            return Ok(None);
        };

        Ok(Some(Self {
            operation: Operation::from_code(payload.op.as_deref()),
            after: payload.after.and_then(Snapshot::into_raw),
            before: payload.before.and_then(Snapshot::into_raw),
        }))
    }

    /// The snapshot relevant to this envelope's operation: `after` for create/update/read,
    /// `before` for delete, nothing for unknown operations.
    ///
    /// `None` also when the snapshot is absent or encodes JSON `null`, which is what the
    /// MongoDB connector sends as the `before` of a delete without pre-images.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        match self.operation {
            Operation::Create | Operation::Update | Operation::Read => self.after.as_deref(),
            Operation::Delete => self.before.as_deref(),
            Operation::Unknown(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default, alias = "Payload")]
    payload: Option<WirePayload>,
}

#[derive(Deserialize)]
struct WirePayload {
    #[serde(default, alias = "Op")]
    op: Option<String>,
    #[serde(default, alias = "After")]
    after: Option<Snapshot>,
    #[serde(default, alias = "Before")]
    before: Option<Snapshot>,
}

/// Snapshots are string-encoded JSON on the wire; some connector configurations emit
/// them inline as objects instead. An encoded `"null"` means no snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum Snapshot {
    Encoded(String),
    Inline(Map<String, Value>),
}

impl Snapshot {
    fn into_raw(self) -> Option<String> {
        match self {
            Self::Encoded(raw) if raw.trim() == "null" => None,
            Self::Encoded(raw) => Some(raw),
            Self::Inline(object) => Some(Value::Object(object).to_string()),
        }
    }
}
