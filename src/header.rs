//! Structured header document carried by every frame.
//!
//! A header is a JSON object with string keys. Two keys are conventional:
//! `transaction` names the message type and `id` carries a correlation
//! identifier. Everything else is opaque to the transport.
//!
//! # Example
//!
//! ```
//! use hachi_nio::Header;
//!
//! let header = Header::with_transaction("GREETINGS").with("id", "G-1");
//! assert_eq!(header.transaction(), Some("GREETINGS"));
//! assert_eq!(header.id(), Some("G-1"));
//! assert!(!header.is_heartbeat());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::id::generate_id;

/// Reserved `transaction` value for keep-alive frames.
pub const HEARTBEAT_TRANSACTION: &str = "HEARTBEAT";

/// Key naming the message type.
pub const TRANSACTION_KEY: &str = "transaction";

/// Key carrying the correlation identifier.
pub const ID_KEY: &str = "id";

/// Label used for heartbeat correlation ids.
const HEARTBEAT_ID_LABEL: &str = "HB";

/// Header document of a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(Map<String, Value>);

impl Header {
    /// Create an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a header with the given `transaction`.
    pub fn with_transaction(transaction: impl Into<String>) -> Self {
        Self::new().with(TRANSACTION_KEY, transaction.into())
    }

    /// Keep-alive header: `{transaction: "HEARTBEAT", type: "REQUEST", id: "HB-..."}`.
    pub fn heartbeat() -> Self {
        Self::with_transaction(HEARTBEAT_TRANSACTION)
            .with("type", "REQUEST")
            .with(ID_KEY, generate_id(HEARTBEAT_ID_LABEL))
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The `transaction` field, if present and a string.
    pub fn transaction(&self) -> Option<&str> {
        self.0.get(TRANSACTION_KEY).and_then(Value::as_str)
    }

    /// The `id` field, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_KEY).and_then(Value::as_str)
    }

    /// Whether this header marks a transport keep-alive frame.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.transaction() == Some(HEARTBEAT_TRANSACTION)
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the underlying JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Parse from UTF-8 JSON bytes. The document must be an object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(serde_json::from_slice(bytes)?))
    }
}

impl From<Map<String, Value>> for Header {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
