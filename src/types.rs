//! Core types shared by the identity, live-query and projection layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved field name under which a record's stable identifier is exposed.
pub const ID_FIELD: &str = "id";

/// Untyped key-value payload of a remote record.
pub type RecordData = serde_json::Map<String, serde_json::Value>;

/// An authenticated identity as reported by the auth provider.
///
/// Identities are never mutated once published. A transition is represented
/// by a new value, so dependents compare them by pointer (`Arc::ptr_eq`).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable opaque identifier used to scope queries.
    pub id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A single record as delivered by the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Identifier assigned by the store.
    pub id: String,
    /// Record payload.
    pub data: RecordData,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, data: RecordData) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Build a record from a JSON object. Non-object values yield an empty payload.
    pub fn from_json(id: impl Into<String>, value: serde_json::Value) -> Self {
        let data = match value {
            serde_json::Value::Object(map) => map,
            _ => RecordData::new(),
        };
        Self::new(id, data)
    }

    /// Payload with the identifier merged in under [`ID_FIELD`].
    ///
    /// The identifier is inserted first, so a payload field of the same name wins.
    pub fn data_with_id(&self) -> RecordData {
        let mut merged = RecordData::new();
        merged.insert(
            ID_FIELD.to_string(),
            serde_json::Value::String(self.id.clone()),
        );
        for (key, value) in &self.data {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// What a reference watches.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// All records of a collection, e.g. `users/u1/orders`.
    Collection(String),
    /// A single record, addressed `collection/id`.
    Document(String),
}

impl Target {
    pub fn path(&self) -> &str {
        match self {
            Target::Collection(path) | Target::Document(path) => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Collection(_) => "collection",
            Target::Document(_) => "document",
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.path())
    }
}

/// An immutable batch of records delivered at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    /// Ordered records of a collection query.
    Collection(Vec<RawRecord>),
    /// The watched document, if it exists.
    Document(Option<RawRecord>),
}

impl Snapshot {
    pub fn kind(&self) -> &'static str {
        match self {
            Snapshot::Collection(_) => "collection",
            Snapshot::Document(_) => "document",
        }
    }

    /// Number of records carried by this snapshot.
    pub fn len(&self) -> usize {
        match self {
            Snapshot::Collection(records) => records.len(),
            Snapshot::Document(record) => usize::from(record.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unique identifier for a live subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
