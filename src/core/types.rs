use crate::core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the primary-key field every entity may carry.
pub const ID_FIELD: &str = "id";

/// Current (or baseline) values of an entity, keyed by field name.
pub type FieldMap = BTreeMap<String, Value>;

/// Primary-key value of a persisted row. Always positive.
///
/// Serializes as a bare integer; non-positive input is refused on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RowId(i64);

impl RowId {
    /// Non-positive ids mean "no row yet" and normalize to `None`.
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    /// Interprets a stored field value as a row id.
    ///
    /// Positive integers and decimal text are accepted; anything else
    /// (including `Null`) yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Self::new(*i),
            Value::Text(s) => s.trim().parse::<i64>().ok().and_then(Self::new),
            _ => None,
        }
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for RowId {
    type Error = String;

    fn try_from(id: i64) -> std::result::Result<Self, Self::Error> {
        Self::new(id).ok_or_else(|| format!("row id must be positive, got {}", id))
    }
}

impl From<RowId> for i64 {
    fn from(id: RowId) -> Self {
        id.0
    }
}

impl From<RowId> for Value {
    fn from(id: RowId) -> Self {
        Value::Integer(id.0)
    }
}

/// Per-registration handle issued by a repository.
///
/// Tokens come from the repository's own counter and are retired when the
/// entity leaves the repository; they are never derived from addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceToken(pub(crate) u64);

impl InstanceToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an announceable object when it subscribes to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocates a process-wide unique id. Ids are never reused.
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Repository partition: table name plus the identity of the connection it was read through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoKey {
    pub table: String,
    pub connection: String,
}

impl RepoKey {
    pub fn new(table: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            connection: connection.into(),
        }
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.table, self.connection)
    }
}
