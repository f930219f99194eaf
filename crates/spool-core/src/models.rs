//! Job argument and snapshot models.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Opaque key/value attribute bag attached to a job at enqueue time.
///
/// Stored as a JSON object. Keys are kept sorted so the serialized form of a
/// given bag is always the same.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArguments(BTreeMap<String, JsonValue>);

impl JobArguments {
    /// Create an empty argument bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Get a value as a string slice, if it is a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<JsonValue>> FromIterator<(K, V)> for JobArguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Outcome of a single job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Fail,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Fail => "fail",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a job handed to observers.
///
/// Carries the identifier only. There is no way back from a snapshot to the
/// stored record, so an observer cannot change queue state through an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSnapshot {
    id: String,
}

impl JobSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}
