//! Row-change payloads.
//!
//! Inbound payloads arrive as loosely-typed JSON. They are validated once at
//! the boundary into [`ChangeEvent`], whose shape guarantees that an insert
//! carries a new row, a delete carries an old row, and an update carries at
//! least the new row.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use realtyops_core::types::{DbId, Timestamp};

use crate::error::RealtimeError;

// ---------------------------------------------------------------------------
// ChangeKind / EventFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(RealtimeError::InvalidPayload(format!(
                "unknown change type '{other}'"
            ))),
        }
    }
}

/// Which change kinds a subscription or listener wants. `*` matches all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(wanted) => *wanted == kind,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => f.write_str("*"),
            EventFilter::Only(kind) => kind.fmt(f),
        }
    }
}

impl FromStr for EventFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(EventFilter::All)
        } else {
            s.parse().map(EventFilter::Only)
        }
    }
}

impl From<ChangeKind> for EventFilter {
    fn from(kind: ChangeKind) -> Self {
        EventFilter::Only(kind)
    }
}

impl Serialize for EventFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// Wire shape of a change notification before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawChange {
    #[serde(rename = "type", alias = "eventType")]
    pub kind: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
    #[serde(default)]
    pub commit_timestamp: Option<Timestamp>,
}

/// A validated row change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub new: Option<serde_json::Value>,
    pub old: Option<serde_json::Value>,
    pub commit_timestamp: Option<Timestamp>,
}

fn present(value: Option<serde_json::Value>) -> Option<serde_json::Value> {
    value.filter(|v| !v.is_null())
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = RealtimeError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        let kind: ChangeKind = raw.kind.parse()?;
        if raw.table.is_empty() {
            return Err(RealtimeError::InvalidPayload("missing table".into()));
        }
        let new = present(raw.new);
        let old = present(raw.old);

        match kind {
            ChangeKind::Insert | ChangeKind::Update if new.is_none() => {
                return Err(RealtimeError::InvalidPayload(format!(
                    "{kind} on {} without a new row",
                    raw.table
                )));
            }
            ChangeKind::Delete if old.is_none() => {
                return Err(RealtimeError::InvalidPayload(format!(
                    "DELETE on {} without an old row",
                    raw.table
                )));
            }
            _ => {}
        }

        Ok(Self {
            kind,
            table: raw.table,
            new,
            old,
            commit_timestamp: raw.commit_timestamp,
        })
    }
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            new: Some(new),
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn update(table: impl Into<String>, new: serde_json::Value, old: Option<serde_json::Value>) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            new: Some(new),
            old,
            commit_timestamp: None,
        }
    }

    pub fn delete(table: impl Into<String>, old: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            new: None,
            old: Some(old),
            commit_timestamp: None,
        }
    }

    pub fn at(mut self, commit_timestamp: Timestamp) -> Self {
        self.commit_timestamp = Some(commit_timestamp);
        self
    }

    /// Parse and validate a JSON notification payload.
    pub fn from_json(payload: &str) -> Result<Self, RealtimeError> {
        let raw: RawChange = serde_json::from_str(payload)
            .map_err(|e| RealtimeError::InvalidPayload(e.to_string()))?;
        raw.try_into()
    }

    /// The row image a filter is evaluated against: the new row, or the old
    /// row for deletes.
    pub fn row(&self) -> Option<&serde_json::Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// The `id` column of the changed row, when numeric.
    pub fn row_id(&self) -> Option<DbId> {
        self.row()?.get("id")?.as_i64()
    }

    /// Identity used to drop repeated deliveries of the same change.
    ///
    /// Changes without a commit timestamp are keyed by `received_at`.
    pub fn dedup_key(&self, received_at: Timestamp) -> String {
        let at = self.commit_timestamp.unwrap_or(received_at).to_rfc3339();
        let row = self.row().map(|r| r.to_string()).unwrap_or_default();
        format!("{}_{}_{}_{}", self.table, self.kind, at, row)
    }
}
