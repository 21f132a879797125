//! Row filters in `column=op.value` form, e.g. `id=eq.42` or
//! `status=in.(editing,locked)`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            _ => return None,
        })
    }
}

/// A single-column predicate evaluated against a change's row image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.to_string(),
        }
    }

    /// Evaluate against a JSON row. A missing column never matches.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        let actual = scalar_text(actual);

        match self.op {
            FilterOp::Eq => actual == self.value,
            FilterOp::Neq => actual != self.value,
            FilterOp::In => self.in_values().any(|v| v == actual),
            FilterOp::Gt => compare(&actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(&actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }

    fn in_values(&self) -> impl Iterator<Item = &str> {
        self.value
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(str::trim)
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Numeric comparison when both sides parse as numbers, else lexical.
fn compare(actual: &str, expected: &str) -> Option<Ordering> {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(expected)),
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

impl FromStr for RowFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RealtimeError::InvalidFilter(s.to_string());
        let (column, rest) = s.split_once('=').ok_or_else(invalid)?;
        let (op, value) = rest.split_once('.').ok_or_else(invalid)?;
        let op = FilterOp::parse(op).ok_or_else(invalid)?;
        if column.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            column: column.to_string(),
            op,
            value: value.to_string(),
        })
    }
}

impl Serialize for RowFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RowFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
