//! Change events emitted by the database trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Row operation that fired the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// All operations, in trigger declaration order.
    pub const ALL: [ChangeOperation; 3] = [
        ChangeOperation::Insert,
        ChangeOperation::Update,
        ChangeOperation::Delete,
    ];

    /// Wire name as written by the trigger (`TG_OP`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeOperation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError::InvalidOperation {
                value: s.to_string(),
            })
    }
}

/// One row change as delivered on a table channel.
///
/// Immutable once parsed; one per trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: ChangeOperation,
    pub schema: String,
    pub table: String,
    pub record: serde_json::Map<String, serde_json::Value>,
}

impl ChangeEvent {
    pub fn new(
        operation: ChangeOperation,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            schema: schema.into(),
            table: table.into(),
            record: serde_json::Map::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_record(mut self, record: serde_json::Map<String, serde_json::Value>) -> Self {
        self.record = record;
        self
    }

    /// Set a single column value on the record.
    pub fn with_column(mut self, column: impl Into<String>, value: serde_json::Value) -> Self {
        self.record.insert(column.into(), value);
        self
    }

    /// Look up a column of the changed row.
    pub fn column(&self, name: &str) -> Option<&serde_json::Value> {
        self.record.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_from_str_is_case_insensitive() {
        assert_eq!("INSERT".parse::<ChangeOperation>(), Ok(ChangeOperation::Insert));
        assert_eq!("update".parse::<ChangeOperation>(), Ok(ChangeOperation::Update));
        assert_eq!(" Delete ".parse::<ChangeOperation>(), Ok(ChangeOperation::Delete));
        assert!(matches!(
            "TRUNCATE".parse::<ChangeOperation>(),
            Err(ParseError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_operation_serde_uses_wire_names() {
        let json = serde_json::to_string(&ChangeOperation::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
        let op: ChangeOperation = serde_json::from_str("\"INSERT\"").unwrap();
        assert_eq!(op, ChangeOperation::Insert);
    }

    #[test]
    fn test_event_column_lookup() {
        let event = ChangeEvent::new(ChangeOperation::Update, "public", "orders")
            .with_column("id", serde_json::json!("7"))
            .with_column("status", serde_json::json!("paid"));
        assert_eq!(event.column("id"), Some(&serde_json::json!("7")));
        assert_eq!(event.column("missing"), None);
        assert_eq!(event.table, "orders");
    }
}
