//! Parsing of raw notification payloads into [`ChangeEvent`]s.
//!
//! Wire shape, as produced by the notify trigger:
//!
//! ```json
//! { "timestamp": "2024-05-01T10:20:30.123456+00:00",
//!   "operation": "INSERT" | "UPDATE" | "DELETE",
//!   "schema": "public",
//!   "table": "orders",
//!   "record": { "id": "7", "status": "paid" } }
//! ```

use chrono::{DateTime, Utc};
use pgcache_core::{ChangeEvent, ChangeOperation, ParseError};
use serde_json::{Map, Value};

/// Postgres text output for `timestamptz`.
const PG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// Normalizes notification payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeEventParser;

impl ChangeEventParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a payload string as delivered by `NOTIFY`.
    pub fn parse(&self, raw: &str) -> Result<ChangeEvent, ParseError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson {
            reason: e.to_string(),
        })?;
        self.parse_value(value)
    }

    /// Parse an already decoded payload.
    pub fn parse_value(&self, value: Value) -> Result<ChangeEvent, ParseError> {
        let mut object = match value {
            Value::Object(map) => map,
            other => {
                return Err(ParseError::InvalidJson {
                    reason: format!("expected object, got {}", kind_of(&other)),
                })
            }
        };

        let timestamp = parse_timestamp(take(&mut object, "timestamp")?)?;
        let operation = match take(&mut object, "operation")? {
            Value::String(s) => s.parse::<ChangeOperation>()?,
            other => {
                return Err(ParseError::InvalidOperation {
                    value: other.to_string(),
                })
            }
        };
        let schema = take_string(&mut object, "schema")?;
        let table = take_string(&mut object, "table")?;
        let record = match object.remove("record").unwrap_or(Value::Null) {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ParseError::InvalidRecord {
                    kind: kind_of(&other).to_string(),
                })
            }
        };

        Ok(ChangeEvent {
            timestamp,
            operation,
            schema,
            table,
            record,
        })
    }
}

/// Coerce a timestamp field to an instant.
///
/// Accepts RFC 3339 text, Postgres `timestamptz` text, or integer epoch
/// milliseconds.
pub fn parse_timestamp(value: Value) -> Result<DateTime<Utc>, ParseError> {
    match &value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .or_else(|_| DateTime::parse_from_str(s, PG_TIMESTAMP_FORMAT))
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ParseError::InvalidTimestamp {
                    value: s.to_string(),
                })
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| ParseError::InvalidTimestamp {
                value: n.to_string(),
            }),
        other => Err(ParseError::InvalidTimestamp {
            value: other.to_string(),
        }),
    }
}

fn take(object: &mut Map<String, Value>, field: &str) -> Result<Value, ParseError> {
    match object.remove(field) {
        Some(Value::Null) | None => Err(ParseError::MissingField {
            field: field.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn take_string(object: &mut Map<String, Value>, field: &str) -> Result<String, ParseError> {
    match take(object, field)? {
        Value::String(s) => Ok(s),
        other => Err(ParseError::InvalidJson {
            reason: format!("field {} must be a string, got {}", field, kind_of(&other)),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
