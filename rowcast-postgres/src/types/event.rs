use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The mutation kind recorded by a row trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// Returns the lowercase wire name of this kind, as stored in the log table.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(EventKind::Insert),
            "update" => Ok(EventKind::Update),
            "delete" => Ok(EventKind::Delete),
            other => Err(format!("unknown event kind `{other}`")),
        }
    }
}

/// A single row of the event-log table.
///
/// Created by a database trigger, claimed under a row-level lock, and either
/// deleted (delivered) or updated with retry metadata within the same
/// transaction. The serialized shape is the wire format emitted by raw-row
/// sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    #[serde(rename = "row_table_name")]
    pub table: String,
    pub logged_at: DateTime<Utc>,
    pub retries: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_row: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_row: Option<serde_json::Value>,
}

/// A retry-metadata update for one log entry, applied inside the claiming
/// transaction when a delivery or transformation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryUpdate {
    pub id: i64,
    pub retries: i32,
    pub last_error: Option<String>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_kind_round_trips_through_wire_name() {
        for kind in [EventKind::Insert, EventKind::Update, EventKind::Delete] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("truncate".parse::<EventKind>().is_err());
    }

    #[test]
    fn log_entry_serializes_to_wire_shape() {
        let entry = LogEntry {
            id: 7,
            kind: EventKind::Insert,
            table: "users".to_string(),
            logged_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            retries: 0,
            last_error: None,
            last_retry_at: None,
            process_after: None,
            old_row: None,
            new_row: Some(serde_json::json!({"id": 1})),
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["event_type"], "insert");
        assert_eq!(value["row_table_name"], "users");
        assert!(value.get("last_error").is_none());
        assert_eq!(value["new_row"]["id"], 1);
    }
}
