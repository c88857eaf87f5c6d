use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A fully resolved analytics event, ready for the processed-event sinks.
///
/// Properties are kept in a sorted map so the serialized form is
/// byte-identical across runs for the same input row and rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedEvent {
    /// Id of the log entry this event was derived from.
    #[serde(rename = "id")]
    pub source_id: i64,
    pub name: String,
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<String>,
}

impl ProcessedEvent {
    /// Returns the distinct id, or the given fallback when none was derived.
    pub fn distinct_id_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.distinct_id.as_deref().unwrap_or(fallback)
    }
}
