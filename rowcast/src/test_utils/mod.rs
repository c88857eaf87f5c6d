//! Shared helpers for unit and engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use rowcast_config::TrackingDocument;
use rowcast_postgres::types::{
    ColumnDescriptor, EventKind, FieldType, LogEntry, SchemaDescriptor, TableDescriptor,
};

use crate::destination::{ProcessedEventSink, RawEventSink, SinkEventError};
use crate::error::{ErrorKind, RowcastResult};
use crate::rowcast_error;
use crate::types::ProcessedEvent;

/// A descriptor with the two tables most tests track.
pub fn users_orders_descriptor() -> SchemaDescriptor {
    SchemaDescriptor::new([
        TableDescriptor {
            name: "users".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    field_type: FieldType::I64,
                },
                ColumnDescriptor {
                    name: "email".to_string(),
                    field_type: FieldType::String,
                },
                ColumnDescriptor {
                    name: "password_hash".to_string(),
                    field_type: FieldType::String,
                },
                ColumnDescriptor {
                    name: "metadata".to_string(),
                    field_type: FieldType::Dynamic,
                },
            ],
        },
        TableDescriptor {
            name: "orders".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    field_type: FieldType::I64,
                },
                ColumnDescriptor {
                    name: "user_id".to_string(),
                    field_type: FieldType::I64,
                },
                ColumnDescriptor {
                    name: "status".to_string(),
                    field_type: FieldType::String,
                },
                ColumnDescriptor {
                    name: "total".to_string(),
                    field_type: FieldType::F64,
                },
            ],
        },
    ])
}

/// Parses and validates a tracking document from inline YAML.
pub fn tracking_document(yaml: &str) -> TrackingDocument {
    let mut document: TrackingDocument =
        serde_yaml::from_str(yaml).expect("test yaml must parse");
    document.validate().expect("test yaml must validate");
    document
}

/// A bare log entry; chain the row builders to attach payloads.
pub fn log_entry(id: i64, kind: EventKind, table: &str) -> LogEntry {
    LogEntry {
        id,
        kind,
        table: table.to_string(),
        logged_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        retries: 0,
        last_error: None,
        last_retry_at: None,
        process_after: None,
        old_row: None,
        new_row: None,
    }
}

/// Builder-style helpers on [`LogEntry`] for tests.
pub trait LogEntryExt: Sized {
    fn with_new_row(self, row: serde_json::Value) -> LogEntry;
    fn with_old_row(self, row: serde_json::Value) -> LogEntry;
}

impl LogEntryExt for LogEntry {
    fn with_new_row(mut self, row: serde_json::Value) -> LogEntry {
        self.new_row = Some(row);
        self
    }

    fn with_old_row(mut self, row: serde_json::Value) -> LogEntry {
        self.old_row = Some(row);
        self
    }
}

/// Processed-event sink that fails according to a configured mode.
pub struct FailingEventSink {
    mode: FailureMode,
    calls: AtomicUsize,
    delivered: Mutex<Vec<ProcessedEvent>>,
}

/// How a [`FailingEventSink`] misbehaves.
pub enum FailureMode {
    /// Every call errors as a whole batch.
    WholeBatch,
    /// Specific source ids fail per-event; the rest succeed.
    PerEvent(Vec<i64>),
    /// Delivers normally.
    None,
}

impl FailingEventSink {
    pub fn new(mode: FailureMode) -> Arc<FailingEventSink> {
        Arc::new(FailingEventSink {
            mode,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<ProcessedEvent> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessedEventSink for Arc<FailingEventSink> {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            FailureMode::WholeBatch => Err(rowcast_error!(
                ErrorKind::DestinationError,
                "sink unavailable"
            )),
            FailureMode::PerEvent(failing_ids) => {
                let mut errors = Vec::new();
                for event in events {
                    if failing_ids.contains(&event.source_id) {
                        errors.push(SinkEventError {
                            source_id: event.source_id,
                            error: "event rejected".to_string(),
                        });
                    } else {
                        self.delivered.lock().unwrap().push(event.clone());
                    }
                }
                Ok(errors)
            }
            FailureMode::None => {
                self.delivered.lock().unwrap().extend(events.iter().cloned());
                Ok(Vec::new())
            }
        }
    }
}

/// Raw sink that always fails the whole batch.
pub struct FailingRawSink {
    calls: AtomicUsize,
}

impl FailingRawSink {
    pub fn new() -> Arc<FailingRawSink> {
        Arc::new(FailingRawSink {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RawEventSink for Arc<FailingRawSink> {
    async fn send_batch(&self, _entries: &[LogEntry]) -> RowcastResult<Vec<SinkEventError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(rowcast_error!(
            ErrorKind::DestinationError,
            "raw sink unavailable"
        ))
    }
}
