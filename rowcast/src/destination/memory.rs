//! In-memory capturing sinks for tests and local development.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ProcessedEventSink, RawEventSink, SinkEventError};
use crate::error::RowcastResult;
use crate::types::ProcessedEvent;
use rowcast_postgres::types::LogEntry;

/// Captures every delivered batch so tests can inspect order and content.
#[derive(Clone, Default)]
pub struct MemoryEventSink {
    batches: Arc<Mutex<Vec<Vec<ProcessedEvent>>>>,
}

impl MemoryEventSink {
    pub fn new() -> MemoryEventSink {
        MemoryEventSink::default()
    }

    /// All delivered batches, in call order.
    pub fn batches(&self) -> Vec<Vec<ProcessedEvent>> {
        self.batches.lock().unwrap().clone()
    }

    /// All delivered events flattened across batches.
    pub fn events(&self) -> Vec<ProcessedEvent> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ProcessedEventSink for MemoryEventSink {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(Vec::new())
    }
}

/// Raw-row counterpart of [`MemoryEventSink`].
#[derive(Clone, Default)]
pub struct MemoryRawSink {
    batches: Arc<Mutex<Vec<Vec<LogEntry>>>>,
}

impl MemoryRawSink {
    pub fn new() -> MemoryRawSink {
        MemoryRawSink::default()
    }

    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl RawEventSink for MemoryRawSink {
    async fn send_batch(&self, entries: &[LogEntry]) -> RowcastResult<Vec<SinkEventError>> {
        self.batches.lock().unwrap().push(entries.to_vec());
        Ok(Vec::new())
    }
}
