//! Sink protocols and the destination registry.

mod filter;
pub mod loopback;
pub mod memory;

pub use filter::DestinationFilter;

use async_trait::async_trait;
use tracing::warn;

use crate::error::RowcastResult;
use crate::types::ProcessedEvent;
use rowcast_postgres::types::LogEntry;

/// A delivery failure scoped to a single event within a batch.
///
/// A sink returning a non-empty list signals partial failure: the named ids
/// are retried, everything else in the batch counts as delivered. An `Err`
/// from the call itself fails the whole batch.
#[derive(Debug, Clone)]
pub struct SinkEventError {
    pub source_id: i64,
    pub error: String,
}

/// A sink consuming processed analytics events.
#[async_trait]
pub trait ProcessedEventSink: Send + Sync {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>>;

    /// Flushes any internal buffers; called once on clean shutdown.
    async fn shutdown(&self) -> RowcastResult<()> {
        Ok(())
    }
}

/// A sink consuming raw log entries.
#[async_trait]
pub trait RawEventSink: Send + Sync {
    async fn send_batch(&self, entries: &[LogEntry]) -> RowcastResult<Vec<SinkEventError>>;

    /// Flushes any internal buffers; called once on clean shutdown.
    async fn shutdown(&self) -> RowcastResult<()> {
        Ok(())
    }
}

/// A processed-event sink together with its kind label and name filter.
pub struct ProcessedBinding {
    pub kind: String,
    pub filter: DestinationFilter,
    pub sink: Box<dyn ProcessedEventSink>,
}

/// A raw-row sink together with its kind label and table filter.
pub struct RawBinding {
    pub kind: String,
    pub filter: DestinationFilter,
    pub sink: Box<dyn RawEventSink>,
}

/// Holds every configured sink for the process lifetime.
///
/// The engine serializes `send_batch` calls per tick, so sinks only need
/// interior consistency for their own state.
#[derive(Default)]
pub struct DestinationRegistry {
    processed: Vec<ProcessedBinding>,
    raw: Vec<RawBinding>,
}

impl DestinationRegistry {
    pub fn new() -> DestinationRegistry {
        DestinationRegistry::default()
    }

    pub fn add_processed(
        &mut self,
        kind: impl Into<String>,
        filter: DestinationFilter,
        sink: Box<dyn ProcessedEventSink>,
    ) {
        self.processed.push(ProcessedBinding {
            kind: kind.into(),
            filter,
            sink,
        });
    }

    pub fn add_raw(
        &mut self,
        kind: impl Into<String>,
        filter: DestinationFilter,
        sink: Box<dyn RawEventSink>,
    ) {
        self.raw.push(RawBinding {
            kind: kind.into(),
            filter,
            sink,
        });
    }

    pub fn processed(&self) -> &[ProcessedBinding] {
        &self.processed
    }

    pub fn raw(&self) -> &[RawBinding] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty() && self.raw.is_empty()
    }

    /// Flushes every sink; failures are logged, not propagated, so one slow
    /// sink cannot block the rest of shutdown.
    pub async fn shutdown(&self) {
        for binding in &self.processed {
            if let Err(error) = binding.sink.shutdown().await {
                warn!(%error, kind = binding.kind, "failed to shut down destination");
            }
        }
        for binding in &self.raw {
            if let Err(error) = binding.sink.shutdown().await {
                warn!(%error, kind = binding.kind, "failed to shut down raw destination");
            }
        }
    }
}
