//! Loopback sinks forwarding batches into an in-process channel.
//!
//! Used by end-to-end style tests to observe exactly what the engine
//! delivered without leaving the process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ProcessedEventSink, RawEventSink, SinkEventError};
use crate::error::{ErrorKind, RowcastResult};
use crate::rowcast_error;
use crate::types::ProcessedEvent;
use rowcast_postgres::types::LogEntry;

/// Forwards processed events into an unbounded channel.
pub struct LoopbackEventSink {
    tx: mpsc::UnboundedSender<ProcessedEvent>,
}

impl LoopbackEventSink {
    /// Creates the sink plus the receiving half for the test to drain.
    pub fn channel() -> (LoopbackEventSink, mpsc::UnboundedReceiver<ProcessedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackEventSink { tx }, rx)
    }

    pub fn new(tx: mpsc::UnboundedSender<ProcessedEvent>) -> LoopbackEventSink {
        LoopbackEventSink { tx }
    }
}

#[async_trait]
impl ProcessedEventSink for LoopbackEventSink {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        for event in events {
            self.tx.send(event.clone()).map_err(|_| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "loopback channel is closed"
                )
            })?;
        }
        Ok(Vec::new())
    }
}

/// Forwards raw log entries into an unbounded channel.
pub struct LoopbackRawSink {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl LoopbackRawSink {
    pub fn channel() -> (LoopbackRawSink, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackRawSink { tx }, rx)
    }

    pub fn new(tx: mpsc::UnboundedSender<LogEntry>) -> LoopbackRawSink {
        LoopbackRawSink { tx }
    }
}

#[async_trait]
impl RawEventSink for LoopbackRawSink {
    async fn send_batch(&self, entries: &[LogEntry]) -> RowcastResult<Vec<SinkEventError>> {
        for entry in entries {
            self.tx.send(entry.clone()).map_err(|_| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "loopback channel is closed"
                )
            })?;
        }
        Ok(Vec::new())
    }
}
