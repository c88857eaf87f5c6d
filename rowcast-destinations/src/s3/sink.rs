use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rowcast::concurrency::shutdown::ShutdownRx;
use rowcast::destination::{ProcessedEventSink, RawEventSink, SinkEventError};
use rowcast::error::{ErrorKind, RowcastResult};
use rowcast::rowcast_error;
use rowcast::types::ProcessedEvent;
use rowcast_config::DestinationConfig;
use rowcast_postgres::types::LogEntry;

use super::buffer::BufferSet;
use super::client::ObjectStoreClient;

const DEFAULT_MAX_EVENTS_PER_FILE: usize = 20_000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Settings of one S3 destination binding.
#[derive(Debug, Clone)]
pub struct S3SinkConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub root_dir: String,
    pub flush_on_batch: bool,
    pub max_events_per_file: usize,
    pub flush_interval: Duration,
}

impl S3SinkConfig {
    /// Lifts a validated destination entry into sink settings.
    pub fn from_destination(config: &DestinationConfig) -> RowcastResult<S3SinkConfig> {
        let bucket = config.bucket.clone().ok_or_else(|| {
            rowcast_error!(ErrorKind::ConfigError, "s3 destination requires `bucket`")
        })?;
        let region = config.region.clone().ok_or_else(|| {
            rowcast_error!(ErrorKind::ConfigError, "s3 destination requires `region`")
        })?;

        Ok(S3SinkConfig {
            bucket,
            region,
            endpoint: config.endpoint.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            root_dir: config.root_dir.clone().unwrap_or_default(),
            flush_on_batch: config.flush_on_batch.unwrap_or(true),
            max_events_per_file: config
                .max_events_per_file
                .unwrap_or(DEFAULT_MAX_EVENTS_PER_FILE),
            flush_interval: config
                .flush_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FLUSH_INTERVAL),
        })
    }
}

/// The processed-event record written to object storage, one per line.
#[derive(Debug, Serialize)]
struct ObjectEventRecord<'a> {
    id: i64,
    name: &'a str,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    properties: &'a std::collections::BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "str::is_empty")]
    user_id: &'a str,
    timestamp: DateTime<Utc>,
    processed_at: DateTime<Utc>,
}

/// Buffered sink for processed events, keyed by event name.
pub struct S3EventSink<C> {
    client: Arc<C>,
    buffers: Arc<BufferSet>,
    flush_on_batch: bool,
}

impl<C: ObjectStoreClient> S3EventSink<C> {
    pub fn new(client: Arc<C>, buffers: Arc<BufferSet>, flush_on_batch: bool) -> S3EventSink<C> {
        S3EventSink {
            client,
            buffers,
            flush_on_batch,
        }
    }

    async fn flush_key(&self, key: &str) -> RowcastResult<()> {
        flush_one(self.client.as_ref(), &self.buffers, key).await
    }
}

#[async_trait]
impl<C: ObjectStoreClient> ProcessedEventSink for S3EventSink<C> {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = events.len(), "buffering events for object storage");

        let mut touched: BTreeSet<&str> = BTreeSet::new();
        for event in events {
            let record = ObjectEventRecord {
                id: event.source_id,
                name: &event.name,
                properties: &event.properties,
                user_id: event.distinct_id_or(""),
                timestamp: event.timestamp,
                processed_at: Utc::now(),
            };
            let line = serde_json::to_vec(&record)?;

            let full = self.buffers.append(&event.name, &line);
            touched.insert(&event.name);
            if full {
                self.flush_key(&event.name).await?;
            }
        }

        if self.flush_on_batch {
            for key in touched {
                self.flush_key(key).await?;
            }
        }

        Ok(Vec::new())
    }

    async fn shutdown(&self) -> RowcastResult<()> {
        flush_all(self.client.as_ref(), &self.buffers).await
    }
}

/// Buffered sink for raw log entries, keyed by source table.
pub struct S3RawSink<C> {
    client: Arc<C>,
    buffers: Arc<BufferSet>,
    flush_on_batch: bool,
}

impl<C: ObjectStoreClient> S3RawSink<C> {
    pub fn new(client: Arc<C>, buffers: Arc<BufferSet>, flush_on_batch: bool) -> S3RawSink<C> {
        S3RawSink {
            client,
            buffers,
            flush_on_batch,
        }
    }
}

#[async_trait]
impl<C: ObjectStoreClient> RawEventSink for S3RawSink<C> {
    async fn send_batch(&self, entries: &[LogEntry]) -> RowcastResult<Vec<SinkEventError>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = entries.len(), "buffering raw entries for object storage");

        let mut touched: BTreeSet<&str> = BTreeSet::new();
        for entry in entries {
            let line = serde_json::to_vec(entry)?;
            let full = self.buffers.append(&entry.table, &line);
            touched.insert(&entry.table);
            if full {
                flush_one(self.client.as_ref(), &self.buffers, &entry.table).await?;
            }
        }

        if self.flush_on_batch {
            for key in touched {
                flush_one(self.client.as_ref(), &self.buffers, key).await?;
            }
        }

        Ok(Vec::new())
    }

    async fn shutdown(&self) -> RowcastResult<()> {
        flush_all(self.client.as_ref(), &self.buffers).await
    }
}

async fn flush_one<C: ObjectStoreClient>(
    client: &C,
    buffers: &BufferSet,
    key: &str,
) -> RowcastResult<()> {
    if let Some((object_key, data)) = buffers.take(key) {
        client.put_object(&object_key, data).await?;
    }
    Ok(())
}

async fn flush_all<C: ObjectStoreClient>(client: &C, buffers: &BufferSet) -> RowcastResult<()> {
    for (object_key, data) in buffers.drain_all() {
        client.put_object(&object_key, data).await?;
    }
    Ok(())
}

/// Starts the periodic flusher worker.
///
/// Flushes all buffers on every interval and once more when shutdown is
/// signalled, so a clean stop never strands buffered events.
pub fn spawn_periodic_flush<C>(
    client: Arc<C>,
    buffers: Arc<BufferSet>,
    interval: Duration,
    mut shutdown_rx: ShutdownRx,
) -> JoinHandle<()>
where
    C: ObjectStoreClient + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("flushing object-store buffers before shutdown");
                        if let Err(error) = flush_all(client.as_ref(), &buffers).await {
                            warn!(%error, "failed to flush object-store buffers on shutdown");
                        }
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(error) = flush_all(client.as_ref(), &buffers).await {
                        warn!(%error, "periodic object-store flush failed");
                    }
                }
            }
        }
    })
}
