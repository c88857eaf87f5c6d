use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use rowcast::concurrency::shutdown::ShutdownRx;
use rowcast::destination::loopback::{LoopbackEventSink, LoopbackRawSink};
use rowcast::destination::{DestinationFilter, DestinationRegistry};
use rowcast::types::ProcessedEvent;
use rowcast_config::{DestinationConfig, TrackingDocument};
use rowcast_destinations::amplitude::{AmplitudeSink, DEFAULT_AMPLITUDE_ENDPOINT};
use rowcast_destinations::bigquery::{BigQueryEventSink, BigQueryRawSink};
use rowcast_destinations::mixpanel::{DEFAULT_MIXPANEL_ENDPOINT, MixpanelSink};
use rowcast_destinations::posthog::{DEFAULT_POSTHOG_ENDPOINT, PostHogSink};
use rowcast_destinations::s3::{
    AwsS3Client, BufferSet, S3EventSink, S3RawSink, S3SinkConfig, spawn_periodic_flush,
};
use rowcast_postgres::types::LogEntry;

/// Receiving ends for `loopback` destinations, wired in by end-to-end tests.
#[derive(Default)]
pub struct LoopbackChannels {
    pub processed: Option<mpsc::UnboundedSender<ProcessedEvent>>,
    pub raw: Option<mpsc::UnboundedSender<LogEntry>>,
}

/// Instantiates every configured destination.
///
/// Returns the registry plus the join handles of any periodic flusher tasks
/// started for buffered sinks; the handles finish once shutdown is
/// signalled.
pub async fn build_registry(
    document: &TrackingDocument,
    shutdown_rx: ShutdownRx,
    loopback: LoopbackChannels,
) -> anyhow::Result<(DestinationRegistry, Vec<JoinHandle<()>>)> {
    let mut registry = DestinationRegistry::new();
    let mut flushers = Vec::new();

    for (kind, destination) in &document.destinations {
        let filter = DestinationFilter::new(&destination.filter)?;
        match kind.as_str() {
            "posthog" => {
                let endpoint = destination
                    .endpoint
                    .as_deref()
                    .unwrap_or(DEFAULT_POSTHOG_ENDPOINT);
                let api_key = destination.api_key.as_deref().unwrap_or_default();
                registry.add_processed(
                    kind.as_str(),
                    filter,
                    Box::new(PostHogSink::new(api_key, endpoint)?),
                );
            }
            "amplitude" => {
                let endpoint = destination
                    .endpoint
                    .as_deref()
                    .unwrap_or(DEFAULT_AMPLITUDE_ENDPOINT);
                let api_key = destination.api_key.as_deref().unwrap_or_default();
                registry.add_processed(
                    kind.as_str(),
                    filter,
                    Box::new(AmplitudeSink::new(api_key, endpoint)?),
                );
            }
            "mixpanel" => {
                let endpoint = destination
                    .endpoint
                    .as_deref()
                    .unwrap_or(DEFAULT_MIXPANEL_ENDPOINT);
                let project_token = destination.project_token.as_deref().unwrap_or_default();
                registry.add_processed(
                    kind.as_str(),
                    filter,
                    Box::new(MixpanelSink::new(project_token, endpoint)?),
                );
            }
            "bigquery" => {
                let sink = BigQueryEventSink::connect(
                    destination.credentials_json.as_deref().unwrap_or_default(),
                    destination.table_id.as_deref().unwrap_or_default(),
                )
                .await
                .context("failed to initialize bigquery destination")?;
                registry.add_processed(kind.as_str(), filter, Box::new(sink));
            }
            "s3" => {
                let (client, buffers, config) =
                    connect_s3(destination, &shutdown_rx, &mut flushers)
                        .await
                        .context("failed to initialize s3 destination")?;
                registry.add_processed(
                    kind.as_str(),
                    filter,
                    Box::new(S3EventSink::new(client, buffers, config.flush_on_batch)),
                );
            }
            "loopback" => {
                let Some(tx) = &loopback.processed else {
                    bail!("loopback destination configured without a processed-event channel");
                };
                registry.add_processed(
                    kind.as_str(),
                    filter,
                    Box::new(LoopbackEventSink::new(tx.clone())),
                );
            }
            other => bail!("unknown destination kind `{other}`"),
        }
        info!(kind, "initialized destination");
    }

    for (kind, destination) in &document.raw_db_event_destinations {
        let filter = DestinationFilter::new(&destination.filter)?;
        match kind.as_str() {
            "bigquery" => {
                let sink = BigQueryRawSink::connect(
                    destination.credentials_json.as_deref().unwrap_or_default(),
                    destination.table_id.as_deref().unwrap_or_default(),
                )
                .await
                .context("failed to initialize raw bigquery destination")?;
                registry.add_raw(kind.as_str(), filter, Box::new(sink));
            }
            "s3" => {
                let (client, buffers, config) =
                    connect_s3(destination, &shutdown_rx, &mut flushers)
                        .await
                        .context("failed to initialize raw s3 destination")?;
                registry.add_raw(
                    kind.as_str(),
                    filter,
                    Box::new(S3RawSink::new(client, buffers, config.flush_on_batch)),
                );
            }
            "loopback" => {
                let Some(tx) = &loopback.raw else {
                    bail!("loopback raw destination configured without a raw-event channel");
                };
                registry.add_raw(kind.as_str(), filter, Box::new(LoopbackRawSink::new(tx.clone())));
            }
            other => bail!("unknown raw event destination kind `{other}`"),
        }
        info!(kind, "initialized raw event destination");
    }

    Ok((registry, flushers))
}

async fn connect_s3(
    destination: &DestinationConfig,
    shutdown_rx: &ShutdownRx,
    flushers: &mut Vec<JoinHandle<()>>,
) -> anyhow::Result<(Arc<AwsS3Client>, Arc<BufferSet>, S3SinkConfig)> {
    let config = S3SinkConfig::from_destination(destination)?;

    let client = Arc::new(
        AwsS3Client::connect(
            &config.bucket,
            &config.region,
            config.endpoint.as_deref(),
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
        )
        .await?,
    );
    let buffers = Arc::new(BufferSet::new(
        config.root_dir.clone(),
        config.max_events_per_file,
    ));

    flushers.push(spawn_periodic_flush(
        Arc::clone(&client),
        Arc::clone(&buffers),
        config.flush_interval,
        shutdown_rx.clone(),
    ));

    Ok((client, buffers, config))
}
