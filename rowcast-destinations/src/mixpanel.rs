//! Mixpanel batch-import sink.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use rowcast::destination::{ProcessedEventSink, SinkEventError};
use rowcast::error::{ErrorKind, RowcastResult};
use rowcast::rowcast_error;
use rowcast::types::ProcessedEvent;

/// Default ingestion endpoint.
pub const DEFAULT_MIXPANEL_ENDPOINT: &str = "https://api.mixpanel.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends processed events through Mixpanel's `/import` API.
///
/// Each event carries its log-entry id as `$insert_id` so redeliveries of a
/// retried batch deduplicate on the provider side, and `ip` is pinned to
/// `"0"` so the agent host is never geolocated as the event origin.
pub struct MixpanelSink {
    client: reqwest::Client,
    project_token: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct MixpanelEvent<'a> {
    event: &'a str,
    properties: serde_json::Map<String, serde_json::Value>,
}

impl MixpanelSink {
    pub fn new(project_token: &str, endpoint: &str) -> RowcastResult<MixpanelSink> {
        if project_token.is_empty() {
            return Err(rowcast_error!(
                ErrorKind::ConfigError,
                "mixpanel destination requires a project token"
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "failed to build mixpanel http client",
                    err
                )
            })?;

        Ok(MixpanelSink {
            client,
            project_token: project_token.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn import_body<'a>(&self, events: &'a [ProcessedEvent]) -> Vec<MixpanelEvent<'a>> {
        events
            .iter()
            .map(|event| {
                let mut properties: serde_json::Map<String, serde_json::Value> = event
                    .properties
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                properties.insert(
                    "time".to_string(),
                    serde_json::Value::from(event.timestamp.timestamp_millis()),
                );
                properties.insert(
                    "distinct_id".to_string(),
                    serde_json::Value::from(event.distinct_id_or("")),
                );
                // The log-entry id deduplicates at-least-once redeliveries.
                properties.insert(
                    "$insert_id".to_string(),
                    serde_json::Value::from(event.source_id.to_string()),
                );
                // The agent's own address must never reach the provider.
                properties.insert("ip".to_string(), serde_json::Value::from("0"));

                MixpanelEvent {
                    event: &event.name,
                    properties,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ProcessedEventSink for MixpanelSink {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = events.len(), "sending events to mixpanel");

        let response = self
            .client
            .post(format!("{}/import?strict=0", self.endpoint))
            .basic_auth(&self.project_token, None::<&str>)
            .json(&self.import_body(events))
            .send()
            .await
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "failed to send events to mixpanel",
                    err
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(rowcast_error!(
                ErrorKind::DestinationError,
                "mixpanel api returned a non-success status",
                status
            ));
        }

        info!(count = events.len(), "sent events to mixpanel");
        Ok(Vec::new())
    }
}
