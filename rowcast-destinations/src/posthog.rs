//! PostHog batch-capture sink.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use rowcast::destination::{ProcessedEventSink, SinkEventError};
use rowcast::error::{ErrorKind, RowcastResult};
use rowcast::rowcast_error;
use rowcast::types::ProcessedEvent;

/// US cloud capture endpoint.
pub const DEFAULT_POSTHOG_ENDPOINT: &str = "https://us.i.posthog.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends processed events to PostHog's `/batch` capture API.
pub struct PostHogSink {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct PostHogCapture<'a> {
    event: &'a str,
    distinct_id: &'a str,
    timestamp: DateTime<Utc>,
    properties: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct PostHogBatch<'a> {
    api_key: &'a str,
    batch: Vec<PostHogCapture<'a>>,
}

impl PostHogSink {
    pub fn new(api_key: &str, endpoint: &str) -> RowcastResult<PostHogSink> {
        if api_key.is_empty() {
            return Err(rowcast_error!(
                ErrorKind::ConfigError,
                "posthog destination requires an api key"
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "failed to build posthog http client",
                    err
                )
            })?;

        Ok(PostHogSink {
            client,
            api_key: api_key.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn batch_body<'a>(&'a self, events: &'a [ProcessedEvent]) -> PostHogBatch<'a> {
        PostHogBatch {
            api_key: &self.api_key,
            batch: events
                .iter()
                .map(|event| PostHogCapture {
                    event: &event.name,
                    distinct_id: event.distinct_id_or(""),
                    timestamp: event.timestamp,
                    properties: &event.properties,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ProcessedEventSink for PostHogSink {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = events.len(), "sending events to posthog");

        let response = self
            .client
            .post(format!("{}/batch", self.endpoint))
            .json(&self.batch_body(events))
            .send()
            .await
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "failed to send events to posthog",
                    err
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(rowcast_error!(
                ErrorKind::DestinationError,
                "posthog api returned a non-success status",
                status
            ));
        }

        info!(count = events.len(), "sent events to posthog");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event() -> ProcessedEvent {
        ProcessedEvent {
            source_id: 1,
            name: "user_signed_up".to_string(),
            properties: BTreeMap::from([("email".to_string(), json!("a@b"))]),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            distinct_id: Some("42".to_string()),
        }
    }

    #[test]
    fn batch_body_matches_the_capture_schema() {
        let sink = PostHogSink::new("phc_test", DEFAULT_POSTHOG_ENDPOINT).unwrap();
        let events = [event()];
        let body = serde_json::to_value(sink.batch_body(&events)).unwrap();

        assert_eq!(body["api_key"], "phc_test");
        assert_eq!(body["batch"][0]["event"], "user_signed_up");
        assert_eq!(body["batch"][0]["distinct_id"], "42");
        assert_eq!(body["batch"][0]["properties"]["email"], "a@b");
        assert_eq!(body["batch"][0]["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let sink = PostHogSink::new("phc_test", "https://ph.example.com/").unwrap();
        assert_eq!(sink.endpoint, "https://ph.example.com");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(PostHogSink::new("", DEFAULT_POSTHOG_ENDPOINT).is_err());
    }
}
