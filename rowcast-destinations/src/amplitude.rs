//! Amplitude batch-upload sink.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use rowcast::destination::{ProcessedEventSink, SinkEventError};
use rowcast::error::{ErrorKind, RowcastResult};
use rowcast::rowcast_error;
use rowcast::types::ProcessedEvent;

/// Default HTTP API endpoint.
pub const DEFAULT_AMPLITUDE_ENDPOINT: &str = "https://api2.amplitude.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends processed events to Amplitude's batch API.
pub struct AmplitudeSink {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct AmplitudeEvent<'a> {
    user_id: &'a str,
    event_type: &'a str,
    /// Event time in epoch milliseconds.
    time: i64,
    event_properties: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AmplitudeBatch<'a> {
    api_key: &'a str,
    events: Vec<AmplitudeEvent<'a>>,
}

impl AmplitudeSink {
    pub fn new(api_key: &str, endpoint: &str) -> RowcastResult<AmplitudeSink> {
        if api_key.is_empty() {
            return Err(rowcast_error!(
                ErrorKind::ConfigError,
                "amplitude destination requires an api key"
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "failed to build amplitude http client",
                    err
                )
            })?;

        Ok(AmplitudeSink {
            client,
            api_key: api_key.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn batch_body<'a>(&'a self, events: &'a [ProcessedEvent]) -> AmplitudeBatch<'a> {
        AmplitudeBatch {
            api_key: &self.api_key,
            events: events
                .iter()
                .map(|event| AmplitudeEvent {
                    user_id: event.distinct_id_or(""),
                    event_type: &event.name,
                    time: event.timestamp.timestamp_millis(),
                    event_properties: &event.properties,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ProcessedEventSink for AmplitudeSink {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = events.len(), "sending events to amplitude");

        let response = self
            .client
            .post(format!("{}/batch", self.endpoint))
            .json(&self.batch_body(events))
            .send()
            .await
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::DestinationError,
                    "failed to send events to amplitude",
                    err
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(rowcast_error!(
                ErrorKind::DestinationError,
                "amplitude api returned a non-success status",
                status
            ));
        }

        info!(count = events.len(), "sent events to amplitude");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn batch_body_matches_the_http_api_schema() {
        let sink = AmplitudeSink::new("amp_test", DEFAULT_AMPLITUDE_ENDPOINT).unwrap();
        let events = [ProcessedEvent {
            source_id: 7,
            name: "order_completed".to_string(),
            properties: BTreeMap::from([("total".to_string(), json!(10.5))]),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            distinct_id: None,
        }];

        let body = serde_json::to_value(sink.batch_body(&events)).unwrap();
        assert_eq!(body["api_key"], "amp_test");
        assert_eq!(body["events"][0]["event_type"], "order_completed");
        assert_eq!(body["events"][0]["user_id"], "");
        assert_eq!(body["events"][0]["time"], 1_714_564_800_000i64);
        assert_eq!(body["events"][0]["event_properties"]["total"], 10.5);
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(AmplitudeSink::new("", DEFAULT_AMPLITUDE_ENDPOINT).is_err());
    }
}
