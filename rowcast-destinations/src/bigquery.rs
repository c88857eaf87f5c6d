//! BigQuery streaming-insert sinks.
//!
//! Both sinks append through the tabledata `insertAll` API, using the
//! log-entry id as the row insert id so retried batches deduplicate in the
//! streaming buffer. Any rejected row fails the whole batch, which the
//! engine answers by retaining every id for retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use serde::Serialize;
use tracing::{debug, info};

use rowcast::destination::{ProcessedEventSink, RawEventSink, SinkEventError};
use rowcast::error::{ErrorKind, RowcastResult};
use rowcast::rowcast_error;
use rowcast::types::ProcessedEvent;
use rowcast_postgres::types::LogEntry;

/// A fully qualified destination table, `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigQueryTableId {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl BigQueryTableId {
    pub fn parse(raw: &str) -> RowcastResult<BigQueryTableId> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [project_id, dataset_id, table_id]
                if !project_id.is_empty() && !dataset_id.is_empty() && !table_id.is_empty() =>
            {
                Ok(BigQueryTableId {
                    project_id: project_id.to_string(),
                    dataset_id: dataset_id.to_string(),
                    table_id: table_id.to_string(),
                })
            }
            _ => Err(rowcast_error!(
                ErrorKind::ConfigError,
                "bigquery table id must be `project_id.dataset_id.table_name`",
                raw
            )),
        }
    }
}

async fn connect_client(credentials_json: &str) -> RowcastResult<Client> {
    if credentials_json.is_empty() {
        return Err(rowcast_error!(
            ErrorKind::ConfigError,
            "bigquery destination requires credentials json"
        ));
    }

    let key = parse_service_account_key(credentials_json).map_err(|err| {
        rowcast_error!(
            ErrorKind::ConfigError,
            "failed to parse bigquery service account key",
            err
        )
    })?;

    ClientBuilder::new()
        .build_from_service_account_key(key, false)
        .await
        .map_err(|err| {
            rowcast_error!(
                ErrorKind::DestinationError,
                "failed to create bigquery client",
                err
            )
        })
}

async fn insert_rows<T: Serialize>(
    client: &Client,
    table: &BigQueryTableId,
    rows: Vec<(String, T)>,
) -> RowcastResult<()> {
    let mut request = TableDataInsertAllRequest::new();
    for (insert_id, row) in rows {
        request.add_row(Some(insert_id), row).map_err(|err| {
            rowcast_error!(
                ErrorKind::SerializationError,
                "failed to encode row for bigquery",
                err
            )
        })?;
    }

    let response = client
        .tabledata()
        .insert_all(
            &table.project_id,
            &table.dataset_id,
            &table.table_id,
            request,
        )
        .await
        .map_err(|err| {
            rowcast_error!(
                ErrorKind::DestinationError,
                "failed to insert rows into bigquery",
                err
            )
        })?;

    let rejected = response
        .insert_errors
        .map(|errors| errors.len())
        .unwrap_or(0);
    if rejected > 0 {
        return Err(rowcast_error!(
            ErrorKind::DestinationError,
            "bigquery rejected rows from the batch",
            format!("{rejected} rows rejected")
        ));
    }

    Ok(())
}

/// The processed-event row shape: properties travel as one JSON column.
#[derive(Debug, Serialize)]
struct BigQueryEventRow<'a> {
    id: String,
    name: &'a str,
    properties: String,
    user_id: &'a str,
    timestamp: DateTime<Utc>,
    processed_at: DateTime<Utc>,
}

/// Streams processed events into a BigQuery table.
pub struct BigQueryEventSink {
    client: Client,
    table: BigQueryTableId,
}

impl BigQueryEventSink {
    pub async fn connect(credentials_json: &str, table_id: &str) -> RowcastResult<BigQueryEventSink> {
        let table = BigQueryTableId::parse(table_id)?;
        let client = connect_client(credentials_json).await?;
        info!(
            dataset = table.dataset_id,
            table = table.table_id,
            "connected bigquery destination"
        );
        Ok(BigQueryEventSink { client, table })
    }
}

#[async_trait]
impl ProcessedEventSink for BigQueryEventSink {
    async fn send_batch(&self, events: &[ProcessedEvent]) -> RowcastResult<Vec<SinkEventError>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = events.len(), "sending events to bigquery");

        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            let properties = serde_json::to_string(&event.properties)?;
            rows.push((
                event.source_id.to_string(),
                BigQueryEventRow {
                    id: event.source_id.to_string(),
                    name: &event.name,
                    properties,
                    user_id: event.distinct_id_or(""),
                    timestamp: event.timestamp,
                    processed_at: Utc::now(),
                },
            ));
        }

        insert_rows(&self.client, &self.table, rows).await?;

        info!(count = events.len(), "sent events to bigquery");
        Ok(Vec::new())
    }
}

/// The raw-entry row shape: old and new rows travel as JSON columns, empty
/// when absent for the entry's kind.
#[derive(Debug, Serialize)]
struct BigQueryRawRow<'a> {
    id: String,
    event_type: &'a str,
    row_table_name: &'a str,
    old_row: String,
    new_row: String,
    logged_at: DateTime<Utc>,
}

/// Streams raw log entries into a BigQuery table.
pub struct BigQueryRawSink {
    client: Client,
    table: BigQueryTableId,
}

impl BigQueryRawSink {
    pub async fn connect(credentials_json: &str, table_id: &str) -> RowcastResult<BigQueryRawSink> {
        let table = BigQueryTableId::parse(table_id)?;
        let client = connect_client(credentials_json).await?;
        info!(
            dataset = table.dataset_id,
            table = table.table_id,
            "connected raw bigquery destination"
        );
        Ok(BigQueryRawSink { client, table })
    }
}

#[async_trait]
impl RawEventSink for BigQueryRawSink {
    async fn send_batch(&self, entries: &[LogEntry]) -> RowcastResult<Vec<SinkEventError>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = entries.len(), "sending raw entries to bigquery");

        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let old_row = match &entry.old_row {
                Some(row) => serde_json::to_string(row)?,
                None => String::new(),
            };
            let new_row = match &entry.new_row {
                Some(row) => serde_json::to_string(row)?,
                None => String::new(),
            };
            rows.push((
                entry.id.to_string(),
                BigQueryRawRow {
                    id: entry.id.to_string(),
                    event_type: entry.kind.as_str(),
                    row_table_name: &entry.table,
                    old_row,
                    new_row,
                    logged_at: entry.logged_at,
                },
            ));
        }

        insert_rows(&self.client, &self.table, rows).await?;

        info!(count = entries.len(), "sent raw entries to bigquery");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn table_ids_parse_the_three_part_form() {
        let table = BigQueryTableId::parse("proj.analytics.events").unwrap();
        assert_eq!(table.project_id, "proj");
        assert_eq!(table.dataset_id, "analytics");
        assert_eq!(table.table_id, "events");

        for raw in ["", "events", "analytics.events", "a.b.c.d", "a..c"] {
            assert!(BigQueryTableId::parse(raw).is_err(), "`{raw}` should fail");
        }
    }

    #[test]
    fn event_rows_serialize_the_insert_shape() {
        let event = ProcessedEvent {
            source_id: 42,
            name: "user_signed_up".to_string(),
            properties: BTreeMap::from([("email".to_string(), json!("a@b"))]),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            distinct_id: Some("42".to_string()),
        };

        let row = BigQueryEventRow {
            id: event.source_id.to_string(),
            name: &event.name,
            properties: serde_json::to_string(&event.properties).unwrap(),
            user_id: event.distinct_id_or(""),
            timestamp: event.timestamp,
            processed_at: event.timestamp,
        };

        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["id"], "42");
        assert_eq!(value["name"], "user_signed_up");
        assert_eq!(value["properties"], "{\"email\":\"a@b\"}");
        assert_eq!(value["user_id"], "42");
    }

    #[test]
    fn raw_rows_leave_absent_sides_empty() {
        let row = BigQueryRawRow {
            id: "7".to_string(),
            event_type: "insert",
            row_table_name: "users",
            old_row: String::new(),
            new_row: "{\"id\":1}".to_string(),
            logged_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };

        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["event_type"], "insert");
        assert_eq!(value["old_row"], "");
        assert_eq!(value["new_row"], "{\"id\":1}");
    }
}
