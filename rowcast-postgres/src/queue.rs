use chrono::{DateTime, Utc};
use pg_escape::quote_identifier;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::types::{EventKind, LogEntry, RetryUpdate};

/// A claiming transaction over the event log.
pub type LogTransaction = Transaction<'static, Postgres>;

/// Returns the quoted, fully qualified name of the event-log table.
pub fn qualified_log_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// Begins a claiming transaction and locks up to `batch_size` eligible rows.
///
/// Rows are selected in ascending id order with `FOR UPDATE SKIP LOCKED`, so
/// concurrent agents drain disjoint slices of the log. Rows whose
/// `process_after` lies in the future are left for a later tick. The returned
/// transaction must be committed or rolled back by the caller; on error the
/// transaction is rolled back here before the error surfaces.
pub async fn claim_log_entries(
    pool: &PgPool,
    log_table: &str,
    batch_size: i64,
) -> Result<(Vec<LogEntry>, LogTransaction), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let query = format!(
        r#"
        select id, event_type::text as event_type, row_table_name, logged_at,
               retries, last_error, last_retry_at, process_after, old_row, new_row
        from {log_table}
        where process_after is null or process_after < now()
        order by id asc
        for update skip locked
        limit $1
        "#,
    );

    let rows = match sqlx::query(&query).bind(batch_size).fetch_all(&mut *tx).await {
        Ok(rows) => rows,
        Err(err) => {
            tx.rollback().await.ok();
            return Err(err);
        }
    };

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        match decode_log_entry(&row) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tx.rollback().await.ok();
                return Err(err);
            }
        }
    }

    Ok((entries, tx))
}

/// Applies retry-metadata updates inside the claiming transaction.
pub async fn update_log_entries(
    tx: &mut LogTransaction,
    log_table: &str,
    updates: &[RetryUpdate],
) -> Result<(), sqlx::Error> {
    let query = format!(
        "update {log_table} \
         set retries = $2, last_error = $3, last_retry_at = $4, process_after = $5 \
         where id = $1",
    );

    for update in updates {
        sqlx::query(&query)
            .bind(update.id)
            .bind(update.retries)
            .bind(&update.last_error)
            .bind(update.last_retry_at)
            .bind(update.process_after)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

/// Deletes the delivered entries and commits the claiming transaction.
///
/// An empty id list still commits, finalizing any retry updates applied
/// earlier in the same transaction.
pub async fn flush_log_entries(
    mut tx: LogTransaction,
    log_table: &str,
    ids: &[i64],
) -> Result<(), sqlx::Error> {
    if !ids.is_empty() {
        let query = format!("delete from {log_table} where id = any($1)");
        if let Err(err) = sqlx::query(&query).bind(ids).execute(&mut *tx).await {
            tx.rollback().await.ok();
            return Err(err);
        }
    }

    tx.commit().await
}

fn decode_log_entry(row: &PgRow) -> Result<LogEntry, sqlx::Error> {
    let kind: String = row.try_get("event_type")?;
    let kind = kind
        .parse::<EventKind>()
        .map_err(|err| sqlx::Error::Decode(err.into()))?;

    Ok(LogEntry {
        id: row.try_get("id")?,
        kind,
        table: row.try_get("row_table_name")?,
        logged_at: row.try_get::<DateTime<Utc>, _>("logged_at")?,
        retries: row.try_get("retries")?,
        last_error: row.try_get("last_error")?,
        last_retry_at: row.try_get("last_retry_at")?,
        process_after: row.try_get("process_after")?,
        old_row: row.try_get("old_row")?,
        new_row: row.try_get("new_row")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_table_name_is_quoted_when_needed() {
        assert_eq!(
            qualified_log_table("schema_pg_track_events", "event_log"),
            "schema_pg_track_events.event_log"
        );
        assert_eq!(
            qualified_log_table("schema_pg_track_events", "Event Log"),
            "schema_pg_track_events.\"Event Log\""
        );
    }
}
