use sqlx::PgPool;

use rowcast_postgres::queue::{
    LogTransaction, claim_log_entries, flush_log_entries, qualified_log_table,
    update_log_entries,
};
use rowcast_postgres::types::{LogEntry, RetryUpdate};

use crate::error::{ErrorKind, RowcastError, RowcastResult};
use crate::store::LogStore;

/// The production queue adapter over the event-log table.
///
/// Each claim opens one transaction on the shared pool; `FOR UPDATE SKIP
/// LOCKED` keeps parallel agent instances from observing each other's rows.
/// The sqlx transaction rolls itself back if the handle is dropped without a
/// terminal call, so an engine bug cannot leave rows locked forever.
#[derive(Debug, Clone)]
pub struct PostgresLogStore {
    pool: PgPool,
    log_table: String,
}

impl PostgresLogStore {
    pub fn new(pool: PgPool, internal_schema: &str, event_log_table: &str) -> PostgresLogStore {
        PostgresLogStore {
            pool,
            log_table: qualified_log_table(internal_schema, event_log_table),
        }
    }
}

impl LogStore for PostgresLogStore {
    type Batch = LogTransaction;

    async fn claim(&self, batch_size: usize) -> RowcastResult<(Vec<LogEntry>, Self::Batch)> {
        let (entries, tx) =
            claim_log_entries(&self.pool, &self.log_table, batch_size as i64).await?;
        Ok((entries, tx))
    }

    async fn update_retries(
        &self,
        batch: &mut Self::Batch,
        updates: &[RetryUpdate],
    ) -> RowcastResult<()> {
        update_log_entries(batch, &self.log_table, updates).await?;
        Ok(())
    }

    async fn flush(&self, batch: Self::Batch, delete_ids: &[i64]) -> RowcastResult<()> {
        flush_log_entries(batch, &self.log_table, delete_ids)
            .await
            .map_err(|err| {
                RowcastError::with_source(
                    ErrorKind::TransactionError,
                    "failed to finalize claim transaction",
                    err,
                )
            })
    }

    async fn rollback(&self, batch: Self::Batch) -> RowcastResult<()> {
        batch.rollback().await.map_err(|err| {
            RowcastError::with_source(
                ErrorKind::TransactionError,
                "failed to roll back claim transaction",
                err,
            )
        })
    }
}
