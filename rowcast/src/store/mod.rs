//! The queue abstraction over the event-log table.

pub mod memory;
pub mod postgres;

use std::future::Future;

use rowcast_postgres::types::{LogEntry, RetryUpdate};

use crate::error::RowcastResult;

/// Presents the event log as a concurrent queue with transactional progress.
///
/// A claimed batch stays invisible to other agents until the handle is
/// finalized with [`LogStore::flush`] or [`LogStore::rollback`]; dropping a
/// handle without a terminal call is a bug in the caller. Every method that
/// errors leaves the underlying transaction rolled back.
pub trait LogStore {
    /// Opaque per-batch transaction handle.
    type Batch: Send;

    /// Claims up to `batch_size` eligible entries in ascending id order,
    /// locking them against concurrent claimers.
    fn claim(
        &self,
        batch_size: usize,
    ) -> impl Future<Output = RowcastResult<(Vec<LogEntry>, Self::Batch)>> + Send;

    /// Stages retry-metadata updates inside the claiming transaction.
    fn update_retries(
        &self,
        batch: &mut Self::Batch,
        updates: &[RetryUpdate],
    ) -> impl Future<Output = RowcastResult<()>> + Send;

    /// Deletes the delivered ids and commits; an empty id list just commits.
    fn flush(
        &self,
        batch: Self::Batch,
        delete_ids: &[i64],
    ) -> impl Future<Output = RowcastResult<()>> + Send;

    /// Abandons the batch, releasing the claimed rows unchanged.
    fn rollback(&self, batch: Self::Batch) -> impl Future<Output = RowcastResult<()>> + Send;
}
