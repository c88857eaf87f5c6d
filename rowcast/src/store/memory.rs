use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use rowcast_postgres::types::{LogEntry, RetryUpdate};

use crate::error::RowcastResult;
use crate::store::LogStore;

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<i64, LogEntry>,
    claimed: BTreeSet<i64>,
}

/// In-memory log store for tests and local development.
///
/// Mirrors the transactional queue semantics of the Postgres adapter:
/// claimed ids are invisible to other claimers until the batch is finalized,
/// retry updates stage inside the batch and only apply on flush, and a batch
/// dropped without a terminal call is counted as a leaked handle so tests
/// can assert none occurred.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    inner: Arc<Mutex<Inner>>,
    leaked: Arc<AtomicUsize>,
}

/// Claim handle of [`MemoryLogStore`].
#[derive(Debug)]
pub struct MemoryBatch {
    ids: Vec<i64>,
    staged: Vec<RetryUpdate>,
    finalized: bool,
    inner: Arc<Mutex<Inner>>,
    leaked: Arc<AtomicUsize>,
}

impl MemoryBatch {
    fn release(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        for id in &self.ids {
            inner.claimed.remove(id);
        }
        self.finalized = true;
    }
}

impl Drop for MemoryBatch {
    fn drop(&mut self) {
        if !self.finalized {
            self.leaked.fetch_add(1, Ordering::SeqCst);
            self.release();
        }
    }
}

impl MemoryLogStore {
    pub fn new() -> MemoryLogStore {
        MemoryLogStore::default()
    }

    /// Seeds the log with an entry.
    pub fn insert(&self, entry: LogEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(entry.id, entry);
    }

    /// Snapshot of the remaining entries, in id order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().entries.values().cloned().collect()
    }

    pub fn entry(&self, id: i64) -> Option<LogEntry> {
        self.inner.lock().unwrap().entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of claim handles dropped without a commit or rollback.
    pub fn leaked_handles(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }
}

impl LogStore for MemoryLogStore {
    type Batch = MemoryBatch;

    async fn claim(&self, batch_size: usize) -> RowcastResult<(Vec<LogEntry>, Self::Batch)> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let mut claimed = Vec::new();
        for (id, entry) in &inner.entries {
            if claimed.len() >= batch_size {
                break;
            }
            if inner.claimed.contains(id) {
                continue;
            }
            let eligible = entry.process_after.is_none_or(|after| after < now);
            if eligible {
                claimed.push(entry.clone());
            }
        }

        let ids: Vec<i64> = claimed.iter().map(|entry| entry.id).collect();
        for id in &ids {
            inner.claimed.insert(*id);
        }

        let batch = MemoryBatch {
            ids,
            staged: Vec::new(),
            finalized: false,
            inner: Arc::clone(&self.inner),
            leaked: Arc::clone(&self.leaked),
        };

        Ok((claimed, batch))
    }

    async fn update_retries(
        &self,
        batch: &mut Self::Batch,
        updates: &[RetryUpdate],
    ) -> RowcastResult<()> {
        batch.staged.extend_from_slice(updates);
        Ok(())
    }

    async fn flush(&self, mut batch: Self::Batch, delete_ids: &[i64]) -> RowcastResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            for update in std::mem::take(&mut batch.staged) {
                if let Some(entry) = inner.entries.get_mut(&update.id) {
                    entry.retries = update.retries;
                    entry.last_error = update.last_error;
                    entry.last_retry_at = update.last_retry_at;
                    entry.process_after = update.process_after;
                }
            }
            for id in delete_ids {
                inner.entries.remove(id);
            }
        }
        batch.release();
        Ok(())
    }

    async fn rollback(&self, mut batch: Self::Batch) -> RowcastResult<()> {
        batch.staged.clear();
        batch.release();
        Ok(())
    }
}
