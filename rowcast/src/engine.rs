//! The per-tick delivery loop: claim, transform, fan out, reconcile, commit.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use rowcast_postgres::types::{LogEntry, RetryUpdate};

use crate::concurrency::shutdown::{ShutdownRx, is_shutting_down};
use crate::destination::DestinationRegistry;
use crate::error::RowcastResult;
use crate::retry::{merge_retry_updates, retry_update};
use crate::store::LogStore;
use crate::transform::EventTransformer;
use crate::types::ProcessedEvent;

/// What one processed batch tells the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    /// Fewer rows than `batch_size` were claimed; wait for the next tick.
    Drained,
    /// A full batch was claimed; more rows are probably waiting.
    Full,
}

/// Drives the log-drain loop for one agent process.
///
/// A single driver task wakes on a ticker, claims a batch, and pushes it
/// through transformation and fan-out. Sinks are called sequentially so
/// per-id failure accounting stays simple; parallelism across agent
/// processes comes from the skip-locked claim instead.
pub struct DeliveryEngine<S> {
    store: S,
    transformer: EventTransformer,
    registry: DestinationRegistry,
    batch_size: usize,
    fetch_interval: Duration,
    shutdown_rx: ShutdownRx,
}

impl<S> DeliveryEngine<S>
where
    S: LogStore,
{
    pub fn new(
        store: S,
        transformer: EventTransformer,
        registry: DestinationRegistry,
        batch_size: usize,
        fetch_interval: Duration,
        shutdown_rx: ShutdownRx,
    ) -> DeliveryEngine<S> {
        DeliveryEngine {
            store,
            transformer,
            registry,
            batch_size,
            fetch_interval,
            shutdown_rx,
        }
    }

    /// Runs until shutdown is signalled.
    ///
    /// Batch errors are transient: they are logged and the loop continues on
    /// the next tick. On shutdown the current batch finishes first, then
    /// every destination is flushed.
    pub async fn run(mut self) -> RowcastResult<()> {
        info!(
            batch_size = self.batch_size,
            interval_ms = self.fetch_interval.as_millis() as u64,
            "starting delivery engine"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("shutdown requested, flushing destinations");
                        self.registry.shutdown().await;
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.drain().await;
                }
            }
        }
    }

    /// Processes batches back-to-back until the log is drained.
    ///
    /// A full batch loops immediately without waiting for the timer; a
    /// short batch means the log is (momentarily) empty. Shutdown is
    /// honored between batches so an in-flight transaction always
    /// finalizes.
    pub async fn drain(&mut self) {
        loop {
            if is_shutting_down(&self.shutdown_rx) {
                return;
            }
            match self.process_batch().await {
                Ok(BatchOutcome::Full) => {
                    debug!("processed a full batch, claiming again immediately");
                }
                Ok(BatchOutcome::Drained) => return,
                Err(error) => {
                    error!(%error, "error processing event batch");
                    return;
                }
            }
        }
    }

    async fn process_batch(&mut self) -> RowcastResult<BatchOutcome> {
        let (entries, mut batch) = self.store.claim(self.batch_size).await?;

        if entries.is_empty() {
            debug!("no events to process");
            self.store.flush(batch, &[]).await?;
            return Ok(BatchOutcome::Drained);
        }

        info!(count = entries.len(), "claimed events for processing");

        let retries_by_id: HashMap<i64, i32> =
            entries.iter().map(|entry| (entry.id, entry.retries)).collect();

        // Transform in ascending id order; failures are per-entry.
        let mut processed: Vec<ProcessedEvent> = Vec::new();
        let mut failed_updates: Vec<RetryUpdate> = Vec::new();
        for entry in &entries {
            match self.transformer.transform(entry) {
                Ok(Some(event)) => processed.push(event),
                Ok(None) => {
                    debug!(event_id = entry.id, "entry produced no event");
                }
                Err(transform_error) => {
                    warn!(
                        error = %transform_error,
                        event_id = entry.id,
                        table = entry.table,
                        "failed to transform entry, scheduling retry"
                    );
                    failed_updates.push(retry_update(
                        entry.id,
                        entry.retries,
                        &transform_error.to_string(),
                        Utc::now(),
                    ));
                }
            }
        }

        self.fan_out_processed(&processed, &retries_by_id, &mut failed_updates)
            .await;
        self.fan_out_raw(&entries, &retries_by_id, &mut failed_updates)
            .await;

        // Reconcile: an id with any failure survives in the log; everything
        // else is deleted. Both writes land in the claiming transaction.
        let merged = merge_retry_updates(failed_updates);
        let failed_ids: BTreeSet<i64> = merged.iter().map(|update| update.id).collect();
        let delete_ids: Vec<i64> = entries
            .iter()
            .map(|entry| entry.id)
            .filter(|id| !failed_ids.contains(id))
            .collect();

        if !merged.is_empty()
            && let Err(update_error) = self.store.update_retries(&mut batch, &merged).await
        {
            self.store.rollback(batch).await.ok();
            return Err(update_error);
        }
        self.store.flush(batch, &delete_ids).await?;

        info!(
            delivered = delete_ids.len(),
            retried = merged.len(),
            "committed event batch"
        );

        if entries.len() == self.batch_size {
            Ok(BatchOutcome::Full)
        } else {
            Ok(BatchOutcome::Drained)
        }
    }

    async fn fan_out_processed(
        &self,
        events: &[ProcessedEvent],
        retries_by_id: &HashMap<i64, i32>,
        failed_updates: &mut Vec<RetryUpdate>,
    ) {
        if events.is_empty() {
            return;
        }

        for binding in self.registry.processed() {
            let filtered: Vec<ProcessedEvent> = events
                .iter()
                .filter(|event| binding.filter.matches(&event.name))
                .cloned()
                .collect();
            if filtered.is_empty() {
                debug!(kind = binding.kind, "no events match destination filter");
                continue;
            }

            match binding.sink.send_batch(&filtered).await {
                Ok(event_errors) => {
                    for event_error in event_errors {
                        warn!(
                            kind = binding.kind,
                            event_id = event_error.source_id,
                            error = %event_error.error,
                            "destination rejected event, scheduling retry"
                        );
                        record_failure(
                            failed_updates,
                            retries_by_id,
                            event_error.source_id,
                            &event_error.error,
                        );
                    }
                }
                Err(batch_error) => {
                    // The whole call failed: every id handed to this sink is
                    // retried, but the tick still commits with the updates.
                    warn!(
                        error = %batch_error,
                        kind = binding.kind,
                        count = filtered.len(),
                        "destination failed whole batch, scheduling retries"
                    );
                    let message = batch_error.to_string();
                    for event in &filtered {
                        record_failure(failed_updates, retries_by_id, event.source_id, &message);
                    }
                }
            }
        }
    }

    async fn fan_out_raw(
        &self,
        entries: &[LogEntry],
        retries_by_id: &HashMap<i64, i32>,
        failed_updates: &mut Vec<RetryUpdate>,
    ) {
        for binding in self.registry.raw() {
            let filtered: Vec<LogEntry> = entries
                .iter()
                .filter(|entry| binding.filter.matches(&entry.table))
                .cloned()
                .collect();
            if filtered.is_empty() {
                debug!(kind = binding.kind, "no entries match destination filter");
                continue;
            }

            match binding.sink.send_batch(&filtered).await {
                Ok(event_errors) => {
                    for event_error in event_errors {
                        warn!(
                            kind = binding.kind,
                            event_id = event_error.source_id,
                            error = %event_error.error,
                            "raw destination rejected entry, scheduling retry"
                        );
                        record_failure(
                            failed_updates,
                            retries_by_id,
                            event_error.source_id,
                            &event_error.error,
                        );
                    }
                }
                Err(batch_error) => {
                    warn!(
                        error = %batch_error,
                        kind = binding.kind,
                        count = filtered.len(),
                        "raw destination failed whole batch, scheduling retries"
                    );
                    let message = batch_error.to_string();
                    for entry in &filtered {
                        record_failure(failed_updates, retries_by_id, entry.id, &message);
                    }
                }
            }
        }
    }
}

fn record_failure(
    failed_updates: &mut Vec<RetryUpdate>,
    retries_by_id: &HashMap<i64, i32>,
    source_id: i64,
    message: &str,
) {
    let retries = retries_by_id.get(&source_id).copied().unwrap_or(0);
    failed_updates.push(retry_update(source_id, retries, message, Utc::now()));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown;
    use crate::destination::loopback::LoopbackEventSink;
    use crate::destination::memory::{MemoryEventSink, MemoryRawSink};
    use crate::destination::DestinationFilter;
    use crate::rules::RuleSet;
    use crate::store::memory::MemoryLogStore;
    use crate::test_utils::{
        FailingEventSink, FailureMode, LogEntryExt, log_entry, tracking_document,
        users_orders_descriptor,
    };
    use rowcast_postgres::types::EventKind;

    const TRACK_USERS_AND_ORDERS: &str = r#"
track:
  users.insert:
    event: user_signed_up
    properties:
      email: new.email
  orders.insert:
    event: order_created
    properties:
      user_id: new.user_id
      total: new.total
"#;

    fn transformer(yaml: &str) -> EventTransformer {
        let document = tracking_document(yaml);
        let rules =
            RuleSet::compile(&document, Some(Arc::new(users_orders_descriptor()))).unwrap();
        EventTransformer::new(Arc::new(rules), "public")
    }

    fn engine(
        store: MemoryLogStore,
        registry: DestinationRegistry,
        batch_size: usize,
    ) -> DeliveryEngine<MemoryLogStore> {
        let (_shutdown_tx, shutdown_rx) = create_shutdown();
        DeliveryEngine::new(
            store,
            transformer(TRACK_USERS_AND_ORDERS),
            registry,
            batch_size,
            Duration::from_millis(10),
            shutdown_rx,
        )
    }

    fn user_insert(id: i64) -> LogEntry {
        log_entry(id, EventKind::Insert, "users")
            .with_new_row(json!({"id": id, "email": format!("user{id}@example.com")}))
    }

    #[tokio::test]
    async fn delivers_transforms_and_deletes_in_id_order() {
        let store = MemoryLogStore::new();
        for id in [3, 1, 2] {
            store.insert(user_insert(id));
        }

        let sink = MemoryEventSink::new();
        let raw_sink = MemoryRawSink::new();
        let mut registry = DestinationRegistry::new();
        registry.add_processed("memory", DestinationFilter::match_all(), Box::new(sink.clone()));
        registry.add_raw("memory", DestinationFilter::match_all(), Box::new(raw_sink.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        assert!(store.is_empty());
        assert_eq!(store.leaked_handles(), 0);

        let delivered = sink.events();
        assert_eq!(
            delivered.iter().map(|e| e.source_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(delivered[0].name, "user_signed_up");
        assert_eq!(
            raw_sink.entries().iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn empty_log_makes_no_sink_calls() {
        let store = MemoryLogStore::new();
        let sink = MemoryEventSink::new();
        let raw_sink = MemoryRawSink::new();
        let mut registry = DestinationRegistry::new();
        registry.add_processed("memory", DestinationFilter::match_all(), Box::new(sink.clone()));
        registry.add_raw("memory", DestinationFilter::match_all(), Box::new(raw_sink.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        assert!(sink.batches().is_empty());
        assert!(raw_sink.batches().is_empty());
        assert_eq!(store.leaked_handles(), 0);
    }

    #[tokio::test]
    async fn untracked_entries_are_deleted_without_emission() {
        let store = MemoryLogStore::new();
        store.insert(
            log_entry(1, EventKind::Delete, "users").with_old_row(json!({"id": 1, "email": "x"})),
        );

        let sink = MemoryEventSink::new();
        let mut registry = DestinationRegistry::new();
        registry.add_processed("memory", DestinationFilter::match_all(), Box::new(sink.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        assert!(store.is_empty());
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn partial_sink_failure_retries_only_the_failed_id() {
        let store = MemoryLogStore::new();
        for id in [41, 42, 43] {
            store.insert(user_insert(id));
        }

        let healthy = FailingEventSink::new(FailureMode::None);
        let flaky = FailingEventSink::new(FailureMode::PerEvent(vec![42]));
        let mut registry = DestinationRegistry::new();
        registry.add_processed("a", DestinationFilter::match_all(), Box::new(healthy.clone()));
        registry.add_processed("b", DestinationFilter::match_all(), Box::new(flaky.clone()));

        let before = Utc::now();
        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        // 41 and 43 are gone; 42 survives with retry metadata.
        assert_eq!(store.entries().iter().map(|e| e.id).collect::<Vec<_>>(), vec![42]);
        let survivor = store.entry(42).unwrap();
        assert_eq!(survivor.retries, 1);
        assert_eq!(survivor.last_error.as_deref(), Some("event rejected"));
        let process_after = survivor.process_after.unwrap();
        assert!(process_after >= before + ChronoDuration::minutes(1));
        assert!(process_after <= Utc::now() + ChronoDuration::minutes(1));

        // The retained row is not eligible again until its backoff elapses.
        engine.drain().await;
        assert_eq!(store.entry(42).unwrap().retries, 1);
    }

    #[tokio::test]
    async fn whole_batch_failure_retains_everything_but_commits_updates() {
        let store = MemoryLogStore::new();
        for id in [1, 2] {
            store.insert(user_insert(id));
        }

        let broken = FailingEventSink::new(FailureMode::WholeBatch);
        let mut registry = DestinationRegistry::new();
        registry.add_processed("broken", DestinationFilter::match_all(), Box::new(broken.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        assert_eq!(store.len(), 2);
        for entry in store.entries() {
            assert_eq!(entry.retries, 1);
            assert_eq!(entry.last_error.as_deref(), Some("sink unavailable"));
            assert!(entry.process_after.unwrap() > Utc::now());
        }
        assert_eq!(store.leaked_handles(), 0);
    }

    #[tokio::test]
    async fn failures_in_two_sinks_merge_into_one_update() {
        let store = MemoryLogStore::new();
        store.insert(user_insert(42));

        let flaky = FailingEventSink::new(FailureMode::PerEvent(vec![42]));
        let broken = FailingEventSink::new(FailureMode::WholeBatch);
        let mut registry = DestinationRegistry::new();
        registry.add_processed("a", DestinationFilter::match_all(), Box::new(flaky.clone()));
        registry.add_processed("b", DestinationFilter::match_all(), Box::new(broken.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        let survivor = store.entry(42).unwrap();
        assert_eq!(survivor.retries, 1);
        assert_eq!(
            survivor.last_error.as_deref(),
            Some("event rejected; sink unavailable")
        );
    }

    #[tokio::test]
    async fn transform_failures_retry_per_entry_while_the_rest_deliver() {
        let store = MemoryLogStore::new();
        // Entry 1 is fine; entry 2 violates the presence rule.
        store.insert(user_insert(1));
        store.insert(log_entry(2, EventKind::Insert, "users"));

        let sink = MemoryEventSink::new();
        let mut registry = DestinationRegistry::new();
        registry.add_processed("memory", DestinationFilter::match_all(), Box::new(sink.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        assert_eq!(sink.events().iter().map(|e| e.source_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(store.entries().iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.entry(2).unwrap().retries, 1);
    }

    #[tokio::test]
    async fn filters_route_events_and_tables_independently() {
        let store = MemoryLogStore::new();
        store.insert(user_insert(1));
        store.insert(log_entry(2, EventKind::Insert, "orders").with_new_row(
            json!({"id": 2, "user_id": 7, "status": "pending", "total": 9.5}),
        ));

        let user_sink = MemoryEventSink::new();
        let order_raw_sink = MemoryRawSink::new();
        let mut registry = DestinationRegistry::new();
        registry.add_processed(
            "users-only",
            DestinationFilter::new("user_*").unwrap(),
            Box::new(user_sink.clone()),
        );
        registry.add_raw(
            "orders-only",
            DestinationFilter::new("orders").unwrap(),
            Box::new(order_raw_sink.clone()),
        );

        let mut engine = engine(store.clone(), registry, 1000);
        engine.drain().await;

        let delivered = user_sink.events();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].name, "user_signed_up");

        let raw = order_raw_sink.entries();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].table, "orders");

        // Unmatched destinations are not an error: everything is delivered.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn full_batches_drain_back_to_back_without_the_timer() {
        let store = MemoryLogStore::new();
        for id in 1..=2500 {
            store.insert(user_insert(id));
        }

        let sink = MemoryEventSink::new();
        let mut registry = DestinationRegistry::new();
        registry.add_processed("memory", DestinationFilter::match_all(), Box::new(sink.clone()));

        let mut engine = engine(store.clone(), registry, 1000);
        // One drain call corresponds to one timer tick.
        engine.drain().await;

        assert!(store.is_empty());
        let batch_sizes: Vec<usize> = sink.batches().iter().map(|b| b.len()).collect();
        assert_eq!(batch_sizes, vec![1000, 1000, 500]);
    }

    #[tokio::test]
    async fn run_flushes_destinations_on_shutdown() {
        let store = MemoryLogStore::new();
        store.insert(user_insert(1));

        let (sink, mut rx) = LoopbackEventSink::channel();
        let mut registry = DestinationRegistry::new();
        registry.add_processed("loopback", DestinationFilter::match_all(), Box::new(sink));

        let (shutdown_tx, shutdown_rx) = create_shutdown();
        let engine = DeliveryEngine::new(
            store.clone(),
            transformer(TRACK_USERS_AND_ORDERS),
            registry,
            1000,
            Duration::from_millis(10),
            shutdown_rx,
        );

        let handle = tokio::spawn(engine.run());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("engine should deliver before the timeout")
            .expect("channel open");
        assert_eq!(event.source_id, 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine should stop after shutdown")
            .unwrap()
            .unwrap();

        assert!(store.is_empty());
        assert_eq!(store.leaked_handles(), 0);
    }
}
