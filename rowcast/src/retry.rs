//! Retry scheduling and update merging for failed log entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rowcast_postgres::types::RetryUpdate;

/// Longest backoff delay, in minutes.
const MAX_BACKOFF_MINUTES: i64 = 60;

/// Builds the retry update for an entry that failed with `error` at `now`.
///
/// The next attempt is scheduled `min(2^retries, 60)` minutes out, so the
/// delay ladder runs 1, 2, 4, 8, 16, 32, 60, 60, … No total retry cap is
/// applied; stuck rows are an operator concern.
pub fn retry_update(id: i64, current_retries: i32, error: &str, now: DateTime<Utc>) -> RetryUpdate {
    let exponent = current_retries.clamp(0, 62) as u32;
    let delay_minutes = 1i64
        .checked_shl(exponent)
        .unwrap_or(MAX_BACKOFF_MINUTES)
        .min(MAX_BACKOFF_MINUTES);

    RetryUpdate {
        id,
        retries: current_retries + 1,
        last_error: Some(error.to_string()),
        last_retry_at: Some(now),
        process_after: Some(now + Duration::minutes(delay_minutes)),
    }
}

/// Merges per-sink retry updates so each entry gets exactly one row update.
///
/// When several sinks fail the same id within one tick: retries takes the
/// max, distinct error messages are joined with `"; "` in the order they
/// were recorded, `process_after` takes the earliest schedule and
/// `last_retry_at` the latest attempt. Output is ordered by id.
pub fn merge_retry_updates(updates: Vec<RetryUpdate>) -> Vec<RetryUpdate> {
    let mut merged: BTreeMap<i64, RetryUpdate> = BTreeMap::new();

    for update in updates {
        match merged.get_mut(&update.id) {
            None => {
                merged.insert(update.id, update);
            }
            Some(existing) => {
                existing.retries = existing.retries.max(update.retries);

                match (&mut existing.last_error, update.last_error) {
                    (Some(current), Some(incoming)) => {
                        let already_recorded =
                            current.split("; ").any(|message| message == incoming);
                        if !already_recorded {
                            current.push_str("; ");
                            current.push_str(&incoming);
                        }
                    }
                    (current @ None, incoming @ Some(_)) => *current = incoming,
                    _ => {}
                }

                existing.process_after = match (existing.process_after, update.process_after) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                existing.last_retry_at = match (existing.last_retry_at, update.last_retry_at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
        }
    }

    merged.into_values().collect()
}
