//! Bounded exponential-backoff retry of failed location writes, plus the
//! shared backoff helpers used by the cache reconnect loop and the
//! attendance bridge.
//!
//! Queue layout in the cache (the facade exposes no SCAN, so membership is
//! tracked in explicit index keys):
//!
//!   retry:location:<uid>        payload envelope, TTL ≈ backoff delay
//!   retry:location:<uid>:count  attempt counter
//!   retry:location:keys         JSON array of live payload keys
//!   dead:location:<uid>:<ts>    dead-lettered envelope
//!   dead:location:<uid>:keys    JSON array of that user's dead keys

use crate::cache::CacheLayer;
use crate::metrics::Metrics;
use crate::models::LocationUpdate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(10);
pub const MAX_ATTEMPTS: u32 = 3;

/// How long past its due time a payload stays readable. One drain period,
/// so the minute sweep always sees a live payload before it expires.
const DRAIN_GRACE: Duration = Duration::from_secs(60);
/// Attempt counters outlive their payloads by this much.
const COUNTER_TTL: Duration = Duration::from_secs(3600);
/// Dead letters are kept for a day for diagnosis.
const DEAD_TTL: Duration = Duration::from_secs(86_400);

const PENDING_INDEX: &str = "retry:location:keys";

/// `min(base · 2^(attempt−1), max)`; attempt is 1-based.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Run `op` up to `attempts` times, sleeping the backoff schedule between
/// failures that `should_retry` approves.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    mut op: F,
    base: Duration,
    max: Duration,
    attempts: u32,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && should_retry(&e) => {
                tokio::time::sleep(backoff_delay(attempt, base, max)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Envelope stored at the retry / dead-letter keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub user_id: i64,
    pub payload: LocationUpdate,
    pub error: String,
    pub attempt: u32,
    pub queued_at: DateTime<Utc>,
    pub due: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Queued for another attempt after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempt budget exhausted; payload moved to the dead-letter set.
    DeadLettered,
}

pub struct RetryQueue {
    cache: Arc<CacheLayer>,
    metrics: Arc<Metrics>,
}

impl RetryQueue {
    pub fn new(cache: Arc<CacheLayer>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self { cache, metrics })
    }

    fn payload_key(user_id: i64) -> String {
        format!("retry:location:{user_id}")
    }

    fn counter_key(user_id: i64) -> String {
        format!("retry:location:{user_id}:count")
    }

    fn dead_index_key(user_id: i64) -> String {
        format!("dead:location:{user_id}:keys")
    }

    /// Record a failed write for later re-processing.
    pub async fn schedule(
        &self,
        user_id: i64,
        payload: &LocationUpdate,
        error: &str,
    ) -> ScheduleOutcome {
        let counter_key = Self::counter_key(user_id);
        let attempt = self
            .cache
            .get(&counter_key)
            .await
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        if attempt > MAX_ATTEMPTS {
            self.dead_letter(user_id, payload, error, attempt).await;
            return ScheduleOutcome::DeadLettered;
        }

        let delay = backoff_delay(attempt, BASE_DELAY, MAX_DELAY);
        let now = Utc::now();
        let record = RetryRecord {
            user_id,
            payload: payload.clone(),
            error: error.to_string(),
            attempt,
            queued_at: now,
            due: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        };

        let key = Self::payload_key(user_id);
        if let Ok(json) = serde_json::to_string(&record) {
            self.cache.set(&key, &json, Some(delay + DRAIN_GRACE)).await;
        }
        self.cache
            .set(&counter_key, &attempt.to_string(), Some(COUNTER_TTL))
            .await;
        self.index_add(PENDING_INDEX, &key).await;

        self.metrics.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        info!(user_id, attempt, delay_ms = delay.as_millis() as u64, "location_retry_scheduled");
        ScheduleOutcome::Retry { attempt, delay }
    }

    async fn dead_letter(&self, user_id: i64, payload: &LocationUpdate, error: &str, attempt: u32) {
        let now = Utc::now();
        let dead_key = format!("dead:location:{user_id}:{}", now.timestamp_millis());
        let record = RetryRecord {
            user_id,
            payload: payload.clone(),
            error: error.to_string(),
            attempt,
            queued_at: now,
            due: now,
        };
        if let Ok(json) = serde_json::to_string(&record) {
            self.cache.set(&dead_key, &json, Some(DEAD_TTL)).await;
        }
        self.index_add(&Self::dead_index_key(user_id), &dead_key).await;

        // Clear state so a future failure starts a fresh schedule.
        self.cache.del(&Self::payload_key(user_id)).await;
        self.cache.del(&Self::counter_key(user_id)).await;
        self.index_remove(PENDING_INDEX, &Self::payload_key(user_id)).await;

        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        warn!(user_id, attempt, "location_retry_dead_lettered");
    }

    /// Collect every due payload, removing each from the queue. The caller
    /// re-ingests them; a failure there schedules a fresh attempt against
    /// the surviving counter. Index entries whose payload expired are
    /// pruned.
    pub async fn take_due(&self) -> Vec<RetryRecord> {
        let keys = self.read_index(PENDING_INDEX).await;
        if keys.is_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let mut due = Vec::new();
        let mut survivors = Vec::new();
        for key in keys {
            match self.cache.get(&key).await {
                Some(json) => match serde_json::from_str::<RetryRecord>(&json) {
                    Ok(record) if record.due <= now => {
                        self.cache.del(&key).await;
                        due.push(record);
                    }
                    Ok(_) => survivors.push(key),
                    Err(e) => {
                        warn!(key, error = %e, "retry_payload_corrupt");
                        self.cache.del(&key).await;
                    }
                },
                // Expired payload: prune from the index.
                None => {}
            }
        }
        self.write_index(PENDING_INDEX, &survivors).await;
        if !due.is_empty() {
            self.metrics
                .retries_drained
                .fetch_add(due.len() as u64, Ordering::Relaxed);
        }
        due
    }

    /// The attempt counter is cleared once a re-ingest finally succeeds.
    pub async fn clear_attempts(&self, user_id: i64) {
        self.cache.del(&Self::counter_key(user_id)).await;
    }

    /// Pending and dead-lettered envelopes for one user, for the
    /// `location:get_failed` socket query.
    pub async fn failed_updates(&self, user_id: i64) -> Vec<RetryRecord> {
        let mut out = Vec::new();
        if let Some(json) = self.cache.get(&Self::payload_key(user_id)).await {
            if let Ok(record) = serde_json::from_str(&json) {
                out.push(record);
            }
        }
        for key in self.read_index(&Self::dead_index_key(user_id)).await {
            if let Some(json) = self.cache.get(&key).await {
                if let Ok(record) = serde_json::from_str(&json) {
                    out.push(record);
                }
            }
        }
        out
    }

    async fn read_index(&self, index: &str) -> Vec<String> {
        self.cache
            .get(index)
            .await
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default()
    }

    async fn write_index(&self, index: &str, keys: &[String]) {
        if keys.is_empty() {
            self.cache.del(index).await;
        } else if let Ok(json) = serde_json::to_string(keys) {
            self.cache.set(index, &json, Some(DEAD_TTL)).await;
        }
    }

    async fn index_add(&self, index: &str, key: &str) {
        let mut keys = self.read_index(index).await;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
        self.write_index(index, &keys).await;
    }

    async fn index_remove(&self, index: &str, key: &str) {
        let mut keys = self.read_index(index).await;
        keys.retain(|k| k != key);
        self.write_index(index, &keys).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<RetryQueue> {
        let metrics = Metrics::new();
        RetryQueue::new(CacheLayer::local_only(metrics.clone()), metrics)
    }

    fn sample() -> LocationUpdate {
        serde_json::from_str(r#"{"latitude": 12.97, "longitude": 77.59}"#).unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1, BASE_DELAY, MAX_DELAY), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, BASE_DELAY, MAX_DELAY), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, BASE_DELAY, MAX_DELAY), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, BASE_DELAY, MAX_DELAY), Duration::from_secs(8));
        // Capped.
        assert_eq!(backoff_delay(5, BASE_DELAY, MAX_DELAY), Duration::from_secs(10));
        assert_eq!(backoff_delay(30, BASE_DELAY, MAX_DELAY), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_attempts_escalate_then_dead_letter() {
        let q = queue();
        let s = sample();

        for expected in 1..=MAX_ATTEMPTS {
            match q.schedule(7, &s, "db down").await {
                ScheduleOutcome::Retry { attempt, delay } => {
                    assert_eq!(attempt, expected);
                    assert_eq!(delay, backoff_delay(expected, BASE_DELAY, MAX_DELAY));
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(q.schedule(7, &s, "db down").await, ScheduleOutcome::DeadLettered);

        // Counter cleared: the next failure starts over at attempt 1.
        match q.schedule(7, &s, "db down").await {
            ScheduleOutcome::Retry { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected fresh retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dead_letter_appears_exactly_once() {
        let q = queue();
        let s = sample();
        for _ in 0..=MAX_ATTEMPTS {
            q.schedule(9, &s, "boom").await;
        }
        let dead: Vec<RetryRecord> = q
            .failed_updates(9)
            .await
            .into_iter()
            .filter(|r| r.attempt > MAX_ATTEMPTS)
            .collect();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].user_id, 9);
    }

    #[tokio::test]
    async fn test_take_due_returns_nothing_before_delay() {
        let q = queue();
        q.schedule(3, &sample(), "transient").await;
        // Due in ≥1 s; an immediate drain must leave it queued.
        assert!(q.take_due().await.is_empty());
        assert_eq!(q.failed_updates(3).await.len(), 1);
    }

    #[tokio::test]
    async fn test_take_due_after_delay_drains_and_removes() {
        let q = queue();
        q.schedule(4, &sample(), "transient").await;
        // First attempt is due 1 s out.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let due = q.take_due().await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].user_id, 4);
        assert_eq!(due[0].attempt, 1);
        // Drained payloads leave the queue.
        assert!(q.take_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_attempts_resets_counter() {
        let q = queue();
        let s = sample();
        q.schedule(5, &s, "x").await;
        q.schedule(5, &s, "x").await;
        q.clear_attempts(5).await;
        match q.schedule(5, &s, "x").await {
            ScheduleOutcome::Retry { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected attempt 1, got {other:?}"),
        }
    }
}
