//! Periodic jobs: the minute tick (auto-end sweep, timer reminders, retry
//! drain, cache scrub) and the nightly error-log purge.
//!
//! Each loop runs its jobs sequentially, so a tick can never overlap the
//! previous one; a slow sweep simply delays the next tick. Job failures
//! are logged and never take a sibling job down.

use crate::cache::CacheLayer;
use crate::error::ErrorLogger;
use crate::ingest::LocationIngest;
use crate::retry::RetryQueue;
use crate::shift::{ShiftEngine, REMINDER_MINUTES};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Error-log rows older than this are purged nightly.
const ERROR_LOG_RETENTION_DAYS: i64 = 30;
/// Local wall-clock hour of the nightly maintenance run.
const DAILY_RUN_HOUR: u32 = 2;

pub struct Scheduler {
    shift_engine: Arc<ShiftEngine>,
    retry: Arc<RetryQueue>,
    ingest: Arc<LocationIngest>,
    cache: Arc<CacheLayer>,
    error_log: Arc<ErrorLogger>,
}

impl Scheduler {
    pub fn new(
        shift_engine: Arc<ShiftEngine>,
        retry: Arc<RetryQueue>,
        ingest: Arc<LocationIngest>,
        cache: Arc<CacheLayer>,
        error_log: Arc<ErrorLogger>,
    ) -> Arc<Self> {
        Arc::new(Self { shift_engine, retry, ingest, cache, error_log })
    }

    /// Spawn both loops. They run for the life of the process.
    pub fn spawn(self: &Arc<Self>) {
        let minute = self.clone();
        tokio::spawn(async move { minute.minute_loop().await });
        let daily = self.clone();
        tokio::spawn(async move { daily.daily_loop().await });
    }

    async fn minute_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.shift_engine.auto_end_sweep().await;
            self.shift_engine.send_timer_reminders(REMINDER_MINUTES).await;
            self.drain_retries().await;
            let scrubbed = self.cache.cleanup();
            if scrubbed > 0 {
                info!(scrubbed, "cache_scrub");
            }
        }
    }

    async fn drain_retries(&self) {
        let due = self.retry.take_due().await;
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "retry_drain");
        for record in due {
            self.ingest.reprocess(record).await;
        }
    }

    async fn daily_loop(self: Arc<Self>) {
        loop {
            let wait = until_next_daily_run(Local::now());
            tokio::time::sleep(wait).await;
            info!("daily_maintenance");
            match self.error_log.purge_older_than_days(ERROR_LOG_RETENTION_DAYS).await {
                Ok(purged) => info!(purged, "error_log_purged"),
                Err(e) => {
                    warn!(error = %e, "error_log_purge_failed");
                    self.error_log
                        .log("scheduler", "log-purge", &e.to_string(), None, serde_json::json!({}))
                        .await;
                }
            }
        }
    }
}

/// Time to sleep until the next local 02:00.
fn until_next_daily_run(now: DateTime<Local>) -> Duration {
    let today_run = now
        .with_hour(DAILY_RUN_HOUR)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next = if today_run > now { today_run } else { today_run + ChronoDuration::days(1) };
    (next - now).to_std().unwrap_or(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wait_before_run_time_is_same_day() {
        let now = Local.with_ymd_and_hms(2025, 6, 1, 0, 30, 0).unwrap();
        let wait = until_next_daily_run(now);
        assert_eq!(wait, Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_wait_after_run_time_rolls_to_tomorrow() {
        let now = Local.with_ymd_and_hms(2025, 6, 1, 2, 0, 1).unwrap();
        let wait = until_next_daily_run(now);
        // One second past 02:00 waits a hair under 24 h.
        assert!(wait > Duration::from_secs(23 * 3600));
        assert!(wait < Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_wait_exactly_at_run_time_rolls_over() {
        let now = Local.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();
        let wait = until_next_daily_run(now);
        assert_eq!(wait, Duration::from_secs(24 * 3600));
    }
}
