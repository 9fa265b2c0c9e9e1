//! Process-wide observability counters, exposed verbatim on `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Metrics {
    pub ingested: AtomicU64,
    pub rejected: AtomicU64,
    pub background_accepted: AtomicU64,
    pub background_discarded: AtomicU64,
    pub broadcasts: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub retries_drained: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub cache_fallback_reads: AtomicU64,
    pub cache_reconnects: AtomicU64,
    pub geofence_transitions: AtomicU64,
    pub shifts_started: AtomicU64,
    pub shifts_ended: AtomicU64,
    pub shifts_auto_ended: AtomicU64,
    pub timer_reminders_sent: AtomicU64,
    pub sweeps_run: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub push_tokens_deactivated: AtomicU64,
    pub attendance_punches: AtomicU64,
    pub attendance_failures: AtomicU64,
    pub socket_connections: AtomicU64,
    pub socket_disconnections: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            background_accepted: self.background_accepted.load(Ordering::Relaxed),
            background_discarded: self.background_discarded.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_drained: self.retries_drained.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            cache_fallback_reads: self.cache_fallback_reads.load(Ordering::Relaxed),
            cache_reconnects: self.cache_reconnects.load(Ordering::Relaxed),
            geofence_transitions: self.geofence_transitions.load(Ordering::Relaxed),
            shifts_started: self.shifts_started.load(Ordering::Relaxed),
            shifts_ended: self.shifts_ended.load(Ordering::Relaxed),
            shifts_auto_ended: self.shifts_auto_ended.load(Ordering::Relaxed),
            timer_reminders_sent: self.timer_reminders_sent.load(Ordering::Relaxed),
            sweeps_run: self.sweeps_run.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            push_tokens_deactivated: self.push_tokens_deactivated.load(Ordering::Relaxed),
            attendance_punches: self.attendance_punches.load(Ordering::Relaxed),
            attendance_failures: self.attendance_failures.load(Ordering::Relaxed),
            socket_connections: self.socket_connections.load(Ordering::Relaxed),
            socket_disconnections: self.socket_disconnections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub ingested: u64,
    pub rejected: u64,
    pub background_accepted: u64,
    pub background_discarded: u64,
    pub broadcasts: u64,
    pub retries_scheduled: u64,
    pub retries_drained: u64,
    pub dead_lettered: u64,
    pub cache_fallback_reads: u64,
    pub cache_reconnects: u64,
    pub geofence_transitions: u64,
    pub shifts_started: u64,
    pub shifts_ended: u64,
    pub shifts_auto_ended: u64,
    pub timer_reminders_sent: u64,
    pub sweeps_run: u64,
    pub notifications_sent: u64,
    pub push_tokens_deactivated: u64,
    pub attendance_punches: u64,
    pub attendance_failures: u64,
    pub socket_connections: u64,
    pub socket_disconnections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = Metrics::new();
        m.ingested.fetch_add(3, Ordering::Relaxed);
        m.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let s = m.snapshot();
        assert_eq!(s.ingested, 3);
        assert_eq!(s.dead_lettered, 1);
        assert_eq!(s.rejected, 0);
    }
}
