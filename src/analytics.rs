//! Per-day rollups of distance and indoor/outdoor time.
//!
//! Each accepted sample contributes the great-circle hop from the
//! previous sample plus the elapsed time, classified indoor or outdoor.
//! When the user's last shift of a day closes, the day's distance is
//! reconciled to the sum of the closed shifts so the rollup and the shift
//! rows agree.

use crate::cache::CacheLayer;
use crate::geo;
use crate::store::AnalyticsStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A fix counts as indoor when it is this coarse...
pub const INDOOR_ACCURACY_M: f64 = 20.0;
/// ...or this slow.
pub const INDOOR_SPEED_MPS: f64 = 0.5;
/// Gaps longer than this contribute no elapsed time (phone was off or
/// tracking was stopped; counting the gap would invent indoor hours).
const MAX_SAMPLE_GAP: chrono::Duration = chrono::Duration::minutes(10);
/// Last-sample marker TTL.
const LAST_SAMPLE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LastSample {
    lat: f64,
    lon: f64,
    at: DateTime<Utc>,
}

/// One sample's contribution to the day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleDelta {
    pub distance_km: f64,
    pub travel_minutes: f64,
    pub indoor_minutes: f64,
    pub outdoor_minutes: f64,
}

/// Indoor/outdoor classification of a single fix.
pub fn is_indoor(accuracy_m: Option<f64>, speed_mps: Option<f64>) -> bool {
    accuracy_m.is_some_and(|a| a > INDOOR_ACCURACY_M)
        || speed_mps.map_or(true, |s| s < INDOOR_SPEED_MPS)
}

fn compute_delta(
    prev: LastSample,
    lat: f64,
    lon: f64,
    at: DateTime<Utc>,
    accuracy_m: Option<f64>,
    speed_mps: Option<f64>,
) -> SampleDelta {
    let mut delta = SampleDelta {
        distance_km: geo::distance_m(prev.lat, prev.lon, lat, lon) / 1000.0,
        ..Default::default()
    };
    let elapsed = at - prev.at;
    if elapsed > chrono::Duration::zero() && elapsed <= MAX_SAMPLE_GAP {
        let minutes = elapsed.num_milliseconds() as f64 / 60_000.0;
        if is_indoor(accuracy_m, speed_mps) {
            delta.indoor_minutes = minutes;
        } else {
            delta.outdoor_minutes = minutes;
        }
        if speed_mps.is_some_and(|s| s >= INDOOR_SPEED_MPS) {
            delta.travel_minutes = minutes;
        }
    }
    delta
}

pub struct AnalyticsAggregator {
    cache: Arc<CacheLayer>,
    store: AnalyticsStore,
}

impl AnalyticsAggregator {
    pub fn new(cache: Arc<CacheLayer>, store: AnalyticsStore) -> Arc<Self> {
        Arc::new(Self { cache, store })
    }

    fn key(user_id: i64) -> String {
        format!("analytics:last:{user_id}")
    }

    /// Fold one accepted sample into the user's daily row.
    pub async fn record_sample(
        &self,
        user_id: i64,
        lat: f64,
        lon: f64,
        at: DateTime<Utc>,
        accuracy_m: Option<f64>,
        speed_mps: Option<f64>,
    ) {
        let key = Self::key(user_id);
        let prev: Option<LastSample> = self
            .cache
            .get(&key)
            .await
            .and_then(|v| serde_json::from_str(&v).ok());

        let current = LastSample { lat, lon, at };
        if let Ok(json) = serde_json::to_string(&current) {
            self.cache.set(&key, &json, Some(LAST_SAMPLE_TTL)).await;
        }

        let Some(prev) = prev else { return };
        // Day boundaries between samples are rare enough to charge the
        // whole hop to the current day.
        let delta = compute_delta(prev, lat, lon, at, accuracy_m, speed_mps);
        if delta == SampleDelta::default() {
            return;
        }
        if let Err(e) = self
            .store
            .add(
                user_id,
                at.date_naive(),
                delta.distance_km,
                delta.travel_minutes,
                delta.indoor_minutes,
                delta.outdoor_minutes,
            )
            .await
        {
            warn!(user_id, error = %e, "analytics_add_failed");
        }
    }

    pub async fn ensure_day(&self, user_id: i64, date: NaiveDate) {
        if let Err(e) = self.store.ensure_row(user_id, date).await {
            warn!(user_id, error = %e, "analytics_ensure_failed");
        }
    }

    /// Reconcile the day to the closed-shift totals and drop the
    /// last-sample marker.
    pub async fn finalize_day(
        &self,
        user_id: i64,
        date: NaiveDate,
        distance_km: f64,
        travel_minutes: f64,
    ) {
        self.cache.del(&Self::key(user_id)).await;
        if let Err(e) = self
            .store
            .reconcile(user_id, date, distance_km, travel_minutes)
            .await
        {
            warn!(user_id, error = %e, "analytics_reconcile_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_indoor_classification() {
        // Coarse fix: indoor regardless of speed.
        assert!(is_indoor(Some(45.0), Some(3.0)));
        // Tight fix but stationary: indoor.
        assert!(is_indoor(Some(5.0), Some(0.1)));
        // Tight and moving: outdoor.
        assert!(!is_indoor(Some(5.0), Some(2.0)));
        // No speed report defaults to indoor.
        assert!(is_indoor(Some(5.0), None));
    }

    #[test]
    fn test_delta_accumulates_distance_and_time() {
        let prev = LastSample { lat: 12.97, lon: 77.59, at: t0() };
        // ~111 m east, 30 s later, moving.
        let d = compute_delta(prev, 12.97, 77.591, t0() + chrono::Duration::seconds(30), Some(8.0), Some(3.5));
        assert!((d.distance_km - 0.108).abs() < 0.01, "{}", d.distance_km);
        assert!((d.outdoor_minutes - 0.5).abs() < 1e-9);
        assert!((d.travel_minutes - 0.5).abs() < 1e-9);
        assert_eq!(d.indoor_minutes, 0.0);
    }

    #[test]
    fn test_delta_indoor_time_not_travel() {
        let prev = LastSample { lat: 12.97, lon: 77.59, at: t0() };
        let d = compute_delta(prev, 12.97, 77.59, t0() + chrono::Duration::seconds(60), Some(35.0), Some(0.0));
        assert_eq!(d.distance_km, 0.0);
        assert!((d.indoor_minutes - 1.0).abs() < 1e-9);
        assert_eq!(d.travel_minutes, 0.0);
        assert_eq!(d.outdoor_minutes, 0.0);
    }

    #[test]
    fn test_delta_ignores_long_gaps() {
        let prev = LastSample { lat: 12.97, lon: 77.59, at: t0() };
        let d = compute_delta(prev, 12.98, 77.60, t0() + chrono::Duration::hours(3), Some(5.0), Some(2.0));
        // Distance still counts; the three dark hours do not.
        assert!(d.distance_km > 0.0);
        assert_eq!(d.indoor_minutes + d.outdoor_minutes, 0.0);
    }

    #[test]
    fn test_delta_ignores_backwards_time() {
        let prev = LastSample { lat: 12.97, lon: 77.59, at: t0() };
        let d = compute_delta(prev, 12.97, 77.59, t0() - chrono::Duration::seconds(10), Some(5.0), Some(0.0));
        assert_eq!(d.indoor_minutes + d.outdoor_minutes + d.travel_minutes, 0.0);
    }
}
