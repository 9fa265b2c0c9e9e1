//! Per-user constant-velocity Kalman smoothing of raw GPS fixes.
//!
//! State vector is `[lat, lon, v_lat, v_lon]` in degrees and degrees/second.
//! The filter is deliberately linear: at walking/driving speeds over the
//! few-second sample intervals the mobile clients use, curvature of the
//! coordinate space is far below GPS noise.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Initial variance on every state component.
const INITIAL_COVARIANCE: f64 = 100.0;
/// Process noise on position components (degrees²).
const PROCESS_NOISE_POS: f64 = 0.01;
/// Process noise on velocity components.
const PROCESS_NOISE_VEL: f64 = 0.1;
/// Position↔velocity coupling in the process covariance.
const PROCESS_COUPLING: f64 = 0.1;
/// Measurement variance contributed per metre of reported accuracy.
const MEASUREMENT_NOISE_PER_M: f64 = 0.01;
/// Accuracy assumed when the client reports none.
const DEFAULT_ACCURACY_M: f64 = 10.0;
/// Prediction horizon cap; longer gaps re-seed rather than extrapolate.
const MAX_PREDICT_SECS: f64 = 120.0;

type Mat4 = [[f64; 4]; 4];

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    x: [f64; 4],
    p: Mat4,
    initialized: bool,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    pub fn new() -> Self {
        Self {
            x: [0.0; 4],
            p: diag(INITIAL_COVARIANCE),
            initialized: false,
        }
    }

    /// Feed one measurement, returning the smoothed (lat, lon).
    ///
    /// The first measurement seeds the filter and comes back unchanged.
    /// `dt_secs` is the time since the previous accepted measurement;
    /// non-positive values skip the prediction step.
    pub fn update(&mut self, lat: f64, lon: f64, accuracy_m: Option<f64>, dt_secs: f64) -> (f64, f64) {
        if !self.initialized {
            self.x = [lat, lon, 0.0, 0.0];
            self.p = diag(INITIAL_COVARIANCE);
            self.initialized = true;
            return (lat, lon);
        }

        let dt = dt_secs.clamp(0.0, MAX_PREDICT_SECS);
        if dt > 0.0 {
            self.predict(dt);
        }

        let r = accuracy_m.unwrap_or(DEFAULT_ACCURACY_M).max(1.0) * MEASUREMENT_NOISE_PER_M;

        // Innovation against the position components.
        let y = [lat - self.x[0], lon - self.x[1]];
        // S = H P Hᵀ + R is diagonal-dominant 2x2; invert directly.
        let s00 = self.p[0][0] + r;
        let s11 = self.p[1][1] + r;
        let s01 = self.p[0][1];
        let det = s00 * s11 - s01 * s01;
        if det.abs() < f64::EPSILON {
            self.reset();
            self.x = [lat, lon, 0.0, 0.0];
            self.initialized = true;
            return (lat, lon);
        }
        let inv = [[s11 / det, -s01 / det], [-s01 / det, s00 / det]];

        // K = P Hᵀ S⁻¹; only the first two columns of P participate.
        let mut k = [[0.0; 2]; 4];
        for (i, row) in k.iter_mut().enumerate() {
            let ph = [self.p[i][0], self.p[i][1]];
            row[0] = ph[0] * inv[0][0] + ph[1] * inv[1][0];
            row[1] = ph[0] * inv[0][1] + ph[1] * inv[1][1];
        }

        for i in 0..4 {
            self.x[i] += k[i][0] * y[0] + k[i][1] * y[1];
        }

        // P = (I − K H) P
        let mut next = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                let kh = k[i][0] * self.p[0][j] + k[i][1] * self.p[1][j];
                next[i][j] = self.p[i][j] - kh;
            }
        }
        self.p = next;

        if self.x.iter().any(|v| !v.is_finite()) {
            // Numerical blow-up: fall back to the raw fix and re-seed.
            self.reset();
            self.x = [lat, lon, 0.0, 0.0];
            self.initialized = true;
            return (lat, lon);
        }

        (self.x[0], self.x[1])
    }

    fn predict(&mut self, dt: f64) {
        // x' = F x with F the constant-velocity transition.
        self.x[0] += self.x[2] * dt;
        self.x[1] += self.x[3] * dt;

        // P' = F P Fᵀ + Q, expanded for the sparse F.
        let p = &self.p;
        let mut fp = [[0.0; 4]; 4];
        for j in 0..4 {
            fp[0][j] = p[0][j] + dt * p[2][j];
            fp[1][j] = p[1][j] + dt * p[3][j];
            fp[2][j] = p[2][j];
            fp[3][j] = p[3][j];
        }
        let mut next = [[0.0; 4]; 4];
        for i in 0..4 {
            next[i][0] = fp[i][0] + dt * fp[i][2];
            next[i][1] = fp[i][1] + dt * fp[i][3];
            next[i][2] = fp[i][2];
            next[i][3] = fp[i][3];
        }
        next[0][0] += PROCESS_NOISE_POS;
        next[1][1] += PROCESS_NOISE_POS;
        next[2][2] += PROCESS_NOISE_VEL;
        next[3][3] += PROCESS_NOISE_VEL;
        next[0][2] += PROCESS_COUPLING;
        next[2][0] += PROCESS_COUPLING;
        next[1][3] += PROCESS_COUPLING;
        next[3][1] += PROCESS_COUPLING;
        self.p = next;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

fn diag(v: f64) -> Mat4 {
    let mut m = [[0.0; 4]; 4];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = v;
    }
    m
}

struct UserFilter {
    filter: KalmanFilter,
    last_seen: DateTime<Utc>,
}

/// Registry of per-user filters.
///
/// A socket connection owns its user's slot and releases it on disconnect;
/// the REST path shares the same slot so interleaved transports smooth
/// against one trajectory.
#[derive(Default)]
pub struct SmootherRegistry {
    filters: DashMap<i64, UserFilter>,
}

impl SmootherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smooth one fix for `user_id` stamped at `at`.
    pub fn smooth(
        &self,
        user_id: i64,
        lat: f64,
        lon: f64,
        accuracy_m: Option<f64>,
        at: DateTime<Utc>,
    ) -> (f64, f64) {
        let mut entry = self.filters.entry(user_id).or_insert_with(|| UserFilter {
            filter: KalmanFilter::new(),
            last_seen: at,
        });
        let dt = (at - entry.last_seen).num_milliseconds() as f64 / 1000.0;
        entry.last_seen = at;
        entry.filter.update(lat, lon, accuracy_m, dt)
    }

    /// Drop the user's filter state (socket disconnect, shift end).
    pub fn release(&self, user_id: i64) {
        self.filters.remove(&user_id);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_first_sample_passes_through() {
        let mut f = KalmanFilter::new();
        let (lat, lon) = f.update(12.9716, 77.5946, Some(10.0), 0.0);
        assert_eq!(lat, 12.9716);
        assert_eq!(lon, 77.5946);
    }

    #[test]
    fn test_smoothed_output_finite() {
        let mut f = KalmanFilter::new();
        f.update(12.97, 77.59, Some(5.0), 0.0);
        for i in 1..100 {
            let (lat, lon) = f.update(12.97 + i as f64 * 1e-4, 77.59, Some(5.0), 5.0);
            assert!(lat.is_finite() && lon.is_finite());
        }
    }

    #[test]
    fn test_stationary_samples_converge_to_point() {
        let mut f = KalmanFilter::new();
        for _ in 0..50 {
            f.update(12.97, 77.59, Some(10.0), 5.0);
        }
        let (lat, lon) = f.update(12.97, 77.59, Some(10.0), 5.0);
        assert!((lat - 12.97).abs() < 1e-6, "lat drifted to {lat}");
        assert!((lon - 77.59).abs() < 1e-6, "lon drifted to {lon}");
    }

    #[test]
    fn test_noisy_fix_is_pulled_toward_track() {
        let mut f = KalmanFilter::new();
        for _ in 0..20 {
            f.update(12.9700, 77.5900, Some(5.0), 5.0);
        }
        // A single 500 m-ish outlier with poor accuracy must not be
        // swallowed whole.
        let (lat, _) = f.update(12.9745, 77.5900, Some(100.0), 5.0);
        assert!(lat < 12.9745);
        assert!(lat > 12.9700);
    }

    #[test]
    fn test_reset_reseeds_on_next_sample() {
        let mut f = KalmanFilter::new();
        f.update(12.97, 77.59, Some(10.0), 0.0);
        f.update(12.98, 77.60, Some(10.0), 5.0);
        f.reset();
        let (lat, lon) = f.update(40.0, -74.0, Some(10.0), 5.0);
        assert_eq!((lat, lon), (40.0, -74.0));
    }

    #[test]
    fn test_registry_tracks_users_independently() {
        let reg = SmootherRegistry::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let a = reg.smooth(1, 12.97, 77.59, Some(10.0), t0);
        let b = reg.smooth(2, 40.71, -74.0, Some(10.0), t0);
        assert_eq!(a, (12.97, 77.59));
        assert_eq!(b, (40.71, -74.0));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_registry_release_forgets_history() {
        let reg = SmootherRegistry::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        reg.smooth(7, 12.97, 77.59, Some(10.0), t0);
        reg.release(7);
        // Fresh filter: the far-away fix seeds rather than smooths.
        let (lat, lon) = reg.smooth(7, 41.0, 29.0, Some(10.0), t1);
        assert_eq!((lat, lon), (41.0, 29.0));
    }

    #[test]
    fn test_backwards_timestamp_does_not_panic() {
        let reg = SmootherRegistry::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let earlier = t0 - chrono::Duration::seconds(45);
        reg.smooth(3, 12.97, 77.59, Some(10.0), t0);
        let (lat, lon) = reg.smooth(3, 12.9701, 77.5901, Some(10.0), earlier);
        assert!(lat.is_finite() && lon.is_finite());
    }
}
