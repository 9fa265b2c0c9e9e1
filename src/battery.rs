//! Battery-adaptive sampling intervals.
//!
//! The client asks how long to wait before its next fix; the answer trades
//! track fidelity against battery drain. Charging phones sample fast, dying
//! phones sample slow, stationary phones back off progressively, and phones
//! near a fence edge sample a little faster for crisper entry/exit timing.

use crate::cache::CacheLayer;
use crate::models::CompanyRecord;
use std::sync::Arc;
use std::time::Duration;

/// Fastest interval ever handed out.
pub const MIN_INTERVAL: Duration = Duration::from_secs(10);
/// Slowest interval ever handed out.
pub const MAX_INTERVAL: Duration = Duration::from_secs(300);
/// Speeds above this count as movement.
pub const MOVING_SPEED_MPS: f64 = 0.5;
/// Stationary backoff stops growing after this many consecutive idle fixes.
const STATIONARY_CAP: u32 = 5;
/// Stationary counters die with inactivity.
const COUNTER_TTL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInput {
    pub battery_pct: Option<f64>,
    pub is_charging: bool,
    pub speed_mps: Option<f64>,
    pub in_geofence: bool,
}

/// Interval derivation as a pure function of the inputs.
pub fn compute_interval(
    input: PolicyInput,
    consecutive_stationary: u32,
    company: Option<&CompanyRecord>,
) -> Duration {
    let battery = input.battery_pct.unwrap_or(100.0).clamp(0.0, 100.0);

    let mut ms = if input.is_charging {
        MIN_INTERVAL.as_millis() as f64
    } else if battery <= 15.0 {
        MAX_INTERVAL.as_millis() as f64
    } else if battery <= 25.0 {
        MAX_INTERVAL.as_millis() as f64 * 0.75
    } else {
        MIN_INTERVAL.as_millis() as f64 * 2.0
    };

    let moving = input.speed_mps.is_some_and(|s| s > MOVING_SPEED_MPS);
    if moving {
        ms *= 0.5;
    } else {
        ms *= 1.0 + 0.5 * consecutive_stationary.min(STATIONARY_CAP) as f64;
    }

    if input.in_geofence {
        // Denser sampling near the fence edge.
        ms *= 0.75;
    }

    if battery <= 75.0 {
        ms *= 1.0 + (75.0 - battery) / 75.0;
    }

    if let Some(company) = company {
        if let Some(min) = company.min_update_interval_ms {
            ms = ms.max(min as f64);
        }
        if let Some(max) = company.max_update_interval_ms {
            ms = ms.min(max as f64);
        }
    }

    let ms = ms.clamp(MIN_INTERVAL.as_millis() as f64, MAX_INTERVAL.as_millis() as f64);
    Duration::from_millis(ms as u64)
}

pub struct BatteryPolicy {
    cache: Arc<CacheLayer>,
}

impl BatteryPolicy {
    pub fn new(cache: Arc<CacheLayer>) -> Arc<Self> {
        Arc::new(Self { cache })
    }

    fn key(user_id: i64) -> String {
        format!("battery:stationary:{user_id}")
    }

    /// Update the user's stationary streak from this fix and derive the
    /// next sampling interval.
    pub async fn next_interval(
        &self,
        user_id: i64,
        input: PolicyInput,
        company: Option<&CompanyRecord>,
    ) -> Duration {
        let key = Self::key(user_id);
        let moving = input.speed_mps.is_some_and(|s| s > MOVING_SPEED_MPS);
        let streak = if moving {
            self.cache.del(&key).await;
            0
        } else {
            let next = self
                .cache
                .get(&key)
                .await
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
                .saturating_add(1);
            self.cache
                .set(&key, &next.to_string(), Some(COUNTER_TTL))
                .await;
            next
        };
        compute_interval(input, streak, company)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::models::CompanyStatus;

    fn input(battery: f64) -> PolicyInput {
        PolicyInput {
            battery_pct: Some(battery),
            ..Default::default()
        }
    }

    fn company(min_ms: Option<i64>, max_ms: Option<i64>) -> CompanyRecord {
        CompanyRecord {
            id: 1,
            name: "acme".into(),
            status: CompanyStatus::Active,
            min_location_accuracy: None,
            min_update_interval_ms: min_ms,
            max_update_interval_ms: max_ms,
            attendance_bridge_enabled: false,
        }
    }

    #[test]
    fn test_charging_hits_the_floor_when_moving() {
        let i = PolicyInput {
            battery_pct: Some(100.0),
            is_charging: true,
            speed_mps: Some(5.0),
            in_geofence: false,
        };
        assert_eq!(compute_interval(i, 0, None), MIN_INTERVAL);
    }

    #[test]
    fn test_critical_battery_hits_the_ceiling() {
        let mut i = input(10.0);
        i.speed_mps = Some(0.0);
        assert_eq!(compute_interval(i, 5, None), MAX_INTERVAL);
    }

    #[test]
    fn test_movement_halves_the_base() {
        let mut moving = input(100.0);
        moving.speed_mps = Some(3.0);
        let mut still = input(100.0);
        still.speed_mps = Some(0.0);
        let fast = compute_interval(moving, 0, None);
        let slow = compute_interval(still, 0, None);
        assert!(fast < slow, "{fast:?} !< {slow:?}");
        assert_eq!(fast, MIN_INTERVAL); // 20 s base halved, clamped up to 10 s
    }

    #[test]
    fn test_stationary_streak_backs_off_and_caps() {
        let mut i = input(100.0);
        i.speed_mps = Some(0.0);
        let s1 = compute_interval(i, 1, None);
        let s3 = compute_interval(i, 3, None);
        let s5 = compute_interval(i, 5, None);
        let s9 = compute_interval(i, 9, None);
        assert!(s1 < s3 && s3 < s5);
        assert_eq!(s5, s9, "backoff must cap at {STATIONARY_CAP} fixes");
    }

    #[test]
    fn test_in_geofence_samples_faster() {
        let mut out = input(100.0);
        out.speed_mps = Some(2.0);
        let mut inside = out;
        inside.in_geofence = true;
        assert!(compute_interval(inside, 0, None) <= compute_interval(out, 0, None));
    }

    #[test]
    fn test_battery_dial_stretches_interval() {
        let healthy = compute_interval(input(90.0), 0, None);
        let draining = compute_interval(input(40.0), 0, None);
        assert!(draining > healthy);
    }

    #[test]
    fn test_global_bounds_always_hold() {
        // Sweep a grid of inputs; every result stays inside the envelope.
        for battery in [0.0, 5.0, 15.0, 25.0, 50.0, 75.0, 100.0] {
            for charging in [false, true] {
                for speed in [None, Some(0.0), Some(1.0), Some(30.0)] {
                    for fence in [false, true] {
                        for streak in [0u32, 2, 5, 50] {
                            let i = PolicyInput {
                                battery_pct: Some(battery),
                                is_charging: charging,
                                speed_mps: speed,
                                in_geofence: fence,
                            };
                            let d = compute_interval(i, streak, None);
                            assert!(
                                (MIN_INTERVAL..=MAX_INTERVAL).contains(&d),
                                "out of bounds: {d:?} for battery={battery} charging={charging} speed={speed:?} fence={fence} streak={streak}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_company_bounds_respected() {
        let c = company(Some(30_000), Some(120_000));
        let mut i = input(100.0);
        i.speed_mps = Some(5.0); // would otherwise push toward the floor
        let d = compute_interval(i, 0, Some(&c));
        assert!(d >= Duration::from_secs(30), "{d:?}");

        let mut idle = input(20.0);
        idle.speed_mps = Some(0.0); // would otherwise push toward the ceiling
        let d = compute_interval(idle, 5, Some(&c));
        assert!(d <= Duration::from_secs(120), "{d:?}");
    }

    #[tokio::test]
    async fn test_policy_tracks_stationary_streak_in_cache() {
        let policy = BatteryPolicy::new(CacheLayer::local_only(Metrics::new()));
        let mut i = input(100.0);
        i.speed_mps = Some(0.0);
        let first = policy.next_interval(42, i, None).await;
        let second = policy.next_interval(42, i, None).await;
        let third = policy.next_interval(42, i, None).await;
        assert!(first <= second && second <= third);

        // Movement resets the streak.
        i.speed_mps = Some(4.0);
        policy.next_interval(42, i, None).await;
        i.speed_mps = Some(0.0);
        let after_reset = policy.next_interval(42, i, None).await;
        assert_eq!(after_reset, first);
    }
}
