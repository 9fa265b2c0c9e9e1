//! Debounced geofence boundary crossings.
//!
//! GPS jitter makes a user standing near a fence edge flap between inside
//! and outside on consecutive fixes. Transitions are confirmed only when
//! readings disagree with the held state for long enough: a 60-second
//! floor between transitions plus a consecutive-reading threshold.
//!
//! State lives in the cache per `(user, fence)` and is deliberately
//! last-writer-wins under concurrency; a spurious double-observation
//! cannot double-fire because of the time floor.

use crate::cache::CacheLayer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Minimum wall-clock time between confirmed transitions.
pub const MIN_TIME_BETWEEN_TRANSITIONS: chrono::Duration = chrono::Duration::seconds(60);
/// Readings past the time floor needed to confirm a flip.
pub const HYSTERESIS_THRESHOLD: u32 = 3;
/// Fence state is recomputable; a day of idle kills it.
const STATE_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FenceState {
    inside: bool,
    last_transition: DateTime<Utc>,
    consecutive_count: u32,
}

pub struct GeofenceHysteresis {
    cache: Arc<CacheLayer>,
}

impl GeofenceHysteresis {
    pub fn new(cache: Arc<CacheLayer>) -> Arc<Self> {
        Arc::new(Self { cache })
    }

    fn key(user_id: i64, geofence_id: i64) -> String {
        format!("geofence:state:{user_id}:{geofence_id}")
    }

    /// Feed one containment reading; returns the confirmed transition, if
    /// this reading caused one.
    pub async fn observe(
        &self,
        user_id: i64,
        geofence_id: i64,
        now_inside: bool,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        let key = Self::key(user_id, geofence_id);
        let prior: Option<FenceState> = self
            .cache
            .get(&key)
            .await
            .and_then(|v| serde_json::from_str(&v).ok());

        let (next, transition) = match prior {
            None => {
                // First sighting: adopt the reading and report it.
                let state = FenceState {
                    inside: now_inside,
                    last_transition: at,
                    consecutive_count: 1,
                };
                (state, Some(side(now_inside)))
            }
            Some(mut state) if now_inside == state.inside => {
                // Reading agrees with the held side.
                if at - state.last_transition > MIN_TIME_BETWEEN_TRANSITIONS {
                    state.consecutive_count = 1;
                } else {
                    state.consecutive_count += 1;
                }
                (state, None)
            }
            Some(mut state) => {
                // Reading disagrees.
                if at - state.last_transition < MIN_TIME_BETWEEN_TRANSITIONS {
                    // Too soon after the last flip: jitter, suppress.
                    state.consecutive_count = 1;
                    (state, None)
                } else {
                    state.consecutive_count += 1;
                    if state.consecutive_count >= HYSTERESIS_THRESHOLD {
                        state.inside = now_inside;
                        state.last_transition = at;
                        state.consecutive_count = 1;
                        (state, Some(side(now_inside)))
                    } else {
                        (state, None)
                    }
                }
            }
        };

        if let Ok(json) = serde_json::to_string(&next) {
            self.cache.set(&key, &json, Some(STATE_TTL)).await;
        }
        if let Some(t) = transition {
            debug!(user_id, geofence_id, ?t, "geofence_transition");
        }
        transition
    }

    /// Forget a user's fence states (shift end, tracking stop).
    pub async fn clear(&self, user_id: i64, geofence_id: i64) {
        self.cache.del(&Self::key(user_id, geofence_id)).await;
    }
}

fn side(inside: bool) -> Transition {
    if inside {
        Transition::Entered
    } else {
        Transition::Exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use chrono::TimeZone;

    fn hysteresis() -> Arc<GeofenceHysteresis> {
        GeofenceHysteresis::new(CacheLayer::local_only(Metrics::new()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_first_reading_reports_its_side() {
        let h = hysteresis();
        assert_eq!(h.observe(1, 10, true, t0()).await, Some(Transition::Entered));
        assert_eq!(h.observe(2, 10, false, t0()).await, Some(Transition::Exited));
    }

    #[tokio::test]
    async fn test_same_side_readings_never_transition() {
        let h = hysteresis();
        h.observe(1, 10, true, t0()).await;
        for i in 1..50 {
            let at = t0() + chrono::Duration::seconds(i * 30);
            assert_eq!(h.observe(1, 10, true, at).await, None);
        }
    }

    #[tokio::test]
    async fn test_boundary_flapping_is_suppressed() {
        let h = hysteresis();
        h.observe(3, 10, false, t0()).await;
        // Alternate sides every 2 s inside the floor window.
        for i in 1..=29 {
            let at = t0() + chrono::Duration::seconds(i * 2);
            let inside = i % 2 == 0;
            assert_eq!(h.observe(3, 10, inside, at).await, None, "flap at {i}");
        }
    }

    #[tokio::test]
    async fn test_sustained_disagreement_confirms_exactly_once() {
        let h = hysteresis();
        h.observe(3, 10, false, t0()).await;
        // Flap inside the floor window first.
        for i in 1..=29 {
            let at = t0() + chrono::Duration::seconds(i * 2);
            h.observe(3, 10, i % 2 == 0, at).await;
        }
        // Then hold inside with samples spaced past the floor.
        let mut transitions = Vec::new();
        for k in 0..3 {
            let at = t0() + chrono::Duration::seconds(121 + k * 61);
            if let Some(t) = h.observe(3, 10, true, at).await {
                transitions.push(t);
            }
        }
        assert_eq!(transitions, vec![Transition::Entered]);
        // Holding inside afterwards stays quiet.
        let later = t0() + chrono::Duration::seconds(600);
        assert_eq!(h.observe(3, 10, true, later).await, None);
    }

    #[tokio::test]
    async fn test_no_more_than_one_transition_per_floor_window() {
        let h = hysteresis();
        h.observe(5, 20, true, t0()).await;
        let mut events = 0;
        // Disagreeing readings every 10 s for 5 minutes.
        for i in 1..=30 {
            let at = t0() + chrono::Duration::seconds(i * 10);
            if h.observe(5, 20, i % 2 == 0, at).await.is_some() {
                events += 1;
            }
        }
        // 5 minutes of oscillation can never confirm more than 5 flips.
        assert!(events <= 5, "got {events} transitions in 5 minutes");
    }

    #[tokio::test]
    async fn test_clear_forgets_state() {
        let h = hysteresis();
        h.observe(7, 30, true, t0()).await;
        h.clear(7, 30).await;
        let at = t0() + chrono::Duration::seconds(5);
        // Fresh state again reports immediately.
        assert_eq!(h.observe(7, 30, false, at).await, Some(Transition::Exited));
    }
}
