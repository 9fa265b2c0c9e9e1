//! Acceptance gates for incoming location samples.
//!
//! Gates run in a fixed order and fail fast with a reason code. Background
//! samples get one concession: the accuracy gate downgrades to a warning,
//! since platform-initiated fixes are routinely coarse (cell towers,
//! significant-change wakeups) and still worth keeping.

use crate::error::AppError;
use crate::geo;
use crate::models::{CompanyRecord, LocationUpdate};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Foreground accuracy ceiling, metres.
pub const MAX_ACCURACY_FOREGROUND_M: f64 = 500.0;
/// Background accuracy ceiling, metres.
pub const MAX_ACCURACY_BACKGROUND_M: f64 = 15_000.0;
/// Samples below this battery level are refused to stop dying phones
/// from burning their last percent on GPS.
pub const MIN_BATTERY_PCT: f64 = 5.0;
/// Reconstructed-speed ceiling.
pub const MAX_SPEED_KMH: f64 = 120.0;

/// The previous stored sample, as far as the speed gate cares.
#[derive(Debug, Clone, Copy)]
pub struct PriorFix {
    pub latitude: f64,
    pub longitude: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    AcceptedWithWarning(String),
}

/// Run every gate over `update`.
///
/// Foreground failures come back as `AppError::LocationRejected` with the
/// gate's reason code; the caller maps background failures to
/// log-and-discard instead of surfacing them.
pub fn validate(
    update: &LocationUpdate,
    effective_at: DateTime<Utc>,
    prior: Option<PriorFix>,
    company: Option<&CompanyRecord>,
    is_background: bool,
) -> Result<ValidationOutcome, AppError> {
    // 1. Coordinate sanity.
    if !update.latitude.is_finite() || !update.longitude.is_finite() {
        return Err(rejected("coordinates are not finite", "OUT_OF_RANGE"));
    }
    if !(-90.0..=90.0).contains(&update.latitude) || !(-180.0..=180.0).contains(&update.longitude) {
        return Err(rejected(
            &format!("({}, {}) outside Earth ranges", update.latitude, update.longitude),
            "OUT_OF_RANGE",
        ));
    }

    let mut warning = None;

    // 2. Accuracy ceiling.
    if let Some(acc) = update.accuracy {
        if !acc.is_finite() || acc < 0.0 {
            return Err(rejected("accuracy is not a valid distance", "ACCURACY_LIMIT"));
        }
        let ceiling = if is_background {
            MAX_ACCURACY_BACKGROUND_M
        } else {
            MAX_ACCURACY_FOREGROUND_M
        };
        if acc > ceiling {
            let msg = format!("accuracy {acc:.0} m exceeds {ceiling:.0} m ceiling");
            if is_background {
                warn!(accuracy_m = acc, "background_sample_low_accuracy");
                warning = Some(msg);
            } else {
                return Err(rejected(&msg, "ACCURACY_LIMIT"));
            }
        }
    }

    // 3. Battery floor, only when the client reports a level.
    if let Some(battery) = update.battery_level {
        if battery < MIN_BATTERY_PCT {
            return Err(rejected(
                &format!("battery {battery:.0}% below {MIN_BATTERY_PCT:.0}% floor"),
                "LOW_BATTERY",
            ));
        }
    }

    // 4. Reconstructed speed against the previous stored sample.
    if let Some(prior) = prior {
        let dt_secs = (effective_at - prior.recorded_at).num_milliseconds() as f64 / 1000.0;
        if dt_secs > 0.0 {
            let meters = geo::distance_m(
                prior.latitude,
                prior.longitude,
                update.latitude,
                update.longitude,
            );
            let kmh = meters / dt_secs * 3.6;
            if kmh > MAX_SPEED_KMH {
                return Err(rejected(
                    &format!("reconstructed speed {kmh:.0} km/h exceeds {MAX_SPEED_KMH:.0} km/h"),
                    "SPEED_LIMIT",
                ));
            }
        }
    }

    // 5. Company accuracy policy, when configured.
    if let (Some(company), Some(acc)) = (company, update.accuracy) {
        if let Some(min_accuracy) = company.min_location_accuracy {
            if acc > min_accuracy {
                return Err(rejected(
                    &format!("accuracy {acc:.0} m exceeds company policy {min_accuracy:.0} m"),
                    "COMPANY_ACCURACY_POLICY",
                ));
            }
        }
    }

    Ok(match warning {
        Some(msg) => ValidationOutcome::AcceptedWithWarning(msg),
        None => ValidationOutcome::Accepted,
    })
}

fn rejected(reason: &str, code: &'static str) -> AppError {
    AppError::LocationRejected { reason: reason.to_string(), code }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn update(lat: f64, lon: f64) -> LocationUpdate {
        LocationUpdate {
            latitude: lat,
            longitude: lon,
            accuracy: None,
            timestamp: None,
            battery_level: None,
            is_moving: None,
            altitude: None,
            speed: None,
            shift_id: None,
            is_background: None,
            is_charging: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn code(err: AppError) -> &'static str {
        match err {
            AppError::LocationRejected { code, .. } => code,
            other => panic!("expected rejection, got {other}"),
        }
    }

    #[test]
    fn test_plain_sample_accepted() {
        let out = validate(&update(12.97, 77.59), now(), None, None, false).unwrap();
        assert_eq!(out, ValidationOutcome::Accepted);
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        let e = validate(&update(91.0, 77.59), now(), None, None, false).unwrap_err();
        assert_eq!(code(e), "OUT_OF_RANGE");
        let e = validate(&update(12.97, -181.0), now(), None, None, false).unwrap_err();
        assert_eq!(code(e), "OUT_OF_RANGE");
        let e = validate(&update(f64::NAN, 0.0), now(), None, None, false).unwrap_err();
        assert_eq!(code(e), "OUT_OF_RANGE");
    }

    #[test]
    fn test_foreground_accuracy_ceiling() {
        let mut u = update(12.97, 77.59);
        u.accuracy = Some(750.0);
        let e = validate(&u, now(), None, None, false).unwrap_err();
        assert_eq!(code(e), "ACCURACY_LIMIT");
    }

    #[test]
    fn test_background_relaxed_ceiling_and_warn_accept() {
        let mut u = update(12.97, 77.59);
        // 750 m fails the foreground gate but is fine in background.
        u.accuracy = Some(750.0);
        assert_eq!(
            validate(&u, now(), None, None, true).unwrap(),
            ValidationOutcome::Accepted
        );
        // Beyond even the background ceiling warns instead of rejecting.
        u.accuracy = Some(20_000.0);
        match validate(&u, now(), None, None, true).unwrap() {
            ValidationOutcome::AcceptedWithWarning(msg) => assert!(msg.contains("accuracy")),
            other => panic!("expected warning, got {other:?}"),
        }
    }

    #[test]
    fn test_battery_floor() {
        let mut u = update(12.97, 77.59);
        u.battery_level = Some(3.0);
        let e = validate(&u, now(), None, None, false).unwrap_err();
        assert_eq!(code(e), "LOW_BATTERY");

        u.battery_level = Some(5.0);
        assert!(validate(&u, now(), None, None, false).is_ok());

        // Unreported battery passes the gate entirely.
        u.battery_level = None;
        assert!(validate(&u, now(), None, None, false).is_ok());
    }

    #[test]
    fn test_speed_gate_rejects_teleport() {
        // ~11 km in 30 s ≈ 1300 km/h.
        let prior = PriorFix {
            latitude: 12.97,
            longitude: 77.59,
            recorded_at: now(),
        };
        let at = now() + chrono::Duration::seconds(30);
        let e = validate(&update(13.07, 77.59), at, Some(prior), None, false).unwrap_err();
        assert_eq!(code(e), "SPEED_LIMIT");
    }

    #[test]
    fn test_speed_gate_passes_highway_speed() {
        // ~0.9 km in 30 s ≈ 108 km/h.
        let prior = PriorFix {
            latitude: 12.97,
            longitude: 77.59,
            recorded_at: now(),
        };
        let at = now() + chrono::Duration::seconds(30);
        assert!(validate(&update(12.9781, 77.59), at, Some(prior), None, false).is_ok());
    }

    #[test]
    fn test_speed_gate_skips_without_prior_or_time_delta() {
        let far = update(52.5, 13.4);
        assert!(validate(&far, now(), None, None, false).is_ok());

        let prior = PriorFix {
            latitude: 12.97,
            longitude: 77.59,
            recorded_at: now(),
        };
        // Same timestamp: no delta, gate passes.
        assert!(validate(&far, now(), Some(prior), None, false).is_ok());
    }

    #[test]
    fn test_company_policy_tightens_accuracy() {
        let company = CompanyRecord {
            id: 1,
            name: "acme".into(),
            status: crate::models::CompanyStatus::Active,
            min_location_accuracy: Some(50.0),
            min_update_interval_ms: None,
            max_update_interval_ms: None,
            attendance_bridge_enabled: false,
        };
        let mut u = update(12.97, 77.59);
        u.accuracy = Some(120.0);
        let e = validate(&u, now(), None, Some(&company), false).unwrap_err();
        assert_eq!(code(e), "COMPANY_ACCURACY_POLICY");

        u.accuracy = Some(30.0);
        assert!(validate(&u, now(), None, Some(&company), false).is_ok());
    }
}
