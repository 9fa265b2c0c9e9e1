//! Shift lifecycle: explicit start/end, auto-end timers, and the sweep
//! that closes overdue shifts.
//!
//! Route metrics use travel points only: vertices inside any company
//! geofence are excluded before summing segment distances, so hours idling
//! at the office never inflate the day's kilometres. The same definition
//! serves explicit end and the auto-end sweep.

use crate::analytics::AnalyticsAggregator;
use crate::attendance::AttendanceBridge;
use crate::error::{AppError, ErrorLogger};
use crate::metrics::Metrics;
use crate::models::{
    GeofenceRecord, Notification, Role, ShiftBucket, ShiftRecord, ShiftTimerRecord, TrackPoint,
    UserRecord,
};
use crate::notify::NotificationDispatcher;
use crate::store::geofences::Containment;
use crate::store::shifts::is_unique_violation;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// Reminder window before a timer fires.
pub const REMINDER_MINUTES: i64 = 5;

/// Distance and travel time over the polyline, counting only segments
/// whose endpoints both lie outside every fence.
pub fn travel_metrics(points: &[TrackPoint], fences: &[GeofenceRecord]) -> (f64, f64) {
    let travel_points: Vec<&TrackPoint> = points
        .iter()
        .filter(|p| !fences.iter().any(|f| f.contains(p.lat, p.lon)))
        .collect();

    let mut distance_km = 0.0;
    let mut travel_minutes = 0.0;
    for pair in travel_points.windows(2) {
        distance_km += crate::geo::distance_m(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon) / 1000.0;
        let dt = pair[1].ts - pair[0].ts;
        if dt > chrono::Duration::zero() {
            travel_minutes += dt.num_milliseconds() as f64 / 60_000.0;
        }
    }
    (distance_km, travel_minutes)
}

/// Whole minutes until `end`, rounded up; what the reminder shows.
pub fn minutes_remaining(now: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let secs = (end - now).num_seconds().max(0);
    (secs + 59) / 60
}

pub struct SweepReport {
    pub processed: usize,
    pub ended: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ShiftEngine {
    store: Store,
    analytics: Arc<AnalyticsAggregator>,
    notifier: Arc<NotificationDispatcher>,
    attendance: Arc<AttendanceBridge>,
    error_log: Arc<ErrorLogger>,
    metrics: Arc<Metrics>,
    attendance_enabled_globally: bool,
}

impl ShiftEngine {
    pub fn new(
        store: Store,
        analytics: Arc<AnalyticsAggregator>,
        notifier: Arc<NotificationDispatcher>,
        attendance: Arc<AttendanceBridge>,
        error_log: Arc<ErrorLogger>,
        metrics: Arc<Metrics>,
        attendance_enabled_globally: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            analytics,
            notifier,
            attendance,
            error_log,
            metrics,
            attendance_enabled_globally,
        })
    }

    fn bucket_for(user: &UserRecord) -> Result<ShiftBucket, AppError> {
        user.role
            .shift_bucket()
            .ok_or_else(|| AppError::Authz(format!("role {} does not work shifts", user.role.as_str())))
    }

    /// Open a shift at the given location.
    pub async fn start_shift(
        &self,
        user: &UserRecord,
        lat: f64,
        lon: f64,
        at: DateTime<Utc>,
    ) -> Result<(ShiftRecord, Containment), AppError> {
        let bucket = Self::bucket_for(user)?;

        let fences = self.store.geofences.list_active(user.company_id).await?;
        let containment = crate::store::geofences::probe(&fences, lat, lon);
        if !fences.is_empty() && !containment.inside && !user.can_override_geofence {
            return Err(AppError::Validation(
                "shift must start inside a designated work area".into(),
            ));
        }

        if self.store.shifts.find_active(user.id, bucket).await?.is_some() {
            return Err(AppError::Conflict("a shift is already active".into()));
        }

        let opening = TrackPoint { lat, lon, ts: at };
        let shift = match self.store.shifts.start(user.id, bucket, at, opening).await {
            Ok(s) => s,
            // Concurrent start lost the race at the unique index.
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::Conflict("a shift is already active".into()))
            }
            Err(e) => return Err(e.into()),
        };

        self.analytics.ensure_day(user.id, at.date_naive()).await;
        self.metrics.shifts_started.fetch_add(1, Ordering::Relaxed);
        info!(user_id = user.id, shift_id = shift.id, "shift_started");
        Ok((shift, containment))
    }

    /// Close the active shift, computing route metrics from its polyline.
    pub async fn end_shift(
        &self,
        user: &UserRecord,
        closing: Option<TrackPoint>,
        at: DateTime<Utc>,
    ) -> Result<ShiftRecord, AppError> {
        let bucket = Self::bucket_for(user)?;
        let shift = self
            .store
            .shifts
            .find_active(user.id, bucket)
            .await?
            .ok_or_else(|| AppError::Conflict("no active shift".into()))?;

        let mut points = shift.location_history.0.clone();
        if let Some(p) = closing {
            points.push(p);
            self.store.shifts.append_point(shift.id, bucket, p).await?;
        }

        let fences = self.store.geofences.list_active(user.company_id).await?;
        let (distance_km, travel_minutes) = travel_metrics(&points, &fences);
        let end_point = points.last().copied();

        let ended = self
            .store
            .shifts
            .end(
                shift.id,
                bucket,
                at,
                end_point.map(|p| p.lat),
                end_point.map(|p| p.lon),
                distance_km,
                travel_minutes,
                false,
            )
            .await?
            .ok_or_else(|| AppError::Conflict("no active shift".into()))?;

        self.store.timers.complete_for_shift(shift.id).await?;
        self.finalize_day_if_idle(user.id, bucket, shift.start_time).await;
        self.metrics.shifts_ended.fetch_add(1, Ordering::Relaxed);
        info!(
            user_id = user.id,
            shift_id = shift.id,
            distance_km,
            travel_minutes,
            "shift_ended"
        );
        Ok(ended)
    }

    /// Reconcile the daily rollup once the user has no shift running.
    async fn finalize_day_if_idle(&self, user_id: i64, bucket: ShiftBucket, started: DateTime<Utc>) {
        match self.store.shifts.find_active(user_id, bucket).await {
            Ok(None) => {
                let date = started.date_naive();
                match self.store.shifts.closed_distance_for_date(user_id, bucket, date).await {
                    Ok((km, minutes)) => {
                        self.analytics.finalize_day(user_id, date, km, minutes).await
                    }
                    Err(e) => warn!(user_id, error = %e, "daily_reconcile_failed"),
                }
            }
            Ok(Some(_)) => {}
            Err(e) => warn!(user_id, error = %e, "active_shift_check_failed"),
        }
    }

    // -----------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------

    /// Arm (or re-arm) the auto-end timer against the active shift.
    pub async fn set_timer(
        &self,
        user: &UserRecord,
        duration_hours: f64,
    ) -> Result<ShiftTimerRecord, AppError> {
        if !(duration_hours > 0.0 && duration_hours <= 24.0) {
            return Err(AppError::Validation("duration must be in (0, 24] hours".into()));
        }
        let bucket = Self::bucket_for(user)?;
        let shift = self
            .store
            .shifts
            .find_active(user.id, bucket)
            .await?
            .ok_or_else(|| AppError::Conflict("no active shift to time".into()))?;

        let end_time = shift.start_time
            + chrono::Duration::milliseconds((duration_hours * 3_600_000.0) as i64);
        let timer = self
            .store
            .timers
            .replace(user.id, shift.id, duration_hours, end_time, user.role, bucket.as_str())
            .await?;
        info!(user_id = user.id, shift_id = shift.id, %end_time, "shift_timer_set");
        Ok(timer)
    }

    pub async fn cancel_timer(&self, user_id: i64) -> Result<(), AppError> {
        if self.store.timers.cancel(user_id).await? {
            info!(user_id, "shift_timer_cancelled");
            Ok(())
        } else {
            Err(AppError::NotFound("no running timer".into()))
        }
    }

    /// The running timer joined with its shift.
    pub async fn get_timer(
        &self,
        user_id: i64,
    ) -> Result<(ShiftTimerRecord, Option<ShiftRecord>), AppError> {
        let timer = self
            .store
            .timers
            .find_running(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("no running timer".into()))?;
        let shift = match ShiftBucket::from_str_loose(&timer.shift_bucket) {
            Some(bucket) => self.store.shifts.find_by_id(timer.shift_id, bucket).await?,
            None => None,
        };
        Ok((timer, shift))
    }

    // -----------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------

    /// Close every shift whose timer has expired. Each timer runs in its
    /// own transaction; one failure never stops the sweep.
    pub async fn auto_end_sweep(&self) -> SweepReport {
        let now = Utc::now();
        let due = match self.store.timers.find_due(now).await {
            Ok(t) => t,
            Err(e) => {
                self.error_log
                    .log("shift-engine", "sweep-query", &e.to_string(), None, serde_json::json!({}))
                    .await;
                return SweepReport { processed: 0, ended: 0, skipped: 0, failed: 0 };
            }
        };

        let mut report = SweepReport { processed: due.len(), ended: 0, skipped: 0, failed: 0 };
        for timer in due {
            match self.process_due_timer(&timer).await {
                Ok(true) => report.ended += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    self.error_log
                        .log(
                            "shift-engine",
                            "auto-end",
                            &e.to_string(),
                            Some(timer.user_id),
                            serde_json::json!({ "timerId": timer.id, "shiftId": timer.shift_id }),
                        )
                        .await;
                }
            }
        }
        self.metrics.sweeps_run.fetch_add(1, Ordering::Relaxed);
        if report.processed > 0 {
            info!(
                processed = report.processed,
                ended = report.ended,
                skipped = report.skipped,
                failed = report.failed,
                "auto_end_sweep"
            );
        }
        report
    }

    /// Returns Ok(true) when the shift was ended, Ok(false) when the
    /// timer was stale (shift already closed).
    async fn process_due_timer(&self, timer: &ShiftTimerRecord) -> Result<bool, AppError> {
        let bucket = ShiftBucket::from_str_loose(&timer.shift_bucket)
            .ok_or_else(|| AppError::Fatal(format!("unknown shift bucket {}", timer.shift_bucket)))?;

        let user = self.store.users.find_by_id(timer.user_id).await?;
        let fences = match &user {
            Some(u) => self.store.geofences.list_active(u.company_id).await?,
            None => Vec::new(),
        };

        let mut tx = self.store.pool.begin().await?;
        let shift = self
            .store
            .shifts
            .find_by_id_for_update(&mut tx, timer.shift_id, bucket)
            .await?;

        let shift = match shift {
            Some(s) if s.end_time.is_none() => s,
            // Already closed (explicit end raced the sweep, or an admin
            // intervened): just retire the timer.
            _ => {
                self.store.timers.mark_completed_tx(&mut tx, timer.id).await?;
                tx.commit().await?;
                return Ok(false);
            }
        };

        // Employee shifts get full route metrics; supervisory buckets end
        // with bare end fields.
        let (distance_km, travel_minutes) = if bucket == ShiftBucket::Employee {
            travel_metrics(&shift.location_history.0, &fences)
        } else {
            (0.0, 0.0)
        };
        let end_point = shift.location_history.0.last().copied();

        // The shift ends when the timer said it would, not when the sweep
        // got around to it.
        self.store
            .shifts
            .end_tx(
                &mut tx,
                shift.id,
                bucket,
                timer.end_time,
                end_point.map(|p| p.lat),
                end_point.map(|p| p.lon),
                distance_km,
                travel_minutes,
            )
            .await?;
        self.store.timers.mark_completed_tx(&mut tx, timer.id).await?;
        tx.commit().await?;

        self.metrics.shifts_auto_ended.fetch_add(1, Ordering::Relaxed);
        info!(user_id = timer.user_id, shift_id = shift.id, "shift_auto_ended");

        if bucket == ShiftBucket::Employee {
            self.finalize_day_if_idle(timer.user_id, bucket, shift.start_time).await;
        }

        // Everything past the commit is best effort.
        let attendance_warning = match &user {
            Some(u) => self.punch_attendance(u).await,
            None => None,
        };
        self.notify_auto_end(&user, timer, attendance_warning).await;
        Ok(true)
    }

    /// Punch the attendance bridge when the tenant opted in. A failed
    /// punch only decorates the notification; the shift stays ended.
    async fn punch_attendance(&self, user: &UserRecord) -> Option<String> {
        if !self.attendance_enabled_globally {
            return None;
        }
        let company = match self.store.users.find_company(user.company_id).await {
            Ok(Some(c)) if c.attendance_bridge_enabled => c,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "attendance_company_lookup_failed");
                return None;
            }
        };
        let Some(code) = user.employee_number.clone() else {
            return Some("attendance skipped: no employee code on record".into());
        };

        self.metrics.attendance_punches.fetch_add(1, Ordering::Relaxed);
        let outcome = self.attendance.punch(&[code]).await;
        if outcome.success {
            None
        } else {
            self.metrics.attendance_failures.fetch_add(1, Ordering::Relaxed);
            let detail = outcome
                .sparrow_errors
                .as_ref()
                .and_then(|e| e.first().cloned())
                .unwrap_or_else(|| "unknown error".into());
            self.error_log
                .log(
                    "attendance-bridge",
                    &format!("{:?}", outcome.error_type),
                    &detail,
                    Some(user.id),
                    serde_json::json!({ "companyId": company.id, "statusCode": outcome.status_code }),
                )
                .await;
            Some(format!("attendance punch failed: {detail}"))
        }
    }

    async fn notify_auto_end(
        &self,
        user: &Option<UserRecord>,
        timer: &ShiftTimerRecord,
        attendance_warning: Option<String>,
    ) {
        let Some(user) = user else { return };

        let mut message = format!(
            "Your shift was ended automatically after {:.1} hours.",
            timer.duration_hours
        );
        if let Some(warning) = &attendance_warning {
            message.push(' ');
            message.push_str(warning);
        }
        let notification = Notification {
            id: None,
            title: "Shift Automatically Ended".into(),
            message,
            kind: "shift-auto-end".into(),
            priority: "high".into(),
            data: serde_json::json!({
                "shiftId": timer.shift_id,
                "endTime": timer.end_time,
                "attendanceWarning": attendance_warning,
            }),
        };
        self.notifier.send_to_user(user.id, &notification).await;

        let supervisor_note = Notification {
            id: None,
            title: "Team Shift Auto-Ended".into(),
            message: format!("{}'s shift was ended automatically.", user.name),
            kind: "shift-auto-end-supervisor".into(),
            priority: "default".into(),
            data: serde_json::json!({ "employeeId": user.id, "shiftId": timer.shift_id }),
        };
        match (user.role, user.group_admin_id) {
            (Role::Employee, Some(gid)) => {
                self.notifier.send_to_user(gid, &supervisor_note).await;
            }
            (Role::Employee, None) => {
                self.notifier
                    .send_role_notification(user.id, user.company_id, Role::GroupAdmin, &supervisor_note, true)
                    .await;
            }
            (Role::GroupAdmin, _) => {
                self.notifier
                    .send_role_notification(user.id, user.company_id, Role::Management, &supervisor_note, true)
                    .await;
            }
            _ => {}
        }
    }

    /// Warn users whose timer is about to fire.
    pub async fn send_timer_reminders(&self, reminder_minutes: i64) -> usize {
        let now = Utc::now();
        let due = match self
            .store
            .timers
            .find_reminder_due(now, chrono::Duration::minutes(reminder_minutes))
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.error_log
                    .log("shift-engine", "reminder-query", &e.to_string(), None, serde_json::json!({}))
                    .await;
                return 0;
            }
        };

        let mut sent = 0;
        for timer in due {
            let remaining = minutes_remaining(now, timer.end_time);
            let notification = Notification {
                id: None,
                title: "Shift Ending Soon".into(),
                message: format!("Your shift will end automatically in {remaining} minutes."),
                kind: "shift-reminder".into(),
                priority: "high".into(),
                data: serde_json::json!({ "minutesRemaining": remaining, "shiftId": timer.shift_id }),
            };
            self.notifier.send_to_user(timer.user_id, &notification).await;
            if let Err(e) = self.store.timers.mark_notification_sent(timer.id).await {
                self.error_log
                    .log(
                        "shift-engine",
                        "reminder-mark",
                        &e.to_string(),
                        Some(timer.user_id),
                        serde_json::json!({ "timerId": timer.id }),
                    )
                    .await;
                continue;
            }
            self.metrics.timer_reminders_sent.fetch_add(1, Ordering::Relaxed);
            sent += 1;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::types::Json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn point(lat: f64, lon: f64, secs: i64) -> TrackPoint {
        TrackPoint { lat, lon, ts: t0() + chrono::Duration::seconds(secs) }
    }

    fn office_fence() -> GeofenceRecord {
        GeofenceRecord {
            id: 1,
            company_id: 1,
            name: "office".into(),
            shape: crate::models::FenceShape::Circle,
            center_latitude: Some(12.9700),
            center_longitude: Some(77.5900),
            radius_meters: 150.0,
            polygon: Json(vec![]),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_travel_metrics_simple_eastward_walk() {
        // 1 km east over 30 minutes, sampled every 30 s: 61 points, no
        // fences.
        let deg_per_km_lon = 1.0 / (111.195 * (12.97f64.to_radians().cos()));
        let points: Vec<TrackPoint> = (0..=60)
            .map(|i| point(12.97, 77.59 + deg_per_km_lon * (i as f64 / 60.0), i * 30))
            .collect();
        let (km, minutes) = travel_metrics(&points, &[]);
        assert!((km - 1.0).abs() < 0.05, "distance {km}");
        assert!((minutes - 30.0).abs() < 1e-6, "minutes {minutes}");
    }

    #[test]
    fn test_travel_metrics_excludes_in_fence_idling() {
        // Walk 500 m away from the office, then idle inside the fence.
        let outside: Vec<TrackPoint> = (0..10)
            .map(|i| point(12.98 + 0.0005 * i as f64, 77.60, i * 60))
            .collect();
        let mut with_idle = outside.clone();
        for i in 0..20 {
            // Jitter within the office fence.
            with_idle.push(point(12.9700 + 0.0001 * (i % 2) as f64, 77.5900, 600 + i * 60));
        }
        let fences = [office_fence()];
        let (km_clean, _) = travel_metrics(&outside, &fences);
        let (km_idle, _) = travel_metrics(&with_idle, &fences);
        assert!((km_clean - km_idle).abs() < 1e-9, "idling in the fence must add nothing");
    }

    #[test]
    fn test_travel_metrics_empty_and_single_point() {
        assert_eq!(travel_metrics(&[], &[]), (0.0, 0.0));
        assert_eq!(travel_metrics(&[point(12.97, 77.59, 0)], &[]), (0.0, 0.0));
    }

    #[test]
    fn test_travel_metrics_all_points_in_fence() {
        let fences = [office_fence()];
        let points: Vec<TrackPoint> = (0..10).map(|i| point(12.9700, 77.5900, i * 30)).collect();
        assert_eq!(travel_metrics(&points, &fences), (0.0, 0.0));
    }

    #[test]
    fn test_minutes_remaining_rounds_up() {
        let end = t0() + chrono::Duration::minutes(5);
        assert_eq!(minutes_remaining(t0(), end), 5);
        assert_eq!(minutes_remaining(t0() + chrono::Duration::seconds(30), end), 5);
        assert_eq!(minutes_remaining(t0() + chrono::Duration::seconds(90), end), 4);
        // Past the deadline clamps to zero.
        assert_eq!(minutes_remaining(end + chrono::Duration::seconds(10), end), 0);
    }
}
