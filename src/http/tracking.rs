//! Employee-facing tracking endpoints.

use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::models::{LocationUpdate, Role, ShiftBucket, TrackPoint};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

/// Foreground location ingest. Validation failures are 400s; a storage
/// fault still answers 200 with `success: false` and the retry queue
/// holding the payload.
pub async fn post_location(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<Value>, AppError> {
    let ack = state.ingest.ingest(&user, &update).await?;
    Ok(Json(json!({
        "success": ack.success,
        "locationId": ack.location_id,
        "timestamp": ack.timestamp,
        "errorCode": ack.error_code,
        "warning": ack.warning,
        "geofenceStatus": ack.geofence_status,
        "batteryOptimizations": { "nextIntervalMs": ack.next_interval_ms },
    })))
}

/// Background ingest: unconditionally 200 so platform retry loops die out.
pub async fn post_location_background(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<LocationUpdate>,
) -> Json<Value> {
    let ack = state.ingest.ingest_background(&user, &update).await;
    Json(json!({
        "success": ack.success,
        "locationId": ack.location_id,
        "timestamp": ack.timestamp,
        "errorCode": ack.error_code,
        "warning": ack.warning,
    }))
}

pub async fn start_shift(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<Value>, AppError> {
    let at = update.timestamp.unwrap_or_else(Utc::now);
    let (shift, containment) = state
        .shift_engine
        .start_shift(&user, update.latitude, update.longitude, at)
        .await?;
    // The opening fix also flows through the normal pipeline so the live
    // roster sees the user immediately.
    let _ = state.ingest.ingest(&user, &update).await;
    Ok(Json(json!({
        "id": shift.id,
        "startTimestamp": shift.start_time,
        "geofenceStatus": if containment.inside { "inside" } else { "outside" },
        "geofenceName": containment.name,
    })))
}

pub async fn end_shift(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<Value>, AppError> {
    let at = update.timestamp.unwrap_or_else(Utc::now);
    let closing = TrackPoint { lat: update.latitude, lon: update.longitude, ts: at };
    let shift = state.shift_engine.end_shift(&user, Some(closing), at).await?;
    state.ingest.release_smoother(user.id);
    Ok(Json(json!({
        "id": shift.id,
        "startTimestamp": shift.start_time,
        "endTimestamp": shift.end_time,
        "totalDistance": shift.total_distance_km,
        "travelTimeMinutes": shift.travel_time_minutes,
    })))
}

pub async fn current_shift(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Value>, AppError> {
    let Some(bucket) = user.role.shift_bucket() else {
        return Ok(Json(json!({ "isActive": false })));
    };
    let shift = state.store.shifts.find_active(user.id, bucket).await?;
    let current_location = state.ingest.last_location(user.id).await;
    Ok(Json(match shift {
        Some(shift) => json!({
            "isActive": true,
            "shift": shift,
            "currentLocation": current_location,
        }),
        None => json!({ "isActive": false, "currentLocation": current_location }),
    }))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

pub async fn shift_history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(range): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let bucket = user
        .role
        .shift_bucket()
        .ok_or_else(|| AppError::Authz("role has no shift history".into()))?;
    let (from, to) = date_range(range.start_date, range.end_date)?;
    let shifts = state.store.shifts.history(user.id, bucket, from, to).await?;
    Ok(Json(json!({ "shifts": shifts })))
}

#[derive(Deserialize)]
pub struct AnalyticsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub employee_id: Option<i64>,
}

/// Daily rollups, scoped by the caller's role when asking about someone
/// else.
pub async fn analytics(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<Value>, AppError> {
    let subject = match query.employee_id {
        None => user.id,
        Some(id) if id == user.id => id,
        Some(id) => {
            if user.role == Role::Employee {
                return Err(AppError::Authz("employees may only view their own analytics".into()));
            }
            let visible = state.store.users.filter_visible(&user, &[id]).await?;
            if visible.is_empty() {
                return Err(AppError::Authz("employee is outside your span of control".into()));
            }
            id
        }
    };
    if query.end_date < query.start_date {
        return Err(AppError::Validation("end_date precedes start_date".into()));
    }
    let rows = state
        .store
        .analytics
        .range(subject, query.start_date, query.end_date)
        .await?;
    Ok(Json(json!({ "analytics": rows })))
}

fn date_range(
    start: NaiveDate,
    end: NaiveDate,
) -> Result<(chrono::DateTime<Utc>, chrono::DateTime<Utc>), AppError> {
    if end < start {
        return Err(AppError::Validation("end_date precedes start_date".into()));
    }
    let from = start
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .ok_or_else(|| AppError::Validation("bad start_date".into()))?;
    let to = end
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| AppError::Validation("bad end_date".into()))?;
    Ok((from, to))
}

/// Exposed for the admin module, which reads other users' buckets.
pub fn bucket_or_employee(role: Role) -> ShiftBucket {
    role.shift_bucket().unwrap_or(ShiftBucket::Employee)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range_spans_inclusive_days() {
        let (from, to) = date_range(
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
        )
        .unwrap();
        assert_eq!((to - from).num_days(), 3);
    }

    #[test]
    fn test_date_range_rejects_inverted() {
        assert!(date_range(
            NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        )
        .is_err());
    }
}
