//! Supervisor-facing endpoints: the live roster, per-employee history,
//! and geofence administration.

use crate::auth::AdminUser;
use crate::error::AppError;
use crate::models::Role;
use crate::state::AppState;
use crate::store::geofences::{GeofencePatch, NewGeofence};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

/// Everyone the viewer may observe.
async fn observable_ids(state: &AppState, viewer: &crate::models::UserRecord) -> Result<Vec<i64>, AppError> {
    Ok(match viewer.role {
        Role::GroupAdmin => state
            .store
            .users
            .find_subordinates(viewer.id)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect(),
        Role::Management | Role::SuperAdmin => state
            .store
            .users
            .find_by_role(viewer.company_id, Role::Employee)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect(),
        Role::Employee => Vec::new(),
    })
}

/// Live roster: the cached last location of every observable employee
/// still inside the freshness TTL.
pub async fn active_locations(
    State(state): State<AppState>,
    AdminUser(viewer): AdminUser,
) -> Result<Json<Vec<Value>>, AppError> {
    let ids = observable_ids(&state, &viewer).await?;
    let mut out = Vec::new();
    for id in ids {
        if let Some(live) = state.ingest.last_location(id).await {
            out.push(serde_json::to_value(live).unwrap_or(Value::Null));
        }
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct EmployeeHistoryQuery {
    pub employee_id: i64,
    pub date: Option<NaiveDate>,
}

/// One employee's trajectory and shifts for a day.
pub async fn employee_history(
    State(state): State<AppState>,
    AdminUser(viewer): AdminUser,
    Query(query): Query<EmployeeHistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let visible = state
        .store
        .users
        .filter_visible(&viewer, &[query.employee_id])
        .await?;
    if visible.is_empty() {
        return Err(AppError::Authz("employee is outside your span of control".into()));
    }

    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let employee = state
        .store
        .users
        .find_by_id(query.employee_id)
        .await?
        .ok_or_else(|| AppError::NotFound("employee".into()))?;
    let bucket = super::tracking::bucket_or_employee(employee.role);

    let locations = state.store.locations.for_user_on_date(query.employee_id, date).await?;
    let shifts = state.store.shifts.for_date(query.employee_id, bucket, date).await?;
    Ok(Json(json!({ "locations": locations, "shifts": shifts })))
}

// ---------------------------------------------------------------------------
// Geofence administration
// ---------------------------------------------------------------------------

pub async fn list_geofences(
    State(state): State<AppState>,
    AdminUser(viewer): AdminUser,
) -> Result<Json<Value>, AppError> {
    let fences = state.store.geofences.list_active(viewer.company_id).await?;
    Ok(Json(json!({ "geofences": fences })))
}

pub async fn create_geofence(
    State(state): State<AppState>,
    AdminUser(viewer): AdminUser,
    Json(body): Json<NewGeofence>,
) -> Result<Json<Value>, AppError> {
    // Company existence is implied by the authenticated viewer; suspended
    // companies never get this far.
    let fence = state.store.geofences.create(viewer.company_id, body).await?;
    Ok(Json(json!({ "geofence": fence })))
}

pub async fn update_geofence(
    State(state): State<AppState>,
    AdminUser(viewer): AdminUser,
    Path(id): Path<i64>,
    Json(patch): Json<GeofencePatch>,
) -> Result<Json<Value>, AppError> {
    let fence = state.store.geofences.update(viewer.company_id, id, patch).await?;
    Ok(Json(json!({ "geofence": fence })))
}

pub async fn delete_geofence(
    State(state): State<AppState>,
    AdminUser(viewer): AdminUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    state.store.geofences.delete(viewer.company_id, id).await?;
    Ok(Json(json!({ "success": true })))
}
