//! Shift auto-end timer endpoints.

use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTimerBody {
    pub duration_hours: f64,
}

pub async fn set_timer(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<SetTimerBody>,
) -> Result<Json<Value>, AppError> {
    let timer = state.shift_engine.set_timer(&user, body.duration_hours).await?;
    Ok(Json(json!({ "timer": timer })))
}

pub async fn cancel_timer(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Value>, AppError> {
    state.shift_engine.cancel_timer(user.id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn get_timer(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Value>, AppError> {
    let (timer, shift) = state.shift_engine.get_timer(user.id).await?;
    Ok(Json(json!({ "timer": timer, "shift": shift })))
}
