//! The realtime socket: authenticated handshake, inbound event dispatch,
//! outbound fan-out via the broadcaster's per-connection channel.
//!
//! Inbound frames are `{"event": ..., "data": ...}` envelopes. Errors are
//! answered with `location:error` (or the subscription error event) and
//! the connection stays up; only auth failures refuse the upgrade.

use crate::auth::authenticate;
use crate::battery::PolicyInput;
use crate::error::AppError;
use crate::models::{LocationUpdate, Role, UserRecord};
use crate::realtime::Envelope;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
pub struct WsAuth {
    pub token: String,
}

pub async fn upgrade(
    State(state): State<AppState>,
    Query(auth): Query<WsAuth>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let user = authenticate(&state, &auth.token).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, user, socket)))
}

async fn handle_socket(state: AppState, user: UserRecord, socket: WebSocket) {
    let (conn_id, mut outbound) = state.broadcaster.register(&user);
    let (mut sink, mut stream) = socket.split();

    // Writer task: everything the broadcaster (or this handler) emits.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue, // ping/pong/binary
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                state.broadcaster.emit(
                    conn_id,
                    &Envelope::new("location:error", json!({ "message": format!("bad frame: {e}") })),
                );
                continue;
            }
        };
        dispatch(&state, &user, conn_id, envelope).await;
    }

    state.broadcaster.unregister(conn_id);
    state.ingest.release_smoother(user.id);
    writer.abort();
    debug!(user_id = user.id, "socket_closed");
}

async fn dispatch(state: &AppState, user: &UserRecord, conn_id: u64, envelope: Envelope) {
    match envelope.event.as_str() {
        // The legacy client emits the second name; both feed one path.
        "location:update" | "employee:location_update" => {
            handle_location(state, user, conn_id, envelope.data).await;
        }
        "admin:subscribe_employees" => {
            handle_subscribe(state, user, conn_id, envelope.data, true).await;
        }
        "admin:unsubscribe_employees" => {
            handle_subscribe(state, user, conn_id, envelope.data, false).await;
        }
        "location:get_failed" => {
            let failed = state.retry.failed_updates(user.id).await;
            state
                .broadcaster
                .emit(conn_id, &Envelope::new("location:failed_updates", failed));
        }
        "location:get_interval" => {
            handle_interval(state, user, conn_id, envelope.data).await;
        }
        other => {
            state.broadcaster.emit(
                conn_id,
                &Envelope::new("location:error", json!({ "message": format!("unknown event {other}") })),
            );
        }
    }
}

async fn handle_location(state: &AppState, user: &UserRecord, conn_id: u64, data: serde_json::Value) {
    let update: LocationUpdate = match serde_json::from_value(data) {
        Ok(u) => u,
        Err(e) => {
            state.broadcaster.emit(
                conn_id,
                &Envelope::new("location:error", json!({ "message": format!("bad payload: {e}") })),
            );
            return;
        }
    };

    let result = if update.is_background.unwrap_or(false) {
        Ok(state.ingest.ingest_background(user, &update).await)
    } else {
        state.ingest.ingest(user, &update).await
    };

    match result {
        Ok(ack) => {
            state.broadcaster.emit(
                conn_id,
                &Envelope::new(
                    "location:ack",
                    json!({
                        "received": ack.success,
                        "timestamp": ack.timestamp,
                        "batteryOptimizations": { "nextIntervalMs": ack.next_interval_ms },
                    }),
                ),
            );
        }
        Err(e) => {
            state.broadcaster.emit(
                conn_id,
                &Envelope::new("location:error", json!({ "message": e.to_string(), "code": e.error_code() })),
            );
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribePayload {
    #[serde(default)]
    employee_ids: Vec<i64>,
}

async fn handle_subscribe(
    state: &AppState,
    user: &UserRecord,
    conn_id: u64,
    data: serde_json::Value,
    subscribe: bool,
) {
    if user.role == Role::Employee {
        state.broadcaster.emit(
            conn_id,
            &Envelope::new("admin:subscription_error", json!({ "message": "supervisor role required" })),
        );
        return;
    }
    let payload: SubscribePayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(e) => {
            state.broadcaster.emit(
                conn_id,
                &Envelope::new("admin:subscription_error", json!({ "message": format!("bad payload: {e}") })),
            );
            return;
        }
    };

    if !subscribe {
        state.broadcaster.unsubscribe_employees(conn_id, &payload.employee_ids);
        state.broadcaster.emit(
            conn_id,
            &Envelope::new("admin:subscription_success", json!({ "unsubscribed": payload.employee_ids })),
        );
        return;
    }

    let granted = match state.store.users.filter_visible(user, &payload.employee_ids).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "subscription_visibility_check_failed");
            state.broadcaster.emit(
                conn_id,
                &Envelope::new("admin:subscription_error", json!({ "message": "visibility check failed" })),
            );
            return;
        }
    };
    let denied: Vec<i64> = payload
        .employee_ids
        .iter()
        .copied()
        .filter(|id| !granted.contains(id))
        .collect();

    state.broadcaster.subscribe_employees(conn_id, &granted);
    info!(viewer = user.id, granted = granted.len(), denied = denied.len(), "admin_subscription");
    state.broadcaster.emit(
        conn_id,
        &Envelope::new("admin:subscription_success", json!({ "employeeIds": granted })),
    );
    if !denied.is_empty() {
        // Denied ids are dropped, acknowledged once.
        state.broadcaster.emit(
            conn_id,
            &Envelope::new("admin:subscription_error", json!({ "deniedIds": denied })),
        );
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntervalPayload {
    #[serde(default)]
    battery_level: Option<f64>,
    #[serde(default)]
    is_charging: Option<bool>,
}

async fn handle_interval(state: &AppState, user: &UserRecord, conn_id: u64, data: serde_json::Value) {
    let payload: IntervalPayload = serde_json::from_value(data).unwrap_or(IntervalPayload {
        battery_level: None,
        is_charging: None,
    });
    let company = state.store.users.find_company(user.company_id).await.ok().flatten();
    let interval = state
        .battery
        .next_interval(
            user.id,
            PolicyInput {
                battery_pct: payload.battery_level,
                is_charging: payload.is_charging.unwrap_or(false),
                speed_mps: None,
                in_geofence: false,
            },
            company.as_ref(),
        )
        .await;
    state.broadcaster.emit(
        conn_id,
        &Envelope::new("location:update_interval", json!({ "interval": interval.as_millis() as u64 })),
    );
}
