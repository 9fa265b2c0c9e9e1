//! REST and socket surface.

pub mod admin;
pub mod timer;
pub mod tracking;
pub mod ws;

use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Browser dashboards live on the configured frontend origin; mobile
/// clients send no Origin at all.
fn cors_for(frontend_url: &str) -> CorsLayer {
    match frontend_url.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => CorsLayer::permissive(),
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_for(&state.config.frontend_url);
    Router::new()
        .route("/employee-tracking/location", post(tracking::post_location))
        .route("/employee-tracking/location/background", post(tracking::post_location_background))
        .route("/employee-tracking/start-shift", post(tracking::start_shift))
        .route("/employee-tracking/end-shift", post(tracking::end_shift))
        .route("/employee-tracking/current-shift", get(tracking::current_shift))
        .route("/employee-tracking/shift-history", get(tracking::shift_history))
        .route("/employee-tracking/analytics", get(tracking::analytics))
        .route("/shift/timer", post(timer::set_timer).delete(timer::cancel_timer).get(timer::get_timer))
        .route("/group-admin-tracking/active-locations", get(admin::active_locations))
        .route("/group-admin-tracking/employee-history", get(admin::employee_history))
        .route("/group-admin-tracking/geofences", post(admin::create_geofence).get(admin::list_geofences))
        .route(
            "/group-admin-tracking/geofences/:id",
            patch(admin::update_geofence).delete(admin::delete_geofence),
        )
        .route("/ws", get(ws::upgrade))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Ready when the database answers; cache degradation alone does not
/// fail readiness, fallback mode covers it.
async fn ready(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.store.pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Counters plus live state sizes.
async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "counters": state.metrics.snapshot(),
        "state": {
            "socketConnections": state.broadcaster.connection_count(),
            "cacheLocalEntries": state.cache.local_len(),
            "cacheConnected": state.cache.is_connected(),
            "cacheFallback": state.cache.is_fallback(),
            "smootherFilters": state.ingest.smoother_len(),
        },
    }))
}
