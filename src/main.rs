// =============================================================================
// FIELDTRACK — Workforce Tracking Core (Rust/Axum/Tokio)
// =============================================================================
// The ingest-and-fan-out half of the Fieldtrack platform:
//   - location ingest over REST and the realtime socket
//   - Kalman smoothing, validation gates, geofence hysteresis
//   - shift lifecycle with auto-end timers and reminder pushes
//   - Redis cache with local fallback, retry queue with dead-letter
//   - live roster fan-out to authorized supervisors
// =============================================================================

mod analytics;
mod attendance;
mod auth;
mod battery;
mod cache;
mod config;
mod error;
mod geo;
mod http;
mod hysteresis;
mod ingest;
mod kalman;
mod metrics;
mod models;
mod notify;
mod realtime;
mod retry;
mod scheduler;
mod shift;
mod state;
mod store;
mod validate;

use crate::analytics::AnalyticsAggregator;
use crate::attendance::AttendanceBridge;
use crate::battery::BatteryPolicy;
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::error::ErrorLogger;
use crate::hysteresis::GeofenceHysteresis;
use crate::ingest::LocationIngest;
use crate::kalman::SmootherRegistry;
use crate::metrics::Metrics;
use crate::notify::{ExpoTransport, NoopTransport, NotificationDispatcher, PushTransport};
use crate::realtime::LiveBroadcaster;
use crate::retry::RetryQueue;
use crate::scheduler::Scheduler;
use crate::shift::ShiftEngine;
use crate::state::AppState;
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or("fieldtrack_core=info,tower_http=info".into()),
        )
        .json()
        .init();

    let config = Arc::new(Config::from_env().unwrap_or_else(|e| {
        eprintln!("\n[CONFIG] {e}");
        eprintln!("Set the variable (or add it to .env) and restart.");
        std::process::exit(1);
    }));
    info!(env = ?config.app_env, "Fieldtrack core starting");

    let pool = store::create_pool(&config.database_url).await.unwrap_or_else(|e| {
        eprintln!("\n[DB] cannot reach the database: {e}");
        eprintln!("Check DATABASE_URL and that Postgres is up.");
        std::process::exit(1);
    });
    store::run_migrations(&pool).await.unwrap_or_else(|e| {
        eprintln!("\n[DB] migration failed: {e}");
        std::process::exit(1);
    });
    info!("database ready");

    let metrics = Metrics::new();
    let store = Store::new(pool.clone());
    let error_log = ErrorLogger::new(pool);
    let cache = CacheLayer::connect(&config.redis_url, metrics.clone()).await;

    // Surface cache connectivity transitions in the process log.
    let mut cache_events = cache.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match cache_events.recv().await {
                Ok(event) => info!(?event, "cache_event"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let smoother = Arc::new(SmootherRegistry::new());
    let hysteresis = GeofenceHysteresis::new(cache.clone());
    let battery = BatteryPolicy::new(cache.clone());
    let analytics = AnalyticsAggregator::new(cache.clone(), store.analytics.clone());
    let broadcaster = LiveBroadcaster::new(metrics.clone());
    let retry = RetryQueue::new(cache.clone(), metrics.clone());

    let push: Arc<dyn PushTransport> = match &config.expo_access_token {
        Some(token) => Arc::new(ExpoTransport::new(Some(token.clone()))),
        None => Arc::new(NoopTransport),
    };
    let notifier = NotificationDispatcher::new(store.clone(), push, metrics.clone());
    let attendance = Arc::new(AttendanceBridge::new(config.sparrow_endpoint.clone()));

    let shift_engine = ShiftEngine::new(
        store.clone(),
        analytics.clone(),
        notifier.clone(),
        attendance,
        error_log.clone(),
        metrics.clone(),
        config.is_production(),
    );

    let ingest = LocationIngest::new(
        store.clone(),
        cache.clone(),
        smoother,
        hysteresis,
        battery.clone(),
        analytics.clone(),
        broadcaster.clone(),
        retry.clone(),
        error_log.clone(),
        metrics.clone(),
    );

    Scheduler::new(
        shift_engine.clone(),
        retry.clone(),
        ingest.clone(),
        cache.clone(),
        error_log.clone(),
    )
    .spawn();

    let app_state = AppState {
        config: config.clone(),
        store,
        cache,
        ingest,
        shift_engine,
        broadcaster,
        battery,
        retry,
        analytics,
        error_log,
        metrics,
    };
    let app = http::router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("\n[NET] cannot bind port {}: {}", config.port, e);
        eprintln!("The port is probably taken; stop the other instance or set PORT.");
        std::process::exit(1);
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown");
        })
        .await
        .unwrap_or_else(|e| {
            eprintln!("[NET] server error: {e}");
            std::process::exit(1);
        });
}
