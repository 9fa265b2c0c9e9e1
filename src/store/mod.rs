//! Persistence layer: one repository struct per concern over a shared
//! `PgPool`. Repositories own their SQL; nothing above this layer writes
//! queries. Shift tables are bucketed by role and resolved through the
//! descriptor in `models`, so repositories take the bucket, never a
//! table name.

pub mod analytics;
pub mod geofences;
pub mod locations;
pub mod notifications;
pub mod shifts;
pub mod timers;
pub mod tokens;
pub mod users;

pub use analytics::AnalyticsStore;
pub use geofences::GeofenceStore;
pub use locations::LocationStore;
pub use notifications::NotificationStore;
pub use shifts::ShiftStore;
pub use timers::TimerStore;
pub use tokens::DeviceTokenStore;
pub use users::UserStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Bounded pool shared by every repository. Ingest runs many short
/// queries; long transactions belong to the sweep only.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Everything the services need, wired once at startup.
#[derive(Clone)]
pub struct Store {
    pub users: UserStore,
    pub shifts: ShiftStore,
    pub locations: LocationStore,
    pub geofences: GeofenceStore,
    pub timers: TimerStore,
    pub tokens: DeviceTokenStore,
    pub notifications: NotificationStore,
    pub analytics: AnalyticsStore,
    pub pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self {
            users: UserStore::new(pool.clone()),
            shifts: ShiftStore::new(pool.clone()),
            locations: LocationStore::new(pool.clone()),
            geofences: GeofenceStore::new(pool.clone()),
            timers: TimerStore::new(pool.clone()),
            tokens: DeviceTokenStore::new(pool.clone()),
            notifications: NotificationStore::new(pool.clone()),
            analytics: AnalyticsStore::new(pool.clone()),
            pool,
        }
    }
}
