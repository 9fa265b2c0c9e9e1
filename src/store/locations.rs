//! Append-only location samples.

use crate::models::{GeofenceStatus, LocationRecord};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

const COLUMNS: &str = "id, user_id, shift_id, latitude, longitude, accuracy, battery_level, \
                       speed, is_moving, recorded_at, received_at, geofence_status, \
                       is_tracking_active";

#[derive(Clone)]
pub struct LocationStore {
    pool: PgPool,
}

pub struct NewLocation {
    pub user_id: i64,
    pub shift_id: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub battery_level: Option<f64>,
    pub speed: Option<f64>,
    pub is_moving: bool,
    pub recorded_at: DateTime<Utc>,
    pub geofence_status: GeofenceStatus,
    pub is_tracking_active: bool,
}

impl LocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one sample. `received_at` is stamped by the database so the
    /// per-user persistence order is the arrival order, whatever the
    /// client clock says.
    pub async fn insert(&self, sample: NewLocation) -> Result<LocationRecord, sqlx::Error> {
        sqlx::query_as::<_, LocationRecord>(&format!(
            r#"
            INSERT INTO employee_locations
                (user_id, shift_id, latitude, longitude, accuracy, battery_level,
                 speed, is_moving, recorded_at, received_at, geofence_status,
                 is_tracking_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), $10, $11)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(sample.user_id)
        .bind(sample.shift_id)
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(sample.accuracy)
        .bind(sample.battery_level)
        .bind(sample.speed)
        .bind(sample.is_moving)
        .bind(sample.recorded_at)
        .bind(sample.geofence_status)
        .bind(sample.is_tracking_active)
        .fetch_one(&self.pool)
        .await
    }

    /// The most recently persisted sample for a user.
    pub async fn last_for_user(&self, user_id: i64) -> Result<Option<LocationRecord>, sqlx::Error> {
        sqlx::query_as::<_, LocationRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM employee_locations
            WHERE user_id = $1
            ORDER BY received_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// All samples for a user on one calendar day, arrival order.
    pub async fn for_user_on_date(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<LocationRecord>, sqlx::Error> {
        sqlx::query_as::<_, LocationRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM employee_locations
            WHERE user_id = $1 AND recorded_at >= $2 AND recorded_at < $3
            ORDER BY received_at ASC, id ASC
            "#
        ))
        .bind(user_id)
        .bind(date.and_hms_opt(0, 0, 0).map(|t| t.and_utc()))
        .bind(date.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)).map(|t| t.and_utc()))
        .fetch_all(&self.pool)
        .await
    }

    /// Samples belonging to one shift, arrival order.
    pub async fn for_shift(&self, shift_id: i64) -> Result<Vec<LocationRecord>, sqlx::Error> {
        sqlx::query_as::<_, LocationRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM employee_locations
            WHERE shift_id = $1
            ORDER BY received_at ASC, id ASC
            "#
        ))
        .bind(shift_id)
        .fetch_all(&self.pool)
        .await
    }
}
