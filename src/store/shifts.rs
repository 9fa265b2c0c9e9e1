//! Role-bucketed shift rows.
//!
//! Shifts live in three physical tables with identical columns, one per
//! role bucket. Every query resolves the table through the bucket
//! descriptor; no caller supplies a table name. The partial unique index
//! on `(user_id) WHERE end_time IS NULL` is the arbiter of "at most one
//! active shift": concurrent starts lose at the database, not in memory.

use crate::models::{ShiftBucket, ShiftRecord, TrackPoint};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

const COLUMNS: &str = "id, user_id, start_time, end_time, start_latitude, start_longitude, \
                       end_latitude, end_longitude, location_history, total_distance_km, \
                       travel_time_minutes, ended_automatically, status";

#[derive(Clone)]
pub struct ShiftStore {
    pool: PgPool,
}

/// True when the error is the unique-violation raised by a concurrent
/// start against the active-shift index.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

impl ShiftStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_active(
        &self,
        user_id: i64,
        bucket: ShiftBucket,
    ) -> Result<Option<ShiftRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftRecord>(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE user_id = $1 AND end_time IS NULL",
            table = bucket.table()
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn find_by_id(
        &self,
        shift_id: i64,
        bucket: ShiftBucket,
    ) -> Result<Option<ShiftRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftRecord>(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1",
            table = bucket.table()
        ))
        .bind(shift_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Open a shift. Fails with a unique violation when one is already
    /// active; the engine maps that to a conflict.
    pub async fn start(
        &self,
        user_id: i64,
        bucket: ShiftBucket,
        start_time: DateTime<Utc>,
        opening: TrackPoint,
    ) -> Result<ShiftRecord, sqlx::Error> {
        sqlx::query_as::<_, ShiftRecord>(&format!(
            r#"
            INSERT INTO {table}
                (user_id, start_time, start_latitude, start_longitude,
                 location_history, total_distance_km, travel_time_minutes,
                 ended_automatically, status)
            VALUES ($1, $2, $3, $4, $5, 0, 0, false, 'active')
            RETURNING {COLUMNS}
            "#,
            table = bucket.table()
        ))
        .bind(user_id)
        .bind(start_time)
        .bind(opening.lat)
        .bind(opening.lon)
        .bind(Json(vec![opening]))
        .fetch_one(&self.pool)
        .await
    }

    /// Append one vertex to the stored polyline. The JSONB concatenation
    /// keeps the history append-only at the database.
    pub async fn append_point(
        &self,
        shift_id: i64,
        bucket: ShiftBucket,
        point: TrackPoint,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET location_history = location_history || $2::jsonb
            WHERE id = $1 AND end_time IS NULL
            "#,
            table = bucket.table()
        ))
        .bind(shift_id)
        .bind(Json(vec![point]))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close a shift with its computed metrics.
    pub async fn end(
        &self,
        shift_id: i64,
        bucket: ShiftBucket,
        end_time: DateTime<Utc>,
        end_lat: Option<f64>,
        end_lon: Option<f64>,
        total_distance_km: f64,
        travel_time_minutes: f64,
        ended_automatically: bool,
    ) -> Result<Option<ShiftRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftRecord>(&format!(
            r#"
            UPDATE {table} SET
                end_time = $2,
                end_latitude = $3,
                end_longitude = $4,
                total_distance_km = $5,
                travel_time_minutes = $6,
                ended_automatically = $7,
                status = 'completed'
            WHERE id = $1 AND end_time IS NULL
            RETURNING {COLUMNS}
            "#,
            table = bucket.table()
        ))
        .bind(shift_id)
        .bind(end_time)
        .bind(end_lat)
        .bind(end_lon)
        .bind(total_distance_km)
        .bind(travel_time_minutes)
        .bind(ended_automatically)
        .fetch_optional(&self.pool)
        .await
    }

    /// Row-locked fetch inside the auto-end transaction.
    pub async fn find_by_id_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        shift_id: i64,
        bucket: ShiftBucket,
    ) -> Result<Option<ShiftRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftRecord>(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE",
            table = bucket.table()
        ))
        .bind(shift_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Close a shift inside the sweep transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn end_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        shift_id: i64,
        bucket: ShiftBucket,
        end_time: DateTime<Utc>,
        end_lat: Option<f64>,
        end_lon: Option<f64>,
        total_distance_km: f64,
        travel_time_minutes: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            UPDATE {table} SET
                end_time = $2,
                end_latitude = $3,
                end_longitude = $4,
                total_distance_km = $5,
                travel_time_minutes = $6,
                ended_automatically = true,
                status = 'completed'
            WHERE id = $1 AND end_time IS NULL
            "#,
            table = bucket.table()
        ))
        .bind(shift_id)
        .bind(end_time)
        .bind(end_lat)
        .bind(end_lon)
        .bind(total_distance_km)
        .bind(travel_time_minutes)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Shifts of one user intersecting `[from, to]`, newest first.
    pub async fn history(
        &self,
        user_id: i64,
        bucket: ShiftBucket,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ShiftRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM {table}
            WHERE user_id = $1 AND start_time <= $3
              AND (end_time IS NULL OR end_time >= $2)
            ORDER BY start_time DESC
            "#,
            table = bucket.table()
        ))
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
    }

    /// Shifts of one user starting on a calendar day.
    pub async fn for_date(
        &self,
        user_id: i64,
        bucket: ShiftBucket,
        date: NaiveDate,
    ) -> Result<Vec<ShiftRecord>, sqlx::Error> {
        let from = date.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        let to = date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc());
        sqlx::query_as::<_, ShiftRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM {table}
            WHERE user_id = $1 AND start_time >= $2 AND start_time < $3
            ORDER BY start_time ASC
            "#,
            table = bucket.table()
        ))
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
    }

    /// Sum of closed-shift distances for the user's day; the daily rollup
    /// reconciles against this after the last shift of the day ends.
    pub async fn closed_distance_for_date(
        &self,
        user_id: i64,
        bucket: ShiftBucket,
        date: NaiveDate,
    ) -> Result<(f64, f64), sqlx::Error> {
        let from = date.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        let to = date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc());
        let row: (Option<f64>, Option<f64>) = sqlx::query_as(&format!(
            r#"
            SELECT SUM(total_distance_km), SUM(travel_time_minutes)
            FROM {table}
            WHERE user_id = $1 AND start_time >= $2 AND start_time < $3
              AND end_time IS NOT NULL
            "#,
            table = bucket.table()
        ))
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.0.unwrap_or(0.0), row.1.unwrap_or(0.0)))
    }
}
