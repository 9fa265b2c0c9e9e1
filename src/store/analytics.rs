//! Daily tracking rollups, upserted by `(user_id, date)`.

use crate::models::DailyAnalyticsRecord;
use chrono::NaiveDate;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AnalyticsStore {
    pool: PgPool,
}

impl AnalyticsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Make sure the day's row exists (shift start).
    pub async fn ensure_row(&self, user_id: i64, date: NaiveDate) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tracking_analytics (user_id, date)
            VALUES ($1, $2)
            ON CONFLICT (user_id, date) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Accumulate one sample's contribution into the day.
    pub async fn add(
        &self,
        user_id: i64,
        date: NaiveDate,
        distance_km: f64,
        travel_minutes: f64,
        indoor_minutes: f64,
        outdoor_minutes: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tracking_analytics
                (user_id, date, distance_km, travel_minutes, indoor_minutes, outdoor_minutes)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, date) DO UPDATE SET
                distance_km = tracking_analytics.distance_km + EXCLUDED.distance_km,
                travel_minutes = tracking_analytics.travel_minutes + EXCLUDED.travel_minutes,
                indoor_minutes = tracking_analytics.indoor_minutes + EXCLUDED.indoor_minutes,
                outdoor_minutes = tracking_analytics.outdoor_minutes + EXCLUDED.outdoor_minutes
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(distance_km)
        .bind(travel_minutes)
        .bind(indoor_minutes)
        .bind(outdoor_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pin the day's distance and travel time to the closed-shift totals.
    /// Called when a user's last shift of the day ends, so the rollup and
    /// the shift rows agree exactly.
    pub async fn reconcile(
        &self,
        user_id: i64,
        date: NaiveDate,
        distance_km: f64,
        travel_minutes: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tracking_analytics (user_id, date, distance_km, travel_minutes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, date) DO UPDATE SET
                distance_km = EXCLUDED.distance_km,
                travel_minutes = EXCLUDED.travel_minutes
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(distance_km)
        .bind(travel_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn range(
        &self,
        user_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAnalyticsRecord>, sqlx::Error> {
        sqlx::query_as::<_, DailyAnalyticsRecord>(
            r#"
            SELECT user_id, date, distance_km, travel_minutes, indoor_minutes, outdoor_minutes
            FROM tracking_analytics
            WHERE user_id = $1 AND date >= $2 AND date <= $3
            ORDER BY date ASC
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
    }
}
