//! Shift auto-end timers.

use crate::models::{Role, ShiftTimerRecord};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

const COLUMNS: &str = "id, shift_id, user_id, duration_hours, end_time, role_type, \
                       shift_bucket, completed, notification_sent, created_at";

#[derive(Clone)]
pub struct TimerStore {
    pool: PgPool,
}

impl TimerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Replace any running timer with a new one. Two statements, but the
    /// partial unique index on `(user_id) WHERE NOT completed` makes a
    /// racing duplicate fail loudly rather than silently coexist.
    pub async fn replace(
        &self,
        user_id: i64,
        shift_id: i64,
        duration_hours: f64,
        end_time: DateTime<Utc>,
        role: Role,
        bucket: &str,
    ) -> Result<ShiftTimerRecord, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM shift_timer_settings WHERE user_id = $1 AND NOT completed")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let record = sqlx::query_as::<_, ShiftTimerRecord>(&format!(
            r#"
            INSERT INTO shift_timer_settings
                (shift_id, user_id, duration_hours, end_time, role_type,
                 shift_bucket, completed, notification_sent)
            VALUES ($1, $2, $3, $4, $5, $6, false, false)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(shift_id)
        .bind(user_id)
        .bind(duration_hours)
        .bind(end_time)
        .bind(role)
        .bind(bucket)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Remove the running timer; true when one existed.
    pub async fn cancel(&self, user_id: i64) -> Result<bool, sqlx::Error> {
        let done = sqlx::query("DELETE FROM shift_timer_settings WHERE user_id = $1 AND NOT completed")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn find_running(&self, user_id: i64) -> Result<Option<ShiftTimerRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftTimerRecord>(&format!(
            "SELECT {COLUMNS} FROM shift_timer_settings WHERE user_id = $1 AND NOT completed"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Timers whose deadline has passed, oldest first. The sweep walks
    /// these one transaction at a time.
    pub async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ShiftTimerRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftTimerRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM shift_timer_settings
            WHERE NOT completed AND end_time <= $1
            ORDER BY end_time ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Timers ending within `(now, now + window]` that have not yet been
    /// reminded about.
    pub async fn find_reminder_due(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Vec<ShiftTimerRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShiftTimerRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM shift_timer_settings
            WHERE NOT completed AND NOT notification_sent
              AND end_time > $1 AND end_time <= $2
            "#
        ))
        .bind(now)
        .bind(now + window)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn mark_notification_sent(&self, timer_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE shift_timer_settings SET notification_sent = true WHERE id = $1")
            .bind(timer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, timer_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE shift_timer_settings SET completed = true WHERE id = $1")
            .bind(timer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        timer_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE shift_timer_settings SET completed = true WHERE id = $1")
            .bind(timer_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Completing a shift retires every timer still pointing at it.
    pub async fn complete_for_shift(&self, shift_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE shift_timer_settings SET completed = true WHERE shift_id = $1 AND NOT completed")
            .bind(shift_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
