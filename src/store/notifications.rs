//! In-app notification rows and the push audit trail.

use crate::models::Notification;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct NotificationStore {
    pool: PgPool,
}

impl NotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unread in-app row the mobile client polls for.
    pub async fn insert_in_app(
        &self,
        user_id: i64,
        notification: &Notification,
    ) -> Result<Uuid, sqlx::Error> {
        let id = notification.id.unwrap_or_else(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, title, message, kind, priority, data, read)
            VALUES ($1, $2, $3, $4, $5, $6, $7, false)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.kind)
        .bind(&notification.priority)
        .bind(&notification.data)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Audit row per push dispatch attempt.
    pub async fn insert_push_audit(
        &self,
        user_id: i64,
        notification: &Notification,
        sent: bool,
        sent_at: DateTime<Utc>,
        provider_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO push_notifications
                (user_id, title, message, kind, sent, sent_at, provider_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.kind)
        .bind(sent)
        .bind(sent_at)
        .bind(provider_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
