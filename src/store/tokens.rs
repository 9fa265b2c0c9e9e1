//! Device push tokens.

use crate::models::DeviceTokenRecord;
use sqlx::PgPool;

#[derive(Clone)]
pub struct DeviceTokenStore {
    pool: PgPool,
}

impl DeviceTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Active tokens for a set of recipients.
    pub async fn active_for_users(
        &self,
        user_ids: &[i64],
    ) -> Result<Vec<DeviceTokenRecord>, sqlx::Error> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, DeviceTokenRecord>(
            r#"
            SELECT id, user_id, token, platform, device_name, active, last_used
            FROM device_tokens
            WHERE user_id = ANY($1) AND active
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
    }

    /// Retire a token the provider reported as gone.
    pub async fn deactivate(&self, token: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE device_tokens SET active = false WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch(&self, tokens: &[String]) -> Result<(), sqlx::Error> {
        if tokens.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE device_tokens SET last_used = now() WHERE token = ANY($1)")
            .bind(tokens)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
