//! Read-side user and company lookups. User administration itself lives
//! in a separate service; this layer only observes.

use crate::models::{CompanyRecord, Role, UserRecord};
use sqlx::PgPool;

#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, name, email, role, company_id, group_admin_id, management_id,
                   employee_number, department, designation, can_override_geofence
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn find_company(&self, company_id: i64) -> Result<Option<CompanyRecord>, sqlx::Error> {
        sqlx::query_as::<_, CompanyRecord>(
            r#"
            SELECT id, name, status, min_location_accuracy,
                   min_update_interval_ms, max_update_interval_ms,
                   attendance_bridge_enabled
            FROM companies WHERE id = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Every active user holding `role` in the company.
    pub async fn find_by_role(
        &self,
        company_id: i64,
        role: Role,
    ) -> Result<Vec<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, name, email, role, company_id, group_admin_id, management_id,
                   employee_number, department, designation, can_override_geofence
            FROM users WHERE company_id = $1 AND role = $2 AND active
            "#,
        )
        .bind(company_id)
        .bind(role)
        .fetch_all(&self.pool)
        .await
    }

    /// The employees reporting to one group admin.
    pub async fn find_subordinates(
        &self,
        group_admin_id: i64,
    ) -> Result<Vec<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, name, email, role, company_id, group_admin_id, management_id,
                   employee_number, department, designation, can_override_geofence
            FROM users WHERE group_admin_id = $1 AND active
            "#,
        )
        .bind(group_admin_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Ids from `candidates` that `viewer` is allowed to observe live:
    /// their own subordinates, or anyone in the company for management.
    pub async fn filter_visible(
        &self,
        viewer: &UserRecord,
        candidates: &[i64],
    ) -> Result<Vec<i64>, sqlx::Error> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(i64,)> = match viewer.role {
            Role::Management | Role::SuperAdmin => {
                sqlx::query_as(
                    r#"
                    SELECT id FROM users
                    WHERE id = ANY($1) AND company_id = $2 AND active
                    "#,
                )
                .bind(candidates)
                .bind(viewer.company_id)
                .fetch_all(&self.pool)
                .await?
            }
            Role::GroupAdmin => {
                sqlx::query_as(
                    r#"
                    SELECT id FROM users
                    WHERE id = ANY($1) AND group_admin_id = $2 AND active
                    "#,
                )
                .bind(candidates)
                .bind(viewer.id)
                .fetch_all(&self.pool)
                .await?
            }
            Role::Employee => Vec::new(),
        };
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
