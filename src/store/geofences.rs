//! Company geofence CRUD and containment queries.
//!
//! Fence counts per company are tens, not thousands; containment loads the
//! active set and evaluates in process, which keeps the geometry logic in
//! one place (`geo`) instead of splitting it with SQL.

use crate::error::AppError;
use crate::models::{FenceShape, GeofenceEventRecord, GeofenceEventType, GeofenceRecord};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::PgPool;

const COLUMNS: &str = "id, company_id, name, shape, center_latitude, center_longitude, \
                       radius_meters, polygon, active, created_at, updated_at";

#[derive(Clone)]
pub struct GeofenceStore {
    pool: PgPool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGeofence {
    pub name: String,
    pub shape: FenceShape,
    #[serde(default)]
    pub center_latitude: Option<f64>,
    #[serde(default)]
    pub center_longitude: Option<f64>,
    #[serde(default)]
    pub radius_meters: Option<f64>,
    #[serde(default)]
    pub polygon: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofencePatch {
    pub name: Option<String>,
    pub radius_meters: Option<f64>,
    pub center_latitude: Option<f64>,
    pub center_longitude: Option<f64>,
    pub polygon: Option<Vec<(f64, f64)>>,
    pub active: Option<bool>,
}

/// Result of a containment probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Containment {
    pub inside: bool,
    pub geofence_id: Option<i64>,
    pub name: Option<String>,
}

impl Containment {
    pub fn outside() -> Self {
        Self { inside: false, geofence_id: None, name: None }
    }
}

impl GeofenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        company_id: i64,
        fence: NewGeofence,
    ) -> Result<GeofenceRecord, AppError> {
        validate_geometry(&fence)?;
        let radius = fence.radius_meters.unwrap_or(0.0);
        let record = sqlx::query_as::<_, GeofenceRecord>(&format!(
            r#"
            INSERT INTO company_geofences
                (company_id, name, shape, center_latitude, center_longitude,
                 radius_meters, polygon, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, true)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(&fence.name)
        .bind(fence.shape)
        .bind(fence.center_latitude)
        .bind(fence.center_longitude)
        .bind(radius)
        .bind(Json(&fence.polygon))
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Rewrite only the provided fields and bump `updated_at`.
    pub async fn update(
        &self,
        company_id: i64,
        geofence_id: i64,
        patch: GeofencePatch,
    ) -> Result<GeofenceRecord, AppError> {
        if let Some(r) = patch.radius_meters {
            if !(r > 0.0) {
                return Err(AppError::Validation("radius must be positive".into()));
            }
        }
        let record = sqlx::query_as::<_, GeofenceRecord>(&format!(
            r#"
            UPDATE company_geofences SET
                name = COALESCE($3, name),
                radius_meters = COALESCE($4, radius_meters),
                center_latitude = COALESCE($5, center_latitude),
                center_longitude = COALESCE($6, center_longitude),
                polygon = COALESCE($7, polygon),
                active = COALESCE($8, active),
                updated_at = now()
            WHERE id = $1 AND company_id = $2
            RETURNING {COLUMNS}
            "#
        ))
        .bind(geofence_id)
        .bind(company_id)
        .bind(patch.name)
        .bind(patch.radius_meters)
        .bind(patch.center_latitude)
        .bind(patch.center_longitude)
        .bind(patch.polygon.map(Json))
        .bind(patch.active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("geofence {geofence_id}")))?;
        Ok(record)
    }

    pub async fn delete(&self, company_id: i64, geofence_id: i64) -> Result<(), AppError> {
        let done = sqlx::query("DELETE FROM company_geofences WHERE id = $1 AND company_id = $2")
            .bind(geofence_id)
            .bind(company_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("geofence {geofence_id}")));
        }
        Ok(())
    }

    pub async fn list_active(&self, company_id: i64) -> Result<Vec<GeofenceRecord>, sqlx::Error> {
        sqlx::query_as::<_, GeofenceRecord>(&format!(
            "SELECT {COLUMNS} FROM company_geofences WHERE company_id = $1 AND active"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
    }

    /// First active fence of the company containing the point, if any.
    pub async fn is_inside(
        &self,
        lat: f64,
        lon: f64,
        company_id: i64,
    ) -> Result<Containment, sqlx::Error> {
        let fences = self.list_active(company_id).await?;
        Ok(probe(&fences, lat, lon))
    }

    pub async fn insert_event(
        &self,
        user_id: i64,
        geofence_id: i64,
        shift_id: Option<i64>,
        event_type: GeofenceEventType,
        occurred_at: DateTime<Utc>,
    ) -> Result<GeofenceEventRecord, sqlx::Error> {
        sqlx::query_as::<_, GeofenceEventRecord>(
            r#"
            INSERT INTO geofence_events (user_id, geofence_id, shift_id, event_type, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, geofence_id, shift_id, event_type, occurred_at
            "#,
        )
        .bind(user_id)
        .bind(geofence_id)
        .bind(shift_id)
        .bind(event_type)
        .bind(occurred_at)
        .fetch_one(&self.pool)
        .await
    }
}

/// Pure containment over an already-loaded fence set.
pub fn probe(fences: &[GeofenceRecord], lat: f64, lon: f64) -> Containment {
    for fence in fences {
        if fence.contains(lat, lon) {
            return Containment {
                inside: true,
                geofence_id: Some(fence.id),
                name: Some(fence.name.clone()),
            };
        }
    }
    Containment::outside()
}

fn validate_geometry(fence: &NewGeofence) -> Result<(), AppError> {
    if fence.name.trim().is_empty() {
        return Err(AppError::Validation("geofence name is required".into()));
    }
    match fence.shape {
        FenceShape::Circle => {
            let (Some(lat), Some(lon)) = (fence.center_latitude, fence.center_longitude) else {
                return Err(AppError::Validation("circle fence requires a centre point".into()));
            };
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(AppError::Validation("centre outside Earth ranges".into()));
            }
            match fence.radius_meters {
                Some(r) if r > 0.0 && r.is_finite() => Ok(()),
                _ => Err(AppError::Validation("radius must be positive".into())),
            }
        }
        FenceShape::Polygon => {
            if fence.polygon.len() < 3 {
                return Err(AppError::Validation("polygon needs at least 3 vertices".into()));
            }
            if fence
                .polygon
                .iter()
                .any(|(lat, lon)| !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lon))
            {
                return Err(AppError::Validation("polygon vertex outside Earth ranges".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(id: i64, lat: f64, lon: f64, radius: f64) -> GeofenceRecord {
        GeofenceRecord {
            id,
            company_id: 1,
            name: format!("fence-{id}"),
            shape: FenceShape::Circle,
            center_latitude: Some(lat),
            center_longitude: Some(lon),
            radius_meters: radius,
            polygon: Json(vec![]),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_probe_finds_containing_fence() {
        let fences = vec![circle(1, 12.97, 77.59, 150.0), circle(2, 13.10, 77.70, 150.0)];
        let hit = probe(&fences, 13.1001, 77.7001);
        assert!(hit.inside);
        assert_eq!(hit.geofence_id, Some(2));
        assert_eq!(hit.name.as_deref(), Some("fence-2"));
    }

    #[test]
    fn test_probe_outside_every_fence() {
        let fences = vec![circle(1, 12.97, 77.59, 150.0)];
        assert_eq!(probe(&fences, 40.0, -74.0), Containment::outside());
    }

    #[test]
    fn test_geometry_validation() {
        let ok = NewGeofence {
            name: "office".into(),
            shape: FenceShape::Circle,
            center_latitude: Some(12.97),
            center_longitude: Some(77.59),
            radius_meters: Some(100.0),
            polygon: vec![],
        };
        assert!(validate_geometry(&ok).is_ok());

        let mut bad_radius = ok.clone();
        bad_radius.radius_meters = Some(0.0);
        assert!(validate_geometry(&bad_radius).is_err());

        let mut no_centre = ok.clone();
        no_centre.center_latitude = None;
        assert!(validate_geometry(&no_centre).is_err());

        let thin_polygon = NewGeofence {
            name: "yard".into(),
            shape: FenceShape::Polygon,
            center_latitude: None,
            center_longitude: None,
            radius_meters: None,
            polygon: vec![(0.0, 0.0), (1.0, 1.0)],
        };
        assert!(validate_geometry(&thin_polygon).is_err());

        let unnamed = NewGeofence { name: "  ".into(), ..ok };
        assert!(validate_geometry(&unnamed).is_err());
    }
}
