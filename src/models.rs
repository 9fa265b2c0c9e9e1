//! Domain types shared across the pipeline: roles, shifts, samples,
//! timers, fences, and the wire DTOs the mobile clients speak.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Roles and shift buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "user_role", rename_all = "kebab-case")]
pub enum Role {
    Employee,
    GroupAdmin,
    Management,
    SuperAdmin,
}

impl Role {
    /// The physical shift bucket this role's shifts are stored under.
    /// Super-admins do not work shifts.
    pub fn shift_bucket(self) -> Option<ShiftBucket> {
        match self {
            Role::Employee => Some(ShiftBucket::Employee),
            Role::GroupAdmin => Some(ShiftBucket::GroupAdmin),
            Role::Management => Some(ShiftBucket::Management),
            Role::SuperAdmin => None,
        }
    }

    /// The role notified when a shift of this role ends automatically.
    pub fn supervisor_role(self) -> Option<Role> {
        match self {
            Role::Employee => Some(Role::GroupAdmin),
            Role::GroupAdmin => Some(Role::Management),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Employee => "employee",
            Role::GroupAdmin => "group-admin",
            Role::Management => "management",
            Role::SuperAdmin => "super-admin",
        }
    }
}

/// Shift storage bucket. The descriptor below is the only place the
/// physical table names appear; everything else goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShiftBucket {
    Employee,
    GroupAdmin,
    Management,
}

pub struct ShiftTableDescriptor {
    pub bucket: ShiftBucket,
    pub table: &'static str,
}

pub const SHIFT_TABLES: [ShiftTableDescriptor; 3] = [
    ShiftTableDescriptor { bucket: ShiftBucket::Employee, table: "employee_shifts" },
    ShiftTableDescriptor { bucket: ShiftBucket::GroupAdmin, table: "group_admin_shifts" },
    ShiftTableDescriptor { bucket: ShiftBucket::Management, table: "management_shifts" },
];

impl ShiftBucket {
    pub fn table(self) -> &'static str {
        SHIFT_TABLES
            .iter()
            .find(|d| d.bucket == self)
            .map(|d| d.table)
            .unwrap_or("employee_shifts")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShiftBucket::Employee => "employee",
            ShiftBucket::GroupAdmin => "group-admin",
            ShiftBucket::Management => "management",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "employee" => Some(ShiftBucket::Employee),
            "group-admin" => Some(ShiftBucket::GroupAdmin),
            "management" => Some(ShiftBucket::Management),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Users and companies (read-side projections; admin CRUD lives elsewhere)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub company_id: i64,
    pub group_admin_id: Option<i64>,
    pub management_id: Option<i64>,
    pub employee_number: Option<String>,
    pub department: Option<String>,
    pub designation: Option<String>,
    pub can_override_geofence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "company_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompanyStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, FromRow)]
pub struct CompanyRecord {
    pub id: i64,
    pub name: String,
    pub status: CompanyStatus,
    /// Reject samples with worse accuracy than this, when set.
    pub min_location_accuracy: Option<f64>,
    /// Client update-interval clamp, milliseconds.
    pub min_update_interval_ms: Option<i64>,
    pub max_update_interval_ms: Option<i64>,
    pub attendance_bridge_enabled: bool,
}

// ---------------------------------------------------------------------------
// Location samples
// ---------------------------------------------------------------------------

/// Incoming location payload, shared by the REST body and the socket event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub is_moving: Option<bool>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub shift_id: Option<i64>,
    #[serde(default)]
    pub is_background: Option<bool>,
    #[serde(default)]
    pub is_charging: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "geofence_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GeofenceStatus {
    Inside,
    Outside,
    Unknown,
}

/// Persisted, smoothed and validated sample.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub id: i64,
    pub user_id: i64,
    pub shift_id: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub battery_level: Option<f64>,
    pub speed: Option<f64>,
    pub is_moving: bool,
    pub recorded_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub geofence_status: GeofenceStatus,
    pub is_tracking_active: bool,
}

/// One vertex of a shift's stored polyline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Shifts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "shift_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ShiftStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftRecord {
    pub id: i64,
    pub user_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub location_history: Json<Vec<TrackPoint>>,
    pub total_distance_km: f64,
    pub travel_time_minutes: f64,
    pub ended_automatically: bool,
    pub status: ShiftStatus,
}

// ---------------------------------------------------------------------------
// Shift timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftTimerRecord {
    pub id: i64,
    pub shift_id: i64,
    pub user_id: i64,
    pub duration_hours: f64,
    pub end_time: DateTime<Utc>,
    pub role_type: Role,
    pub shift_bucket: String,
    pub completed: bool,
    pub notification_sent: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Geofences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "fence_shape", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FenceShape {
    Circle,
    Polygon,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceRecord {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub shape: FenceShape,
    pub center_latitude: Option<f64>,
    pub center_longitude: Option<f64>,
    pub radius_meters: f64,
    /// Polygon vertices as (lat, lon) pairs; empty for circles.
    pub polygon: Json<Vec<(f64, f64)>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GeofenceRecord {
    /// Containment in this fence.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self.shape {
            FenceShape::Circle => match (self.center_latitude, self.center_longitude) {
                (Some(clat), Some(clon)) => {
                    crate::geo::point_in_circle(lat, lon, clat, clon, self.radius_meters)
                }
                _ => false,
            },
            FenceShape::Polygon => crate::geo::point_in_polygon(lat, lon, &self.polygon.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "geofence_event_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GeofenceEventType {
    Entry,
    Exit,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEventRecord {
    pub id: i64,
    pub user_id: i64,
    pub geofence_id: i64,
    pub shift_id: Option<i64>,
    pub event_type: GeofenceEventType,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Device tokens & notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct DeviceTokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub platform: String,
    pub device_name: Option<String>,
    pub active: bool,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub id: Option<uuid::Uuid>,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_priority() -> String {
    "default".to_string()
}

// ---------------------------------------------------------------------------
// Daily analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAnalyticsRecord {
    pub user_id: i64,
    pub date: NaiveDate,
    pub distance_km: f64,
    pub travel_minutes: f64,
    pub indoor_minutes: f64,
    pub outdoor_minutes: f64,
}

// ---------------------------------------------------------------------------
// Realtime payloads
// ---------------------------------------------------------------------------

/// Enriched payload fanned out to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveLocation {
    pub employee: LiveEmployee,
    pub location: LivePoint,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEmployee {
    pub id: i64,
    pub name: String,
    pub employee_number: Option<String>,
    pub department: Option<String>,
    pub designation: Option<String>,
    #[serde(default)]
    pub device_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub battery_level: Option<f64>,
    pub is_moving: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_bucket_has_a_table() {
        assert_eq!(ShiftBucket::Employee.table(), "employee_shifts");
        assert_eq!(ShiftBucket::GroupAdmin.table(), "group_admin_shifts");
        assert_eq!(ShiftBucket::Management.table(), "management_shifts");
    }

    #[test]
    fn test_super_admin_has_no_bucket() {
        assert!(Role::SuperAdmin.shift_bucket().is_none());
        assert_eq!(Role::Employee.shift_bucket(), Some(ShiftBucket::Employee));
    }

    #[test]
    fn test_supervisor_chain() {
        assert_eq!(Role::Employee.supervisor_role(), Some(Role::GroupAdmin));
        assert_eq!(Role::GroupAdmin.supervisor_role(), Some(Role::Management));
        assert_eq!(Role::Management.supervisor_role(), None);
    }

    #[test]
    fn test_role_serde_kebab_case() {
        let json = serde_json::to_string(&Role::GroupAdmin).unwrap();
        assert_eq!(json, "\"group-admin\"");
        let back: Role = serde_json::from_str("\"super-admin\"").unwrap();
        assert_eq!(back, Role::SuperAdmin);
    }

    #[test]
    fn test_bucket_round_trip() {
        for d in SHIFT_TABLES {
            assert_eq!(ShiftBucket::from_str_loose(d.bucket.as_str()), Some(d.bucket));
        }
        assert_eq!(ShiftBucket::from_str_loose("janitor"), None);
    }

    #[test]
    fn test_location_update_accepts_minimal_body() {
        let body = r#"{"latitude": 12.97, "longitude": 77.59}"#;
        let u: LocationUpdate = serde_json::from_str(body).unwrap();
        assert_eq!(u.latitude, 12.97);
        assert!(u.accuracy.is_none());
        assert!(u.is_background.is_none());
    }

    #[test]
    fn test_circle_fence_contains() {
        let fence = GeofenceRecord {
            id: 1,
            company_id: 1,
            name: "office".into(),
            shape: FenceShape::Circle,
            center_latitude: Some(12.97),
            center_longitude: Some(77.59),
            radius_meters: 200.0,
            polygon: Json(vec![]),
            active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(fence.contains(12.9705, 77.5905));
        assert!(!fence.contains(12.99, 77.61));
    }

    #[test]
    fn test_polygon_fence_contains() {
        let fence = GeofenceRecord {
            id: 2,
            company_id: 1,
            name: "yard".into(),
            shape: FenceShape::Polygon,
            center_latitude: None,
            center_longitude: None,
            radius_meters: 1.0,
            polygon: Json(vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]),
            active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(fence.contains(0.5, 0.5));
        assert!(!fence.contains(2.0, 0.5));
    }
}
