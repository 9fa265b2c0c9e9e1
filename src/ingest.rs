//! Location ingest pipeline: smooth → validate → persist → fan out.
//!
//! Foreground and socket updates share this path; background updates run
//! the same pipeline with relaxed gates and an unconditional
//! acknowledgement, so a phone in a retry loop can never amplify itself
//! against the API.

use crate::analytics::AnalyticsAggregator;
use crate::battery::{BatteryPolicy, PolicyInput};
use crate::cache::CacheLayer;
use crate::error::{AppError, ErrorLogger};
use crate::hysteresis::{GeofenceHysteresis, Transition};
use crate::kalman::SmootherRegistry;
use crate::metrics::Metrics;
use crate::models::{
    CompanyRecord, GeofenceEventType, GeofenceStatus, LiveEmployee, LiveLocation, LivePoint,
    LocationUpdate, ShiftBucket, UserRecord,
};
use crate::realtime::LiveBroadcaster;
use crate::retry::{RetryQueue, RetryRecord};
use crate::store::locations::NewLocation;
use crate::store::Store;
use crate::validate::{self, PriorFix, ValidationOutcome};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// TTL on the `lastLocation:<uid>` cache entry.
const LAST_LOCATION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<i64>,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub geofence_status: GeofenceStatus,
    /// Suggested milliseconds until the client's next sample.
    pub next_interval_ms: u64,
}

pub struct LocationIngest {
    store: Store,
    cache: Arc<CacheLayer>,
    smoother: Arc<SmootherRegistry>,
    hysteresis: Arc<GeofenceHysteresis>,
    battery: Arc<BatteryPolicy>,
    analytics: Arc<AnalyticsAggregator>,
    broadcaster: Arc<LiveBroadcaster>,
    retry: Arc<RetryQueue>,
    error_log: Arc<ErrorLogger>,
    metrics: Arc<Metrics>,
}

impl LocationIngest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        cache: Arc<CacheLayer>,
        smoother: Arc<SmootherRegistry>,
        hysteresis: Arc<GeofenceHysteresis>,
        battery: Arc<BatteryPolicy>,
        analytics: Arc<AnalyticsAggregator>,
        broadcaster: Arc<LiveBroadcaster>,
        retry: Arc<RetryQueue>,
        error_log: Arc<ErrorLogger>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            smoother,
            hysteresis,
            battery,
            analytics,
            broadcaster,
            retry,
            error_log,
            metrics,
        })
    }

    /// Foreground ingest. Validation failures surface to the caller;
    /// persistence failures come back as a non-success acknowledgement
    /// with the payload queued for retry.
    pub async fn ingest(
        &self,
        user: &UserRecord,
        update: &LocationUpdate,
    ) -> Result<IngestAck, AppError> {
        self.run_pipeline(user, update, false).await
    }

    /// Background ingest: always acknowledges. Samples failing validation
    /// are logged and discarded.
    pub async fn ingest_background(&self, user: &UserRecord, update: &LocationUpdate) -> IngestAck {
        match self.run_pipeline(user, update, true).await {
            Ok(ack) => ack,
            Err(e) => {
                self.metrics.background_discarded.fetch_add(1, Ordering::Relaxed);
                warn!(user_id = user.id, error = %e, "background_sample_discarded");
                IngestAck {
                    success: true,
                    location_id: None,
                    timestamp: Utc::now(),
                    error_code: Some(e.error_code().to_string()),
                    warning: Some(e.to_string()),
                    geofence_status: GeofenceStatus::Unknown,
                    next_interval_ms: crate::battery::MAX_INTERVAL.as_millis() as u64,
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        user: &UserRecord,
        update: &LocationUpdate,
        is_background: bool,
    ) -> Result<IngestAck, AppError> {
        let effective_at = update.timestamp.unwrap_or_else(Utc::now);

        // Company policy is advisory; a failed lookup skips the gate
        // rather than blocking the sample.
        let company = match self.store.users.find_company(user.company_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "company_lookup_failed");
                None
            }
        };

        let prior = match self.store.locations.last_for_user(user.id).await {
            Ok(p) => p.map(|r| PriorFix {
                latitude: r.latitude,
                longitude: r.longitude,
                recorded_at: r.recorded_at,
            }),
            Err(e) if is_background => {
                warn!(error = %e, "prior_fix_lookup_failed");
                None
            }
            Err(e) => return Err(e.into()),
        };

        // Background fixes carry stale time and would bias the velocity
        // estimate, so they bypass smoothing.
        let (lat, lon) = if is_background {
            (update.latitude, update.longitude)
        } else {
            self.smoother
                .smooth(user.id, update.latitude, update.longitude, update.accuracy, effective_at)
        };

        let outcome = validate::validate(update, effective_at, prior, company.as_ref(), is_background)?;
        let warning = match outcome {
            ValidationOutcome::Accepted => None,
            ValidationOutcome::AcceptedWithWarning(msg) => Some(msg),
        };

        // Containment against the company's fences drives both the stored
        // status and the hysteresis state machine.
        let fences = match self.store.geofences.list_active(user.company_id).await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "fence_lookup_failed");
                Vec::new()
            }
        };
        let containment = crate::store::geofences::probe(&fences, lat, lon);
        let geofence_status = if fences.is_empty() {
            GeofenceStatus::Unknown
        } else if containment.inside {
            GeofenceStatus::Inside
        } else {
            GeofenceStatus::Outside
        };

        let bucket = user.role.shift_bucket();
        let active_shift = match bucket {
            Some(bucket) => match self.store.shifts.find_active(user.id, bucket).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "active_shift_lookup_failed");
                    None
                }
            },
            None => None,
        };
        let shift_id = update.shift_id.or(active_shift.as_ref().map(|s| s.id));

        let is_moving = update
            .is_moving
            .unwrap_or_else(|| update.speed.is_some_and(|s| s > crate::battery::MOVING_SPEED_MPS));

        // Persist. A storage fault queues the payload and reports a
        // non-success ack instead of an error, so clients keep streaming.
        let record = match self
            .store
            .locations
            .insert(NewLocation {
                user_id: user.id,
                shift_id,
                latitude: lat,
                longitude: lon,
                accuracy: update.accuracy,
                battery_level: update.battery_level,
                speed: update.speed,
                is_moving,
                recorded_at: effective_at,
                geofence_status,
                is_tracking_active: active_shift.is_some(),
            })
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.error_log
                    .log(
                        "location-ingest",
                        "persist",
                        &e.to_string(),
                        Some(user.id),
                        serde_json::json!({ "isBackground": is_background }),
                    )
                    .await;
                self.retry.schedule(user.id, update, &e.to_string()).await;
                let next_interval = self.next_interval(user, update, containment.inside, company.as_ref()).await;
                return Ok(IngestAck {
                    success: false,
                    location_id: None,
                    timestamp: Utc::now(),
                    error_code: Some("STORAGE_UNAVAILABLE".into()),
                    warning,
                    geofence_status,
                    next_interval_ms: next_interval.as_millis() as u64,
                });
            }
        };

        // The sample is durable; everything below is enrichment and must
        // not fail the request.
        self.retry.clear_attempts(user.id).await;
        self.metrics.ingested.fetch_add(1, Ordering::Relaxed);

        if let (Some(shift), Some(bucket)) = (&active_shift, bucket) {
            let point = crate::models::TrackPoint { lat, lon, ts: effective_at };
            if let Err(e) = self.store.shifts.append_point(shift.id, bucket, point).await {
                warn!(error = %e, "history_append_failed");
            }
        }

        let live = build_live_location(user, record.latitude, record.longitude, update, effective_at, active_shift.is_some());
        if let Ok(json) = serde_json::to_string(&live) {
            self.cache
                .set(&format!("lastLocation:{}", user.id), &json, Some(LAST_LOCATION_TTL))
                .await;
        }

        self.observe_fences(user, &fences, lat, lon, shift_id, effective_at).await;

        self.analytics
            .record_sample(user.id, lat, lon, effective_at, update.accuracy, update.speed)
            .await;

        self.broadcaster.broadcast_location(user, &live);

        let next_interval = self.next_interval(user, update, containment.inside, company.as_ref()).await;
        debug!(user_id = user.id, location_id = record.id, "sample_ingested");
        Ok(IngestAck {
            success: true,
            location_id: Some(record.id),
            timestamp: record.received_at,
            error_code: None,
            warning,
            geofence_status,
            next_interval_ms: next_interval.as_millis() as u64,
        })
    }

    /// Run the hysteresis machine for every fence and record confirmed
    /// transitions. Event rows reference the active shift; without one the
    /// state still advances but nothing is written.
    async fn observe_fences(
        &self,
        user: &UserRecord,
        fences: &[crate::models::GeofenceRecord],
        lat: f64,
        lon: f64,
        shift_id: Option<i64>,
        at: chrono::DateTime<Utc>,
    ) {
        for fence in fences {
            let now_inside = fence.contains(lat, lon);
            let Some(transition) = self.hysteresis.observe(user.id, fence.id, now_inside, at).await
            else {
                continue;
            };
            self.metrics.geofence_transitions.fetch_add(1, Ordering::Relaxed);
            info!(
                user_id = user.id,
                geofence_id = fence.id,
                ?transition,
                "geofence_transition_confirmed"
            );
            if shift_id.is_none() {
                continue;
            }
            let event_type = match transition {
                Transition::Entered => GeofenceEventType::Entry,
                Transition::Exited => GeofenceEventType::Exit,
            };
            if let Err(e) = self
                .store
                .geofences
                .insert_event(user.id, fence.id, shift_id, event_type, at)
                .await
            {
                warn!(error = %e, "geofence_event_write_failed");
            }
        }
    }

    async fn next_interval(
        &self,
        user: &UserRecord,
        update: &LocationUpdate,
        in_geofence: bool,
        company: Option<&CompanyRecord>,
    ) -> Duration {
        self.battery
            .next_interval(
                user.id,
                PolicyInput {
                    battery_pct: update.battery_level,
                    is_charging: update.is_charging.unwrap_or(false),
                    speed_mps: update.speed,
                    in_geofence,
                },
                company,
            )
            .await
    }

    /// Replay a queued payload from the retry drain. Validation failures
    /// drop the payload for good; a persistence failure re-queues it
    /// through the normal path.
    pub async fn reprocess(&self, record: RetryRecord) {
        let user = match self.store.users.find_by_id(record.user_id).await {
            Ok(Some(u)) => u,
            Ok(None) => {
                warn!(user_id = record.user_id, "retry_user_gone");
                return;
            }
            Err(e) => {
                // Storage still down: put it back on the schedule.
                self.retry.schedule(record.user_id, &record.payload, &e.to_string()).await;
                return;
            }
        };
        let is_background = record.payload.is_background.unwrap_or(false);
        let result = self.run_pipeline(&user, &record.payload, is_background).await;
        match result {
            Ok(ack) if ack.success => {
                self.retry.clear_attempts(record.user_id).await;
                debug!(user_id = record.user_id, "retry_reprocessed");
            }
            Ok(_) => {
                // Non-success ack means schedule() already re-queued it.
            }
            Err(e) => {
                info!(user_id = record.user_id, error = %e, "retry_payload_rejected");
            }
        }
    }

    /// Snapshot of the user's cached last location, if still warm.
    pub async fn last_location(&self, user_id: i64) -> Option<LiveLocation> {
        let cached = self.cache.get(&format!("lastLocation:{user_id}")).await?;
        serde_json::from_str(&cached).ok()
    }

    /// Socket disconnect: release the per-user smoothing state owned by
    /// the connection.
    pub fn release_smoother(&self, user_id: i64) {
        self.smoother.release(user_id);
    }

    /// Live filter count, surfaced on `/metrics`.
    pub fn smoother_len(&self) -> usize {
        self.smoother.len()
    }

    pub fn bucket_of(user: &UserRecord) -> Option<ShiftBucket> {
        user.role.shift_bucket()
    }
}

fn build_live_location(
    user: &UserRecord,
    lat: f64,
    lon: f64,
    update: &LocationUpdate,
    at: chrono::DateTime<Utc>,
    is_active: bool,
) -> LiveLocation {
    LiveLocation {
        employee: LiveEmployee {
            id: user.id,
            name: user.name.clone(),
            employee_number: user.employee_number.clone(),
            department: user.department.clone(),
            designation: user.designation.clone(),
            device_info: None,
        },
        location: LivePoint {
            latitude: lat,
            longitude: lon,
            accuracy: update.accuracy,
            timestamp: at,
            battery_level: update.battery_level,
            is_moving: update
                .is_moving
                .unwrap_or_else(|| update.speed.is_some_and(|s| s > crate::battery::MOVING_SPEED_MPS)),
        },
        is_active,
        last_updated: Utc::now(),
    }
}
