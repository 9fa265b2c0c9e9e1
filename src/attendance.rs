//! Outbound client for the Sparrow attendance API.
//!
//! The bridge never propagates errors: every call resolves to an outcome
//! envelope the shift engine can log and attach to notifications. Network
//! faults and 5xx responses are retried on the shared backoff schedule;
//! 4xx responses are terminal.

use crate::error::is_recoverable_noise;
use crate::retry::retry_with_backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SparrowErrorType {
    Cooldown,
    Roster,
    Schedule,
    Validation,
    Network,
    Api,
    Unknown,
}

/// Classify a Sparrow error message by its wording. The API reports
/// business failures as free text; these substrings are the stable parts.
pub fn classify_error(message: &str) -> SparrowErrorType {
    let lower = message.to_lowercase();
    if lower.contains("cooldown") || lower.contains("too soon") {
        SparrowErrorType::Cooldown
    } else if lower.contains("roster") || lower.contains("not assigned") {
        SparrowErrorType::Roster
    } else if lower.contains("schedule") || lower.contains("shift not") {
        SparrowErrorType::Schedule
    } else if lower.contains("invalid") || lower.contains("validation") || lower.contains("required")
    {
        SparrowErrorType::Validation
    } else if is_recoverable_noise(&lower) || lower.contains("network") || lower.contains("dns") {
        SparrowErrorType::Network
    } else if lower.contains("api") || lower.contains("server error") {
        SparrowErrorType::Api
    } else {
        SparrowErrorType::Unknown
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparrow_errors: Option<Vec<String>>,
    pub error_type: Option<SparrowErrorType>,
    pub status_code: Option<u16>,
    pub should_retry: bool,
}

impl PunchOutcome {
    fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            sparrow_errors: None,
            error_type: None,
            status_code: Some(200),
            should_retry: false,
        }
    }

    fn failed(
        errors: Vec<String>,
        error_type: SparrowErrorType,
        status_code: Option<u16>,
        should_retry: bool,
    ) -> Self {
        Self {
            success: false,
            data: None,
            sparrow_errors: Some(errors),
            error_type: Some(error_type),
            status_code,
            should_retry,
        }
    }
}

/// Terminal vs retryable, from the HTTP status alone.
pub fn status_disposition(status: u16) -> (SparrowErrorType, bool) {
    match status {
        500..=599 => (SparrowErrorType::Api, true),
        400..=499 => (SparrowErrorType::Validation, false),
        _ => (SparrowErrorType::Unknown, false),
    }
}

#[derive(Serialize)]
struct PunchRequest<'a> {
    employee_codes: &'a [String],
}

#[derive(Deserialize)]
struct PunchResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<String>,
}

pub struct AttendanceBridge {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl AttendanceBridge {
    pub fn new(endpoint: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }

    /// Record a punch for the given employee codes.
    pub async fn punch(&self, employee_codes: &[String]) -> PunchOutcome {
        let Some(endpoint) = &self.endpoint else {
            return PunchOutcome::failed(
                vec!["attendance endpoint not configured".into()],
                SparrowErrorType::Api,
                None,
                false,
            );
        };
        if employee_codes.is_empty() {
            return PunchOutcome::ok(None);
        }

        let result = retry_with_backoff(
            || self.punch_once(endpoint, employee_codes),
            RETRY_BASE,
            RETRY_MAX,
            ATTEMPTS,
            |outcome: &PunchOutcome| outcome.should_retry,
        )
        .await;

        // The closure returns Err only for retry accounting; both arms
        // carry the same envelope type.
        match result {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn punch_once(
        &self,
        endpoint: &str,
        employee_codes: &[String],
    ) -> Result<PunchOutcome, PunchOutcome> {
        let response = self
            .client
            .post(endpoint)
            .json(&PunchRequest { employee_codes })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "sparrow_request_failed");
                return Err(PunchOutcome::failed(
                    vec![e.to_string()],
                    SparrowErrorType::Network,
                    None,
                    true,
                ));
            }
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            let (error_type, should_retry) = status_disposition(status);
            warn!(status, body = %body, "sparrow_http_error");
            let outcome =
                PunchOutcome::failed(vec![body], error_type, Some(status), should_retry);
            return if should_retry { Err(outcome) } else { Ok(outcome) };
        }

        match response.json::<PunchResponse>().await {
            Ok(body) => {
                if !body.errors.is_empty() || body.success == Some(false) {
                    let error_type = body
                        .errors
                        .first()
                        .map(|m| classify_error(m))
                        .unwrap_or(SparrowErrorType::Unknown);
                    info!(?error_type, "sparrow_punch_rejected");
                    // Business rejections are final; retrying re-triggers
                    // the same rule.
                    Ok(PunchOutcome::failed(body.errors, error_type, Some(status), false))
                } else {
                    Ok(PunchOutcome::ok(body.data))
                }
            }
            Err(e) => Err(PunchOutcome::failed(
                vec![format!("malformed response: {e}")],
                SparrowErrorType::Api,
                Some(status),
                true,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_business_errors() {
        assert_eq!(classify_error("Punch rejected: cooldown period active"), SparrowErrorType::Cooldown);
        assert_eq!(classify_error("Employee not assigned to roster"), SparrowErrorType::Roster);
        assert_eq!(classify_error("No shift scheduled for today"), SparrowErrorType::Schedule);
        assert_eq!(classify_error("Invalid employee code"), SparrowErrorType::Validation);
        assert_eq!(classify_error("network unreachable"), SparrowErrorType::Network);
        assert_eq!(classify_error("ETIMEDOUT while connecting"), SparrowErrorType::Network);
        assert_eq!(classify_error("internal server error (api)"), SparrowErrorType::Api);
        assert_eq!(classify_error("something inexplicable"), SparrowErrorType::Unknown);
    }

    #[test]
    fn test_status_disposition() {
        assert_eq!(status_disposition(503), (SparrowErrorType::Api, true));
        assert_eq!(status_disposition(500), (SparrowErrorType::Api, true));
        assert_eq!(status_disposition(400), (SparrowErrorType::Validation, false));
        assert_eq!(status_disposition(404), (SparrowErrorType::Validation, false));
    }

    #[tokio::test]
    async fn test_unconfigured_bridge_returns_envelope() {
        let bridge = AttendanceBridge::new(None);
        let outcome = bridge.punch(&["E-100".into()]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_type, Some(SparrowErrorType::Api));
        assert!(!outcome.should_retry);
    }

    #[tokio::test]
    async fn test_empty_codes_short_circuit() {
        let bridge = AttendanceBridge::new(Some("http://sparrow.invalid/punch".into()));
        let outcome = bridge.punch(&[]).await;
        assert!(outcome.success);
    }
}
