//! Push and in-app notification fan-out.
//!
//! Each recipient gets an in-app row plus a push to every active device
//! token, dispatched to the Expo push API in chunks. A dead token reported
//! by the provider is deactivated on the spot; a failed recipient never
//! aborts the rest of the batch.

use crate::metrics::Metrics;
use crate::models::{Notification, Role};
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Expo accepts at most this many messages per request.
pub const PUSH_CHUNK_SIZE: usize = 100;
const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";
const PUSH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushTicket {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<TicketDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketDetails {
    #[serde(default)]
    pub error: Option<String>,
}

impl PushTicket {
    /// The provider says this token no longer reaches a device.
    pub fn is_device_gone(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.error.as_deref())
            .is_some_and(|e| e == "DeviceNotRegistered")
    }
}

/// Seam over the remote push provider so dispatch logic is testable and a
/// credential-less deployment can run with a logging stub.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// One ticket per message, in order.
    async fn send_chunk(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, String>;
}

pub struct ExpoTransport {
    client: reqwest::Client,
    access_token: Option<String>,
}

impl ExpoTransport {
    pub fn new(access_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, access_token }
    }
}

#[derive(Deserialize)]
struct ExpoResponse {
    data: Vec<PushTicket>,
}

#[async_trait]
impl PushTransport for ExpoTransport {
    async fn send_chunk(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, String> {
        let mut request = self.client.post(EXPO_PUSH_URL).json(messages);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("expo push returned {status}"));
        }
        let body: ExpoResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(body.data)
    }
}

/// Stands in when no push credentials are configured: in-app rows are
/// still written, pushes are logged and dropped.
pub struct NoopTransport;

#[async_trait]
impl PushTransport for NoopTransport {
    async fn send_chunk(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, String> {
        info!(count = messages.len(), "push_dispatch_skipped_no_credentials");
        Ok(messages
            .iter()
            .map(|_| PushTicket { status: "ok".into(), message: None, details: None })
            .collect())
    }
}

/// Map notification priority to per-platform delivery hints.
pub fn build_message(token: &str, platform: &str, n: &Notification) -> PushMessage {
    PushMessage {
        to: token.to_string(),
        title: n.title.clone(),
        body: n.message.clone(),
        data: n.data.clone(),
        priority: if n.priority == "high" { "high".into() } else { "default".into() },
        sound: if platform == "ios" { Some("default".into()) } else { None },
    }
}

pub struct NotificationDispatcher {
    store: Store,
    transport: Arc<dyn PushTransport>,
    metrics: Arc<Metrics>,
}

impl NotificationDispatcher {
    pub fn new(store: Store, transport: Arc<dyn PushTransport>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self { store, transport, metrics })
    }

    /// Deliver to one user.
    pub async fn send_to_user(&self, user_id: i64, notification: &Notification) {
        self.send_to_users(&[user_id], notification).await;
    }

    /// Deliver to many users; failures are isolated per recipient.
    pub async fn send_to_users(&self, user_ids: &[i64], notification: &Notification) {
        for &user_id in user_ids {
            if let Err(e) = self.deliver_one(user_id, notification).await {
                warn!(user_id, error = %e, "notification_delivery_failed");
            }
        }
    }

    async fn deliver_one(&self, user_id: i64, notification: &Notification) -> Result<(), String> {
        self.store
            .notifications
            .insert_in_app(user_id, notification)
            .await
            .map_err(|e| e.to_string())?;

        let tokens = self
            .store
            .tokens
            .active_for_users(&[user_id])
            .await
            .map_err(|e| e.to_string())?;
        if tokens.is_empty() {
            return Ok(());
        }

        let messages: Vec<PushMessage> = tokens
            .iter()
            .map(|t| build_message(&t.token, &t.platform, notification))
            .collect();

        let mut all_sent = true;
        let mut provider_error = None;
        for chunk in messages.chunks(PUSH_CHUNK_SIZE) {
            match self.transport.send_chunk(chunk).await {
                Ok(tickets) => {
                    for (message, ticket) in chunk.iter().zip(tickets.iter()) {
                        if ticket.is_device_gone() {
                            if let Err(e) = self.store.tokens.deactivate(&message.to).await {
                                warn!(error = %e, "token_deactivate_failed");
                            } else {
                                self.metrics
                                    .push_tokens_deactivated
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                        } else if ticket.status != "ok" {
                            all_sent = false;
                            provider_error = ticket.message.clone();
                        }
                    }
                }
                Err(e) => {
                    all_sent = false;
                    provider_error = Some(e);
                }
            }
        }

        let touched: Vec<String> = tokens.iter().map(|t| t.token.clone()).collect();
        if let Err(e) = self.store.tokens.touch(&touched).await {
            warn!(error = %e, "token_touch_failed");
        }

        if let Err(e) = self
            .store
            .notifications
            .insert_push_audit(user_id, notification, all_sent, Utc::now(), provider_error.as_deref())
            .await
        {
            warn!(error = %e, "push_audit_failed");
        }
        self.metrics.notifications_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Company-wide delivery to every active holder of `role`.
    pub async fn send_role_notification(
        &self,
        from_user_id: i64,
        company_id: i64,
        role: Role,
        notification: &Notification,
        exclude_sender: bool,
    ) {
        let recipients = match self.store.users.find_by_role(company_id, role).await {
            Ok(users) => users,
            Err(e) => {
                warn!(company_id, role = role.as_str(), error = %e, "role_recipient_lookup_failed");
                return;
            }
        };
        let ids: Vec<i64> = recipients
            .iter()
            .map(|u| u.id)
            .filter(|&id| !(exclude_sender && id == from_user_id))
            .collect();
        self.send_to_users(&ids, notification).await;
    }

    /// Delivery to every employee under one group admin.
    pub async fn send_group_notification(
        &self,
        _from_user_id: i64,
        group_admin_id: i64,
        notification: &Notification,
    ) {
        let recipients = match self.store.users.find_subordinates(group_admin_id).await {
            Ok(users) => users,
            Err(e) => {
                warn!(group_admin_id, error = %e, "group_recipient_lookup_failed");
                return;
            }
        };
        let ids: Vec<i64> = recipients.iter().map(|u| u.id).collect();
        self.send_to_users(&ids, notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(priority: &str) -> Notification {
        Notification {
            id: None,
            title: "Shift Ending Soon".into(),
            message: "Your shift ends in 5 minutes".into(),
            kind: "shift-reminder".into(),
            priority: priority.into(),
            data: serde_json::json!({ "minutesRemaining": 5 }),
        }
    }

    #[test]
    fn test_build_message_platform_hints() {
        let n = notification("high");
        let ios = build_message("ExponentPushToken[a]", "ios", &n);
        assert_eq!(ios.priority, "high");
        assert_eq!(ios.sound.as_deref(), Some("default"));

        let android = build_message("ExponentPushToken[b]", "android", &n);
        assert!(android.sound.is_none());

        let low = build_message("t", "android", &notification("default"));
        assert_eq!(low.priority, "default");
    }

    #[test]
    fn test_ticket_device_gone_detection() {
        let gone: PushTicket = serde_json::from_value(serde_json::json!({
            "status": "error",
            "message": "device not registered",
            "details": { "error": "DeviceNotRegistered" }
        }))
        .unwrap();
        assert!(gone.is_device_gone());

        let ok: PushTicket = serde_json::from_value(serde_json::json!({ "status": "ok" })).unwrap();
        assert!(!ok.is_device_gone());

        let other: PushTicket = serde_json::from_value(serde_json::json!({
            "status": "error",
            "details": { "error": "MessageTooBig" }
        }))
        .unwrap();
        assert!(!other.is_device_gone());
    }

    #[tokio::test]
    async fn test_noop_transport_acks_everything() {
        let n = notification("default");
        let messages = vec![
            build_message("a", "ios", &n),
            build_message("b", "android", &n),
        ];
        let tickets = NoopTransport.send_chunk(&messages).await.unwrap();
        assert_eq!(tickets.len(), 2);
        assert!(tickets.iter().all(|t| t.status == "ok"));
    }

    #[test]
    fn test_chunking_boundaries() {
        let n = notification("default");
        let messages: Vec<PushMessage> =
            (0..250).map(|i| build_message(&format!("t{i}"), "android", &n)).collect();
        let chunks: Vec<_> = messages.chunks(PUSH_CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }
}
