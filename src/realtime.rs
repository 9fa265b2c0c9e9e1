//! Live location fan-out over socket rooms.
//!
//! Every connection is pinned to its authenticated user and joined to a
//! set of rooms at registration. Broadcasting is a pure fan-out over room
//! membership with per-connection dedup, so a supervisor who is both in
//! the group room and explicitly subscribed to an employee still gets one
//! message per update.
//!
//! Outbound frames are JSON envelopes `{"event": ..., "data": ...}` pushed
//! through each connection's unbounded sender; the socket task owns the
//! actual sink.

use crate::metrics::Metrics;
use crate::models::{LiveLocation, Role, UserRecord};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Canonical outbound event for an enriched location update. The mobile
/// clients historically listened on two names; inbound handling accepts
/// both, outbound sticks to this one.
pub const LOCATION_EVENT: &str = "employee:location_update";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: impl Serialize) -> Self {
        Self {
            event: event.to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

struct Connection {
    user_id: i64,
    tx: mpsc::UnboundedSender<String>,
    rooms: HashSet<String>,
    /// Employee ids this connection explicitly subscribed to.
    watched: HashSet<i64>,
}

pub struct LiveBroadcaster {
    next_id: AtomicU64,
    conns: DashMap<u64, Connection>,
    rooms: DashMap<String, HashSet<u64>>,
    metrics: Arc<Metrics>,
}

fn room_user(id: i64) -> String {
    format!("user:{id}")
}
fn room_employee(id: i64) -> String {
    format!("employee:{id}")
}
fn room_group(group_admin_id: i64) -> String {
    format!("group:{group_admin_id}")
}
fn room_admin(admin_id: i64) -> String {
    format!("admin:{admin_id}")
}
fn room_group_admin(admin_id: i64) -> String {
    format!("group-admin:{admin_id}")
}
fn room_company(company_id: i64) -> String {
    format!("company:{company_id}")
}

impl LiveBroadcaster {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            conns: DashMap::new(),
            rooms: DashMap::new(),
            metrics,
        })
    }

    /// Register an authenticated connection and join its standing rooms.
    /// Returns the connection id and the frame stream for the socket task.
    pub fn register(&self, user: &UserRecord) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Every connection sits in its own room and the company room;
        // supervisors additionally get their per-admin rooms (both
        // historical names) and the global admin room.
        let mut rooms = vec![room_user(user.id), room_company(user.company_id)];
        if let Some(gid) = user.group_admin_id {
            rooms.push(room_group(gid));
        }
        match user.role {
            Role::GroupAdmin => {
                rooms.push(room_admin(user.id));
                rooms.push(room_group_admin(user.id));
                rooms.push("admin".to_string());
            }
            Role::Management | Role::SuperAdmin => {
                rooms.push("admin".to_string());
            }
            Role::Employee => {}
        }

        self.conns.insert(
            conn_id,
            Connection {
                user_id: user.id,
                tx,
                rooms: rooms.iter().cloned().collect(),
                watched: HashSet::new(),
            },
        );
        for room in rooms {
            self.rooms.entry(room).or_default().insert(conn_id);
        }
        self.metrics.socket_connections.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, user_id = user.id, "socket_registered");
        (conn_id, rx)
    }

    pub fn unregister(&self, conn_id: u64) {
        if let Some((_, conn)) = self.conns.remove(&conn_id) {
            for room in &conn.rooms {
                if let Some(mut members) = self.rooms.get_mut(room) {
                    members.remove(&conn_id);
                }
            }
            self.metrics.socket_disconnections.fetch_add(1, Ordering::Relaxed);
            info!(conn_id, user_id = conn.user_id, "socket_unregistered");
        }
    }

    /// Subscribe `conn_id` to the given (already authorized) employee ids.
    pub fn subscribe_employees(&self, conn_id: u64, employee_ids: &[i64]) {
        let Some(mut conn) = self.conns.get_mut(&conn_id) else { return };
        for &id in employee_ids {
            let room = room_employee(id);
            conn.rooms.insert(room.clone());
            conn.watched.insert(id);
            self.rooms.entry(room).or_default().insert(conn_id);
        }
    }

    pub fn unsubscribe_employees(&self, conn_id: u64, employee_ids: &[i64]) {
        let Some(mut conn) = self.conns.get_mut(&conn_id) else { return };
        for &id in employee_ids {
            let room = room_employee(id);
            conn.rooms.remove(&room);
            conn.watched.remove(&id);
            if let Some(mut members) = self.rooms.get_mut(&room) {
                members.remove(&conn_id);
            }
        }
    }

    /// Send one envelope to a single connection.
    pub fn emit(&self, conn_id: u64, envelope: &Envelope) {
        if let Some(conn) = self.conns.get(&conn_id) {
            let _ = conn.tx.send(envelope.to_frame());
        }
    }

    /// Fan an accepted update out to everyone allowed to see it.
    pub fn broadcast_location(&self, user: &UserRecord, live: &LiveLocation) {
        // The peer group room is for group-wide notices, not location
        // frames; the supervisor path is their admin rooms.
        let mut targets = vec![
            room_user(user.id),
            room_employee(user.id),
            room_company(user.company_id),
        ];
        if let Some(gid) = user.group_admin_id {
            targets.push(room_admin(gid));
            targets.push(room_group_admin(gid));
        }

        let mut recipients: HashSet<u64> = HashSet::new();
        for room in &targets {
            if let Some(members) = self.rooms.get(room) {
                recipients.extend(members.iter());
            }
        }
        if recipients.is_empty() {
            return;
        }

        let frame = Envelope::new(LOCATION_EVENT, live).to_frame();
        let mut delivered = 0u64;
        for conn_id in recipients {
            if let Some(conn) = self.conns.get(&conn_id) {
                if conn.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        self.metrics.broadcasts.fetch_add(delivered, Ordering::Relaxed);
        debug!(user_id = user.id, delivered, "location_broadcast");
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LiveEmployee, LivePoint};
    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn user(id: i64, role: Role, company: i64, group_admin: Option<i64>) -> UserRecord {
        UserRecord {
            id,
            name: format!("user-{id}"),
            email: format!("u{id}@example.com"),
            role,
            company_id: company,
            group_admin_id: group_admin,
            management_id: None,
            employee_number: Some(format!("E-{id}")),
            department: None,
            designation: None,
            can_override_geofence: false,
        }
    }

    fn live(id: i64) -> LiveLocation {
        LiveLocation {
            employee: LiveEmployee {
                id,
                name: format!("user-{id}"),
                employee_number: None,
                department: None,
                designation: None,
                device_info: None,
            },
            location: LivePoint {
                latitude: 12.97,
                longitude: 77.59,
                accuracy: Some(8.0),
                timestamp: Utc::now(),
                battery_level: Some(80.0),
                is_moving: true,
            },
            is_active: true,
            last_updated: Utc::now(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_own_update_reaches_own_connection() {
        let b = LiveBroadcaster::new(Metrics::new());
        let employee = user(21, Role::Employee, 1, Some(10));
        let (_id, mut rx) = b.register(&employee);
        b.broadcast_location(&employee, &live(21));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, LOCATION_EVENT);
    }

    #[tokio::test]
    async fn test_supervisor_receives_subordinate_updates() {
        let b = LiveBroadcaster::new(Metrics::new());
        let admin = user(10, Role::GroupAdmin, 1, None);
        let employee = user(21, Role::Employee, 1, Some(10));
        let (_aid, mut admin_rx) = b.register(&admin);
        let (_eid, _emp_rx) = b.register(&employee);

        b.broadcast_location(&employee, &live(21));
        let frames = drain(&mut admin_rx);
        assert_eq!(frames.len(), 1, "supervisor should get exactly one frame");
    }

    #[tokio::test]
    async fn test_explicit_subscription_delivers_and_dedupes() {
        let b = LiveBroadcaster::new(Metrics::new());
        let admin = user(10, Role::GroupAdmin, 1, None);
        let employee = user(21, Role::Employee, 1, Some(10));
        let (admin_conn, mut admin_rx) = b.register(&admin);
        let (_eid, _emp_rx) = b.register(&employee);

        // Admin is already in admin:10; subscribing to employee:21 must
        // not double-deliver.
        b.subscribe_employees(admin_conn, &[21]);
        b.broadcast_location(&employee, &live(21));
        assert_eq!(drain(&mut admin_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_company_room_is_tenant_wide() {
        let b = LiveBroadcaster::new(Metrics::new());
        // Employee 500 reports to admin 11; admin 10 still shares the
        // company room, so tenant-wide frames reach them exactly once.
        let other_admin = user(10, Role::GroupAdmin, 1, None);
        let employee = user(500, Role::Employee, 1, Some(11));
        let (_conn, mut other_rx) = b.register(&other_admin);
        let (_eid, _emp_rx) = b.register(&employee);

        b.broadcast_location(&employee, &live(500));
        assert_eq!(drain(&mut other_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_company_room_does_not_cross_tenants() {
        let b = LiveBroadcaster::new(Metrics::new());
        let manager = user(30, Role::Management, 1, None);
        let employee = user(21, Role::Employee, 1, Some(10));
        let (_conn, mut rx) = b.register(&manager);
        let (_eid, _emp_rx) = b.register(&employee);

        b.broadcast_location(&employee, &live(21));
        assert_eq!(drain(&mut rx).len(), 1);

        // A manager of another company sees nothing.
        let foreign = user(31, Role::Management, 2, None);
        let (_f, mut foreign_rx) = b.register(&foreign);
        b.broadcast_location(&employee, &live(21));
        assert!(drain(&mut foreign_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_employee_room_delivery() {
        let b = LiveBroadcaster::new(Metrics::new());
        // Management in another group watches via explicit subscription.
        let manager = user(30, Role::Management, 1, None);
        let employee = user(21, Role::Employee, 1, Some(10));
        let (conn, mut rx) = b.register(&manager);
        let (_e, _erx) = b.register(&employee);

        b.subscribe_employees(conn, &[21]);
        b.broadcast_location(&employee, &live(21));
        let first = drain(&mut rx).len();
        assert_eq!(first, 1);

        b.unsubscribe_employees(conn, &[21]);
        b.broadcast_location(&employee, &live(21));
        // Still one frame via the company room.
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_cleans_rooms() {
        let b = LiveBroadcaster::new(Metrics::new());
        let employee = user(21, Role::Employee, 1, Some(10));
        let (conn, mut rx) = b.register(&employee);
        b.unregister(conn);
        b.broadcast_location(&employee, &live(21));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(b.connection_count(), 0);
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::new("location:ack", serde_json::json!({ "received": true }));
        let back: Envelope = serde_json::from_str(&env.to_frame()).unwrap();
        assert_eq!(back.event, "location:ack");
        assert_eq!(back.data["received"], true);
    }
}
