//! Per-user presence derived from live connections.
//!
//! A user is online iff at least one connection is bound to them. The
//! user -> connections relation lives here and nowhere else, so "online" is
//! always computed from the same set the registry mutates. Transitions are
//! published synchronously, inside the same per-user critical section that
//! changed the set, so online/offline events for one user can never be
//! observed out of order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::{ConnectionId, UserId};
use crate::metrics::PresenceMetrics;

/// Capacity of the presence event channel. Lagging observers skip events.
const PRESENCE_EVENT_CAPACITY: usize = 1024;

/// One presence edge: 0 -> 1 connections (online) or 1 -> 0 (offline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceStats {
    pub online_users: usize,
    pub online_transitions: u64,
    pub offline_transitions: u64,
}

pub struct PresenceTracker {
    /// user_id -> Set<connection_id> (supports multiple devices)
    user_index: DashMap<UserId, HashSet<ConnectionId>>,
    events: broadcast::Sender<PresenceChange>,
    online_transitions: AtomicU64,
    offline_transitions: AtomicU64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PRESENCE_EVENT_CAPACITY);
        Self {
            user_index: DashMap::new(),
            events,
            online_transitions: AtomicU64::new(0),
            offline_transitions: AtomicU64::new(0),
        }
    }

    /// Observe presence transitions as they happen
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.events.subscribe()
    }

    /// Record a newly bound connection. Returns the change if the user just came online.
    #[cfg(test)]
    pub(crate) fn add_connection(&self, user_id: &str, connection_id: ConnectionId) -> Option<PresenceChange> {
        self.try_add_connection(user_id, connection_id, usize::MAX, |_| {})
            .unwrap_or_default()
    }

    /// Record a newly bound connection, refusing when the user already holds
    /// `max` connections. Returns the change if the user just came online.
    ///
    /// The check and the insert happen under the same entry lock, and so does
    /// `on_change` when the user comes online. On refusal returns the user's
    /// current connection count.
    pub(crate) fn try_add_connection(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        max: usize,
        on_change: impl FnOnce(&PresenceChange),
    ) -> Result<Option<PresenceChange>, usize> {
        let mut connections = self.user_index.entry(user_id.to_string()).or_default();
        if connections.contains(&connection_id) {
            return Ok(None);
        }
        if connections.len() >= max {
            let current = connections.len();
            let now_empty = connections.is_empty();
            drop(connections);
            if now_empty {
                self.user_index.remove_if(user_id, |_, set| set.is_empty());
            }
            return Err(current);
        }

        let was_offline = connections.is_empty();
        connections.insert(connection_id);

        if !was_offline {
            return Ok(None);
        }

        let change = PresenceChange {
            user_id: user_id.to_string(),
            online: true,
        };
        self.publish(&change);
        on_change(&change);
        Ok(Some(change))
    }

    /// Drop a closed connection. Returns the change if it was the user's last one.
    ///
    /// `on_change` runs under the entry lock, before another connection of
    /// the same user can be added.
    pub(crate) fn remove_connection(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        on_change: impl FnOnce(&PresenceChange),
    ) -> Option<PresenceChange> {
        let mut change = None;

        self.user_index.remove_if_mut(user_id, |_, connections| {
            if !connections.remove(&connection_id) || !connections.is_empty() {
                return false;
            }
            let offline = PresenceChange {
                user_id: user_id.to_string(),
                online: false,
            };
            self.publish(&offline);
            on_change(&offline);
            change = Some(offline);
            true
        });

        change
    }

    fn publish(&self, change: &PresenceChange) {
        if change.online {
            self.online_transitions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.offline_transitions.fetch_add(1, Ordering::Relaxed);
        }
        PresenceMetrics::record_transition(change.online);

        tracing::info!(user_id = %change.user_id, online = change.online, "Presence changed");

        // No receivers is fine
        let _ = self.events.send(change.clone());
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.user_index
            .get(user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }

    pub fn online_user_ids(&self) -> HashSet<UserId> {
        self.user_index
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connections_for_user(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.user_index
            .get(user_id)
            .map(|connections| connections.clone())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.user_index
            .get(user_id)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn online_count(&self) -> usize {
        self.user_index.len()
    }

    pub fn stats(&self) -> PresenceStats {
        PresenceStats {
            online_users: self.online_count(),
            online_transitions: self.online_transitions.load(Ordering::Relaxed),
            offline_transitions: self.offline_transitions.load(Ordering::Relaxed),
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn drain(rx: &mut broadcast::Receiver<PresenceChange>) -> Vec<PresenceChange> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_first_connection_goes_online() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();

        let change = tracker.add_connection("alice", Uuid::new_v4());
        assert_eq!(change, Some(PresenceChange { user_id: "alice".into(), online: true }));
        assert!(tracker.is_online("alice"));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_second_device_does_not_reannounce() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(tracker.add_connection("alice", c1).is_some());
        assert!(tracker.add_connection("alice", c2).is_none());
        assert_eq!(tracker.connection_count("alice"), 2);

        // First device leaves: still online, no event
        assert!(tracker.remove_connection("alice", c1, |_| {}).is_none());
        assert!(tracker.is_online("alice"));

        // Last device leaves: exactly one offline event
        let change = tracker.remove_connection("alice", c2, |_| {});
        assert_eq!(change, Some(PresenceChange { user_id: "alice".into(), online: false }));
        assert!(!tracker.is_online("alice"));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                PresenceChange { user_id: "alice".into(), online: true },
                PresenceChange { user_id: "alice".into(), online: false },
            ]
        );
    }

    #[test]
    fn test_removing_unknown_connection_is_noop() {
        let tracker = PresenceTracker::new();
        let c1 = Uuid::new_v4();
        tracker.add_connection("alice", c1);

        assert!(tracker.remove_connection("alice", Uuid::new_v4(), |_| {}).is_none());
        assert!(tracker.remove_connection("bob", c1, |_| {}).is_none());
        assert!(tracker.is_online("alice"));

        assert!(tracker.remove_connection("alice", c1, |_| {}).is_some());
        // Duplicate close
        assert!(tracker.remove_connection("alice", c1, |_| {}).is_none());
    }

    #[test]
    fn test_reconnect_cycles_emit_one_event_per_edge() {
        let tracker = PresenceTracker::new();

        for _ in 0..3 {
            let c = Uuid::new_v4();
            tracker.add_connection("alice", c);
            tracker.add_connection("alice", Uuid::new_v4());
            tracker.remove_connection("alice", c, |_| {});
            let remaining: Vec<_> = tracker.connections_for_user("alice").into_iter().collect();
            for id in remaining {
                tracker.remove_connection("alice", id, |_| {});
            }
        }

        let stats = tracker.stats();
        assert_eq!(stats.online_transitions, 3);
        assert_eq!(stats.offline_transitions, 3);
        assert_eq!(stats.online_users, 0);
    }

    #[test]
    fn test_change_hook_runs_once_per_edge() {
        let tracker = PresenceTracker::new();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut seen = Vec::new();

        tracker
            .try_add_connection("alice", c1, usize::MAX, |change| seen.push(change.clone()))
            .unwrap();
        tracker
            .try_add_connection("alice", c2, usize::MAX, |change| seen.push(change.clone()))
            .unwrap();
        tracker.remove_connection("alice", c1, |change| seen.push(change.clone()));
        tracker.remove_connection("alice", c2, |change| seen.push(change.clone()));
        // Refused adds never report an edge
        let _ = tracker.try_add_connection("bob", c1, 0, |change| seen.push(change.clone()));

        assert_eq!(
            seen,
            vec![
                PresenceChange { user_id: "alice".into(), online: true },
                PresenceChange { user_id: "alice".into(), online: false },
            ]
        );
    }

    #[test]
    fn test_per_user_limit() {
        let tracker = PresenceTracker::new();
        let (c1, c2, c3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(tracker.try_add_connection("alice", c1, 2, |_| {}).unwrap().is_some());
        assert!(tracker.try_add_connection("alice", c2, 2, |_| {}).unwrap().is_none());
        assert_eq!(tracker.try_add_connection("alice", c3, 2, |_| {}), Err(2));
        // Re-adding a known connection is not counted against the limit
        assert_eq!(tracker.try_add_connection("alice", c1, 2, |_| {}), Ok(None));
        assert_eq!(tracker.connection_count("alice"), 2);

        // A zero limit never leaves an empty entry behind
        assert_eq!(tracker.try_add_connection("bob", c3, 0, |_| {}), Err(0));
        assert!(!tracker.is_online("bob"));
        assert_eq!(tracker.online_count(), 1);
    }

    #[test]
    fn test_online_user_ids() {
        let tracker = PresenceTracker::new();
        tracker.add_connection("alice", Uuid::new_v4());
        tracker.add_connection("bob", Uuid::new_v4());

        let online = tracker.online_user_ids();
        assert_eq!(online.len(), 2);
        assert!(online.contains("alice"));
        assert!(online.contains("bob"));
    }

    #[test]
    fn test_concurrent_devices_single_online_edge() {
        let tracker = std::sync::Arc::new(PresenceTracker::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.add_connection("alice", Uuid::new_v4()).is_some())
            })
            .collect();

        let edges = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|went_online| *went_online)
            .count();

        assert_eq!(edges, 1);
        assert_eq!(tracker.connection_count("alice"), 8);
    }
}
