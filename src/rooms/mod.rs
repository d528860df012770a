//! Which connections are currently viewing which conversation.
//!
//! Both directions of the relation (room -> members, connection -> room) sit
//! behind one lock so that an implicit leave-then-join is a single atomic
//! update and a connection is never observed in two rooms.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::{ConnectionId, ConversationId};

/// Result of a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Added to the room, after leaving `previous` if it was set
    Joined { previous: Option<ConversationId> },
    /// Already a member; nothing changed
    AlreadyJoined,
}

#[derive(Default)]
struct RoomState {
    members: HashMap<ConversationId, HashSet<ConnectionId>>,
    current: HashMap<ConnectionId, ConversationId>,
}

impl RoomState {
    fn detach(&mut self, connection_id: ConnectionId, conversation_id: &str) {
        if let Some(members) = self.members.get_mut(conversation_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.members.remove(conversation_id);
            }
        }
    }
}

#[derive(Default)]
pub struct RoomIndex {
    state: RwLock<RoomState>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room, implicitly leaving the connection's current one
    pub fn join(&self, connection_id: ConnectionId, conversation_id: &str) -> JoinOutcome {
        let mut state = self.state.write();

        let previous = match state.current.get(&connection_id) {
            Some(current) if current == conversation_id => return JoinOutcome::AlreadyJoined,
            Some(current) => Some(current.clone()),
            None => None,
        };

        if let Some(ref old) = previous {
            state.detach(connection_id, old);
        }

        state
            .members
            .entry(conversation_id.to_string())
            .or_default()
            .insert(connection_id);
        state.current.insert(connection_id, conversation_id.to_string());

        tracing::debug!(
            connection_id = %connection_id,
            conversation_id = %conversation_id,
            previous = ?previous,
            "Joined conversation room"
        );

        JoinOutcome::Joined { previous }
    }

    /// Leave a room. Returns false if the connection was not in it.
    pub fn leave(&self, connection_id: ConnectionId, conversation_id: &str) -> bool {
        let mut state = self.state.write();

        match state.current.get(&connection_id) {
            Some(current) if current == conversation_id => {}
            _ => return false,
        }

        state.current.remove(&connection_id);
        state.detach(connection_id, conversation_id);

        tracing::debug!(
            connection_id = %connection_id,
            conversation_id = %conversation_id,
            "Left conversation room"
        );

        true
    }

    /// Remove a connection from whatever room it is in
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Option<ConversationId> {
        let mut state = self.state.write();
        let room = state.current.remove(&connection_id)?;
        state.detach(connection_id, &room);
        Some(room)
    }

    pub fn members_of(&self, conversation_id: &str) -> HashSet<ConnectionId> {
        self.state
            .read()
            .members
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn current_room_of(&self, connection_id: ConnectionId) -> Option<ConversationId> {
        self.state.read().current.get(&connection_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.state.read().members.len()
    }

    /// conversation_id -> number of joined connections
    pub fn room_sizes(&self) -> HashMap<ConversationId, usize> {
        self.state
            .read()
            .members
            .iter()
            .map(|(room, members)| (room.clone(), members.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_join_and_leave() {
        let rooms = RoomIndex::new();
        let c1 = Uuid::new_v4();

        assert_eq!(rooms.join(c1, "conv1"), JoinOutcome::Joined { previous: None });
        assert!(rooms.members_of("conv1").contains(&c1));
        assert_eq!(rooms.current_room_of(c1), Some("conv1".to_string()));

        assert!(rooms.leave(c1, "conv1"));
        assert!(rooms.members_of("conv1").is_empty());
        assert_eq!(rooms.current_room_of(c1), None);
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_join_other_room_is_implicit_leave() {
        let rooms = RoomIndex::new();
        let c1 = Uuid::new_v4();

        rooms.join(c1, "conv1");
        let outcome = rooms.join(c1, "conv2");

        assert_eq!(outcome, JoinOutcome::Joined { previous: Some("conv1".to_string()) });
        assert!(!rooms.members_of("conv1").contains(&c1));
        assert!(rooms.members_of("conv2").contains(&c1));
        assert_eq!(rooms.current_room_of(c1), Some("conv2".to_string()));
    }

    #[test]
    fn test_join_and_leave_are_idempotent() {
        let rooms = RoomIndex::new();
        let c1 = Uuid::new_v4();

        rooms.join(c1, "conv1");
        assert_eq!(rooms.join(c1, "conv1"), JoinOutcome::AlreadyJoined);
        assert_eq!(rooms.members_of("conv1").len(), 1);

        // Leaving a room the connection isn't in changes nothing
        assert!(!rooms.leave(c1, "conv2"));
        assert_eq!(rooms.current_room_of(c1), Some("conv1".to_string()));

        assert!(rooms.leave(c1, "conv1"));
        assert!(!rooms.leave(c1, "conv1"));
    }

    #[test]
    fn test_remove_connection() {
        let rooms = RoomIndex::new();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.join(c1, "conv1");
        rooms.join(c2, "conv1");

        assert_eq!(rooms.remove_connection(c1), Some("conv1".to_string()));
        assert_eq!(rooms.remove_connection(c1), None);
        assert_eq!(rooms.members_of("conv1").len(), 1);
        assert_eq!(rooms.room_sizes().get("conv1"), Some(&1));
    }

    #[test]
    fn test_arbitrary_sequence_keeps_single_room_invariant() {
        let rooms = RoomIndex::new();
        let c1 = Uuid::new_v4();
        let ops: &[(bool, &str)] = &[
            (true, "a"),
            (true, "b"),
            (false, "a"),
            (true, "c"),
            (true, "c"),
            (false, "c"),
            (true, "a"),
            (false, "b"),
        ];

        let mut expected: Option<&str> = None;
        for (join, room) in ops {
            if *join {
                rooms.join(c1, room);
                expected = Some(room);
            } else {
                rooms.leave(c1, room);
                if expected == Some(*room) {
                    expected = None;
                }
            }

            assert_eq!(rooms.current_room_of(c1).as_deref(), expected);
            let containing = ["a", "b", "c"]
                .iter()
                .filter(|r| rooms.members_of(r).contains(&c1))
                .count();
            assert_eq!(containing, usize::from(expected.is_some()));
        }
    }
}
