//! Session room registry
//!
//! Tracks which client drives each session (host) and which clients follow
//! it (listeners). The registry is pure bookkeeping: sockets stay in the
//! server module, rooms only hold outbound channels.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info};
use unison_core::{Role, SessionId, WireEvent};

/// Outbound channel to one connected client
pub type ClientTx = mpsc::UnboundedSender<WireEvent>;

/// One session room
struct Room {
    /// Client currently holding write authority, if any
    host: Option<u64>,
    /// All participants including the host
    participants: HashMap<u64, ClientTx>,
}

/// Outcome of a client leaving (for participant-count broadcasts)
pub struct LeaveOutcome {
    pub session_id: String,
    pub was_host: bool,
    /// Remaining participants to notify
    pub remaining: Vec<ClientTx>,
    pub participant_count: u32,
}

/// All active session rooms
#[derive(Default)]
pub struct Registry {
    rooms: HashMap<String, Room>,
    /// client id -> session id
    memberships: HashMap<u64, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.rooms.len()
    }

    /// Create a session with the caller as host. Returns the new session id.
    pub fn create(&mut self, client_id: u64, tx: ClientTx) -> String {
        self.remove_membership(client_id);

        let session_id = loop {
            let candidate = SessionId::random();
            if !self.rooms.contains_key(candidate.as_str()) {
                break candidate.as_str().to_string();
            }
        };

        let mut participants = HashMap::new();
        participants.insert(client_id, tx);
        self.rooms.insert(
            session_id.clone(),
            Room {
                host: Some(client_id),
                participants,
            },
        );
        self.memberships.insert(client_id, session_id.clone());

        info!("Session {} created by client {}", session_id, client_id);
        session_id
    }

    /// Join an existing session. The joiner becomes a listener unless the
    /// host slot is vacant (host reconnecting after a drop), in which case
    /// authority is restored to them.
    pub fn join(
        &mut self,
        session_id: &str,
        client_id: u64,
        tx: ClientTx,
    ) -> Option<(Role, u32, Vec<ClientTx>)> {
        self.remove_membership(client_id);

        let room = self.rooms.get_mut(session_id)?;

        let role = if room.host.is_none() {
            room.host = Some(client_id);
            Role::Host
        } else {
            Role::Listener
        };

        room.participants.insert(client_id, tx);
        self.memberships.insert(client_id, session_id.to_string());

        let count = room.participants.len() as u32;
        let others = room
            .participants
            .iter()
            .filter(|(id, _)| **id != client_id)
            .map(|(_, tx)| tx.clone())
            .collect();

        info!(
            "Client {} joined session {} as {:?} ({} participants)",
            client_id, session_id, role, count
        );
        Some((role, count, others))
    }

    /// Remove a client from its session (leave event or socket drop)
    pub fn leave(&mut self, client_id: u64) -> Option<LeaveOutcome> {
        let session_id = self.memberships.remove(&client_id)?;
        let room = self.rooms.get_mut(&session_id)?;

        room.participants.remove(&client_id);
        let was_host = room.host == Some(client_id);
        if was_host {
            // Leave the slot vacant so the host can reclaim it on rejoin
            room.host = None;
        }

        if room.participants.is_empty() {
            self.rooms.remove(&session_id);
            info!("Session {} emptied and dropped", session_id);
            return Some(LeaveOutcome {
                session_id,
                was_host,
                remaining: Vec::new(),
                participant_count: 0,
            });
        }

        let remaining: Vec<ClientTx> = room.participants.values().cloned().collect();
        let participant_count = remaining.len() as u32;

        debug!(
            "Client {} left session {} ({} remain)",
            client_id, session_id, participant_count
        );
        Some(LeaveOutcome {
            session_id,
            was_host,
            remaining,
            participant_count,
        })
    }

    /// Fan-out targets for a host-originated event. Returns `None` when the
    /// sender is not the host of its session - listener-originated playback
    /// events are dropped, not forwarded.
    pub fn host_fanout(&self, client_id: u64) -> Option<Vec<ClientTx>> {
        let session_id = self.memberships.get(&client_id)?;
        let room = self.rooms.get(session_id)?;

        if room.host != Some(client_id) {
            return None;
        }

        Some(
            room.participants
                .iter()
                .filter(|(id, _)| **id != client_id)
                .map(|(_, tx)| tx.clone())
                .collect(),
        )
    }
}

impl Registry {
    fn remove_membership(&mut self, client_id: u64) {
        if self.memberships.contains_key(&client_id) {
            self.leave(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (ClientTx, mpsc::UnboundedReceiver<WireEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_create_then_join() {
        let mut registry = Registry::new();
        let (host_tx, _host_rx) = client();
        let (listener_tx, _listener_rx) = client();

        let session_id = registry.create(1, host_tx);
        assert_eq!(registry.session_count(), 1);

        let (role, count, others) = registry.join(&session_id, 2, listener_tx).unwrap();
        assert_eq!(role, Role::Listener);
        assert_eq!(count, 2);
        assert_eq!(others.len(), 1);
    }

    #[test]
    fn test_join_unknown_session() {
        let mut registry = Registry::new();
        let (tx, _rx) = client();
        assert!(registry.join("ABCDEFGH", 1, tx).is_none());
    }

    #[test]
    fn test_only_host_fans_out() {
        let mut registry = Registry::new();
        let (host_tx, _h) = client();
        let (listener_tx, _l) = client();

        let session_id = registry.create(1, host_tx);
        registry.join(&session_id, 2, listener_tx).unwrap();

        let targets = registry.host_fanout(1).unwrap();
        assert_eq!(targets.len(), 1);

        // Listener-originated playback traffic is dropped
        assert!(registry.host_fanout(2).is_none());
        // Unknown client likewise
        assert!(registry.host_fanout(99).is_none());
    }

    #[test]
    fn test_host_slot_reclaimed_on_rejoin() {
        let mut registry = Registry::new();
        let (host_tx, _h) = client();
        let (listener_tx, _l) = client();

        let session_id = registry.create(1, host_tx);
        registry.join(&session_id, 2, listener_tx).unwrap();

        // Host drops; session survives with a vacant host slot
        let outcome = registry.leave(1).unwrap();
        assert!(outcome.was_host);
        assert_eq!(outcome.participant_count, 1);
        assert!(registry.host_fanout(2).is_none());

        // Host reconnects under a new client id and regains authority
        let (host_tx2, _h2) = client();
        let (role, count, _) = registry.join(&session_id, 3, host_tx2).unwrap();
        assert_eq!(role, Role::Host);
        assert_eq!(count, 2);
        assert!(registry.host_fanout(3).is_some());
    }

    #[test]
    fn test_empty_session_is_dropped() {
        let mut registry = Registry::new();
        let (tx, _rx) = client();

        registry.create(1, tx);
        assert_eq!(registry.session_count(), 1);

        let outcome = registry.leave(1).unwrap();
        assert_eq!(outcome.participant_count, 0);
        assert_eq!(registry.session_count(), 0);
    }
}
