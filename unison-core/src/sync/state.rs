//! Session State Management

use serde::{Deserialize, Serialize};

/// Role of a participant within a session. Fixed for the lifetime of a
/// membership: only the host may emit authoritative playback/playlist
/// mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Listener,
}

impl Role {
    pub fn is_host(&self) -> bool {
        matches!(self, Role::Host)
    }
}

/// State of an active session membership
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session identifier shared with other participants
    pub session_id: String,
    /// Our role, assigned at create/join
    pub role: Role,
    /// Number of participants including ourselves
    pub participant_count: u32,
}

impl SessionState {
    pub fn new(session_id: String, role: Role, participant_count: u32) -> Self {
        Self {
            session_id,
            role,
            participant_count,
        }
    }

    /// Check if we are the host
    pub fn is_host(&self) -> bool {
        self.role.is_host()
    }
}

/// Represents the session we're in (or not)
#[derive(Debug, Default)]
pub enum Membership {
    /// Not in any session
    #[default]
    None,
    /// Creating a session (waiting for the relay's answer)
    Creating,
    /// Joining a session (waiting for the relay's answer)
    Joining { session_id: String },
    /// In an active session
    Active(SessionState),
}

impl Membership {
    /// Check if we're in an active session
    pub fn is_active(&self) -> bool {
        matches!(self, Membership::Active(_))
    }

    /// Check if we're in any session-related state (creating, joining, active)
    pub fn is_busy(&self) -> bool {
        !matches!(self, Membership::None)
    }

    /// Get the active session state if we're in one
    pub fn state(&self) -> Option<&SessionState> {
        match self {
            Membership::Active(state) => Some(state),
            _ => None,
        }
    }

    /// Get mutable reference to the active session state
    pub fn state_mut(&mut self) -> Option<&mut SessionState> {
        match self {
            Membership::Active(state) => Some(state),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_transitions() {
        let mut membership = Membership::None;
        assert!(!membership.is_busy());

        membership = Membership::Joining {
            session_id: "ABCDEFGH".to_string(),
        };
        assert!(membership.is_busy());
        assert!(!membership.is_active());
        assert!(membership.state().is_none());

        membership = Membership::Active(SessionState::new(
            "ABCDEFGH".to_string(),
            Role::Listener,
            2,
        ));
        assert!(membership.is_active());
        assert!(!membership.state().unwrap().is_host());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "\"host\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"listener\"").unwrap(),
            Role::Listener
        );
    }
}
