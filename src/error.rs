use crate::types::{InviteId, InviteState, UserId};

/// Errors raised by the lobby protocol.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    /// Presence channel failed to subscribe or timed out.
    #[error("presence channel error: {0}")]
    Transport(String),

    /// The invite already left `pending`; someone else decided first.
    #[error("invite {invite_id} is already {state}")]
    Stale { invite_id: InviteId, state: InviteState },

    #[error("user {user_id} may not {action} invite {invite_id}")]
    NotParticipant {
        user_id: UserId,
        invite_id: InviteId,
        action: &'static str,
    },

    #[error("invite {0} not found")]
    NotFound(InviteId),

    #[error("cannot challenge yourself")]
    SelfChallenge,

    /// Insert or update rejected by the store.
    #[error("store write failed: {0}")]
    Write(String),

    /// Read from the store failed.
    #[error("store lookup failed: {0}")]
    Lookup(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LobbyError {
    /// Conflicts are surfaced as no-ops, never as failures.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

pub type Result<T> = std::result::Result<T, LobbyError>;
