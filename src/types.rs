use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identifier issued by the auth layer.
pub type UserId = String;
/// Match invite row id.
pub type InviteId = String;

/// The only match mode this lobby coordinates.
pub const MULTIPLAYER_MODE: &str = "multiplayer";

/// Coarse presence status shown next to a player in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Idle,
    Playing,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Idle => write!(f, "idle"),
            Self::Playing => write!(f, "playing"),
        }
    }
}

/// Cosmetic VIP decorations. Never affects protocol decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VipDisplay {
    #[serde(default)]
    pub name_color: Option<String>,
    #[serde(default)]
    pub frame_color: Option<String>,
    #[serde(default)]
    pub custom_avatar: Option<String>,
}

/// Who a connected client is. Published into the presence channel on announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerIdentity {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub vip_display: VipDisplay,
    /// UI language preference, if the client has one stored locally.
    #[serde(default)]
    pub language: Option<String>,
}

/// One member of the shared presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub username: String,
    pub avatar_ref: String,
    pub status: PresenceStatus,
    pub vip_display: VipDisplay,
    pub last_seen_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn from_identity(identity: &PlayerIdentity, status: PresenceStatus) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            avatar_ref: identity.avatar_ref.clone().unwrap_or_else(|| "normal".to_string()),
            status,
            vip_display: identity.vip_display.clone(),
            last_seen_at: Utc::now(),
        }
    }
}

/// Durable state of a match invite. Only moves out of `Pending`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteState {
    Pending,
    Accepted,
    Cancelled,
}

impl InviteState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for InviteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of the game played after acceptance, owned by game-completion logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPhase {
    #[default]
    Lobby,
    Finished,
}

/// A challenge from one user to another. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchInvite {
    pub id: InviteId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub state: InviteState,
    pub mode: String,
    #[serde(default)]
    pub phase: MatchPhase,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MatchInvite {
    pub fn is_multiplayer(&self) -> bool {
        self.mode == MULTIPLAYER_MODE
    }

    /// True when the invite is between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.from_user_id == a && self.to_user_id == b)
            || (self.from_user_id == b && self.to_user_id == a)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.from_user_id == user_id || self.to_user_id == user_id
    }

    /// The other party, seen from `user_id`.
    pub fn counterpart(&self, user_id: &str) -> &str {
        if self.from_user_id == user_id {
            &self.to_user_id
        } else {
            &self.from_user_id
        }
    }
}

/// Where a match session came from, so the game surface can tell flows apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Multiplayer,
    Practice,
}

impl SessionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multiplayer => "multiplayer",
            Self::Practice => "practice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "multiplayer" => Some(Self::Multiplayer),
            "practice" => Some(Self::Practice),
            _ => None,
        }
    }
}

/// Per-client record of "we are about to enter a game".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSession {
    pub match_id: InviteId,
    pub opponent_user_id: UserId,
    pub opponent_username: String,
    pub source: SessionSource,
}

/// Which side of a pending invite the local user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteDirection {
    Sent,
    Received,
}

/// Messages sent from server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    // Presence
    Roster {
        users: Vec<PresenceEntry>,
    },
    SearchResults {
        users: Vec<PresenceEntry>,
    },
    PlayerProfile {
        user: Option<PresenceEntry>,
    },
    ConnectionError {
        message: String,
    },

    // Invite popup
    IncomingInvite {
        invite_id: InviteId,
        from_user_id: UserId,
        from_username: String,
        expires_in: u64,
    },
    PendingInvite {
        invite_id: InviteId,
        other_user_id: UserId,
        other_username: String,
        direction: InviteDirection,
        message: String,
    },
    ChallengeSent {
        message: String,
        dismiss_after_ms: u64,
    },
    Info {
        message: String,
        dismiss_after_ms: u64,
    },
    ClearInvite,

    // Handoff
    Navigate {
        path: String,
        session: MatchSession,
    },
    Session {
        session: Option<MatchSession>,
    },
}

/// Messages sent from clients to server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    Challenge { user_id: UserId, username: String },
    Accept { invite_id: InviteId },
    Decline { invite_id: InviteId },
    Cancel { invite_id: InviteId },
    SetStatus { status: PresenceStatus },
    Search { query: String },
    ViewProfile { user_id: UserId },
    /// Sent by the game entry screen to pick up the pending match.
    TakeSession,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(from: &str, to: &str) -> MatchInvite {
        MatchInvite {
            id: "m1".to_string(),
            from_user_id: from.to_string(),
            to_user_id: to.to_string(),
            state: InviteState::Pending,
            mode: MULTIPLAYER_MODE.to_string(),
            phase: MatchPhase::Lobby,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_invite_pair_helpers() {
        let inv = invite("u1", "u2");
        assert!(inv.is_between("u1", "u2"));
        assert!(inv.is_between("u2", "u1"));
        assert!(!inv.is_between("u1", "u3"));
        assert_eq!(inv.counterpart("u1"), "u2");
        assert_eq!(inv.counterpart("u2"), "u1");
    }

    #[test]
    fn test_client_msg_wire_format() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"Challenge","user_id":"u2","username":"beta"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Challenge { ref user_id, .. } if user_id == "u2"));

        let status: PresenceStatus = serde_json::from_str(r#""playing""#).unwrap();
        assert_eq!(status, PresenceStatus::Playing);
    }
}
