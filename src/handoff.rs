//! Moves a client from "invite accepted" into the game, once per invite.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::presence::PresenceTracker;
use crate::store::ProfileStore;
use crate::types::*;

pub const MATCH_ID_KEY: &str = "matchId";
pub const MATCH_OPPONENT_NAME_KEY: &str = "matchOpponentName";
pub const MATCH_OPPONENT_ID_KEY: &str = "matchOpponentId";
pub const MATCH_SOURCE_KEY: &str = "matchSource";
pub const SELECTED_MODE_KEY: &str = "selectedMode";

const FALLBACK_OPPONENT: &str = "Opponent";
/// Processed invite ids older than this are forgotten.
const PROCESSED_TTL: Duration = Duration::from_secs(3600);

/// Client-local key-value storage that survives navigation.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}

/// Moves the client to another screen.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str, session: &MatchSession);
}

/// Tells a WebSocket client where to go next.
pub struct SocketNavigator {
    tx: mpsc::UnboundedSender<ServerMsg>,
}

impl SocketNavigator {
    pub fn new(tx: mpsc::UnboundedSender<ServerMsg>) -> Self {
        Self { tx }
    }
}

impl Navigator for SocketNavigator {
    fn navigate(&self, path: &str, session: &MatchSession) {
        let _ = self.tx.send(ServerMsg::Navigate {
            path: path.to_string(),
            session: session.clone(),
        });
    }
}

pub fn write_session(storage: &dyn LocalStorage, session: &MatchSession) {
    storage.set(MATCH_ID_KEY, &session.match_id);
    storage.set(MATCH_OPPONENT_NAME_KEY, &session.opponent_username);
    storage.set(MATCH_OPPONENT_ID_KEY, &session.opponent_user_id);
    storage.set(MATCH_SOURCE_KEY, session.source.as_str());
    storage.set(SELECTED_MODE_KEY, MULTIPLAYER_MODE);
}

/// Reads the session left by the lobby and clears it. Called by the game entry screen.
pub fn take_session(storage: &dyn LocalStorage) -> Option<MatchSession> {
    let match_id = storage.get(MATCH_ID_KEY)?;
    let session = MatchSession {
        match_id,
        opponent_user_id: storage.get(MATCH_OPPONENT_ID_KEY).unwrap_or_default(),
        opponent_username: storage
            .get(MATCH_OPPONENT_NAME_KEY)
            .unwrap_or_else(|| FALLBACK_OPPONENT.to_string()),
        source: storage
            .get(MATCH_SOURCE_KEY)
            .and_then(|s| SessionSource::parse(&s))
            .unwrap_or(SessionSource::Multiplayer),
    };

    for key in [
        MATCH_ID_KEY,
        MATCH_OPPONENT_NAME_KEY,
        MATCH_OPPONENT_ID_KEY,
        MATCH_SOURCE_KEY,
    ] {
        storage.remove(key);
    }
    Some(session)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    Handled(MatchSession),
    /// This client already handed off for the invite.
    Duplicate,
    /// The invite is not (or no longer) in an accepted, unfinished state.
    NotApplicable,
}

pub struct SessionHandoff {
    user_id: UserId,
    profiles: Arc<dyn ProfileStore>,
    storage: Arc<dyn LocalStorage>,
    navigator: Arc<dyn Navigator>,
    presence: Arc<PresenceTracker>,
    processed: DashMap<InviteId, DateTime<Utc>>,
    grace: Duration,
    entry_path: String,
}

impl SessionHandoff {
    pub fn new(
        presence: Arc<PresenceTracker>,
        profiles: Arc<dyn ProfileStore>,
        storage: Arc<dyn LocalStorage>,
        navigator: Arc<dyn Navigator>,
        grace: Duration,
        entry_path: String,
    ) -> Self {
        Self {
            user_id: presence.identity().user_id.clone(),
            profiles,
            storage,
            navigator,
            presence,
            processed: DashMap::new(),
            grace,
            entry_path,
        }
    }

    pub fn is_processed(&self, invite_id: &str) -> bool {
        self.processed.contains_key(invite_id)
    }

    /// Reaction to an observed `accepted` transition.
    pub async fn on_invite_accepted(&self, invite: &MatchInvite) -> HandoffOutcome {
        self.hand_off(invite, None).await
    }

    /// Hands off to the game. `opponent_name` skips the profile lookup when known.
    pub async fn hand_off(&self, invite: &MatchInvite, opponent_name: Option<&str>) -> HandoffOutcome {
        if self.is_processed(&invite.id) {
            tracing::debug!("Handoff for {} already done, skipping", invite.id);
            return HandoffOutcome::Duplicate;
        }

        if invite.state != InviteState::Accepted
            || invite.phase == MatchPhase::Finished
            || !invite.is_multiplayer()
            || !invite.involves(&self.user_id)
        {
            return HandoffOutcome::NotApplicable;
        }

        match self.processed.entry(invite.id.clone()) {
            Entry::Occupied(_) => return HandoffOutcome::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }
        self.prune_processed();

        let opponent_user_id = invite.counterpart(&self.user_id).to_string();
        let opponent_username = match opponent_name {
            Some(name) => name.to_string(),
            None => self.resolve_username(&opponent_user_id).await,
        };

        let session = MatchSession {
            match_id: invite.id.clone(),
            opponent_user_id,
            opponent_username,
            source: SessionSource::Multiplayer,
        };
        write_session(self.storage.as_ref(), &session);

        // Peers should see `playing` before we drop out of the channel.
        if let Err(e) = self.presence.update_own_status(PresenceStatus::Playing).await {
            tracing::warn!("Failed to publish playing status for {}: {}", self.user_id, e);
        }
        tokio::time::sleep(self.grace).await;

        let path = format!("{}?match={}", self.entry_path, invite.id);
        self.navigator.navigate(&path, &session);
        tracing::info!(
            "Handoff {} -> {} (opponent {})",
            self.user_id,
            path,
            session.opponent_user_id
        );

        HandoffOutcome::Handled(session)
    }

    async fn resolve_username(&self, user_id: &str) -> String {
        match self.profiles.username(user_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!("Opponent lookup failed for {}: {}", user_id, e);
                FALLBACK_OPPONENT.to_string()
            }
        }
    }

    fn prune_processed(&self) {
        let Ok(ttl) = chrono::Duration::from_std(PROCESSED_TTL) else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        self.processed.retain(|_, handled_at| *handled_at > cutoff);
    }
}
