use std::sync::Arc;

use dashmap::DashMap;

use crate::config::LobbyConfig;
use crate::handoff::MemoryStorage;
use crate::presence::PresenceHub;
use crate::store::{MatchStore, MemoryStore};
use crate::types::UserId;

/// Shared platform state: the invite/profile store and the presence channel.
pub struct Backend {
    pub store: Arc<MemoryStore>,
    pub presence: Arc<PresenceHub>,
    pub config: LobbyConfig,
    /// Per-user local storage, shared by every connection of that user so
    /// the game entry screen sees what the lobby wrote.
    sessions: DashMap<UserId, Arc<MemoryStorage>>,
}

impl Backend {
    pub fn new(config: LobbyConfig) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(MemoryStore::new()),
            presence: Arc::new(PresenceHub::new()),
            config,
            sessions: DashMap::new(),
        })
    }

    pub fn session_storage(&self, user_id: &str) -> Arc<MemoryStorage> {
        self.sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone()
    }

    /// Cancels invites whose recipient never answered, even if their client is gone.
    ///
    /// Runs at the expiry cadence and only touches invites older than twice the
    /// answer window, so an open popup's own timer always wins.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let window = backend.config.invite_expiry();
            let mut ticker = tokio::time::interval(window);
            loop {
                ticker.tick().await;
                match backend.store.expire_stale(window * 2).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Expiry sweep cancelled {} invites", n),
                    Err(e) => tracing::warn!("Expiry sweep failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::store::InsertOutcome;
    use crate::types::InviteState;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_cancels_abandoned_invites() {
        let backend = Backend::new(LobbyConfig::default());
        let InsertOutcome::Created(mut row) = backend.store.insert_invite("u1", "u2").await.unwrap() else {
            panic!("expected a new invite");
        };
        row.created_at = Utc::now() - chrono::Duration::seconds(90);
        backend.store.update_invite_if(&row, InviteState::Pending).await.unwrap();

        let sweep = backend.spawn_expiry_sweep();
        tokio::time::sleep(Duration::from_millis(10)).await;
        sweep.abort();

        let row = backend.store.get_invite(&row.id).await.unwrap().unwrap();
        assert_eq!(row.state, InviteState::Cancelled);
    }

    #[test]
    fn test_session_storage_is_shared_per_user() {
        use crate::handoff::LocalStorage;

        let backend = Backend::new(LobbyConfig::default());
        backend.session_storage("u1").set("matchId", "m1");
        assert_eq!(backend.session_storage("u1").get("matchId").as_deref(), Some("m1"));
        assert!(backend.session_storage("u2").get("matchId").is_none());
    }
}
