//! Presence channel and the per-client presence tracker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::config::LobbyConfig;
use crate::error::{LobbyError, Result};
use crate::types::*;

/// Membership notifications emitted by a presence channel.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Full membership changed; read the snapshot.
    Sync,
    Join { entry: PresenceEntry },
    Leave { user_id: UserId },
}

/// A presence-style realtime channel with a synchronized membership snapshot.
///
/// Each user key holds one meta per connection, so a user with two tabs open
/// stays present until both have left.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    async fn subscribe(&self, key: &str) -> Result<broadcast::Receiver<PresenceEvent>>;
    /// Publishes (or replaces) the meta of connection `conn_id`.
    async fn track(&self, conn_id: &str, entry: PresenceEntry) -> Result<()>;
    async fn untrack(&self, conn_id: &str, user_id: &str);
    /// Every meta, grouped by user in join order.
    fn snapshot(&self) -> Vec<PresenceEntry>;
}

/// One connection's published meta.
#[derive(Debug, Clone)]
struct PresenceMeta {
    conn_id: String,
    entry: PresenceEntry,
}

/// The shared `presence:online-users` channel.
pub struct PresenceHub {
    members: DashMap<UserId, Vec<PresenceMeta>>,
    event_tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            members: DashMap::new(),
            event_tx,
        }
    }

    pub fn online_count(&self) -> usize {
        self.members.len()
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceTransport for PresenceHub {
    async fn subscribe(&self, key: &str) -> Result<broadcast::Receiver<PresenceEvent>> {
        tracing::debug!("Presence subscribe: {}", key);
        Ok(self.event_tx.subscribe())
    }

    async fn track(&self, conn_id: &str, entry: PresenceEntry) -> Result<()> {
        let joined = {
            let mut metas = self.members.entry(entry.user_id.clone()).or_default();
            let joined = metas.is_empty();
            match metas.iter_mut().find(|m| m.conn_id == conn_id) {
                Some(meta) => meta.entry = entry.clone(),
                None => metas.push(PresenceMeta {
                    conn_id: conn_id.to_string(),
                    entry: entry.clone(),
                }),
            }
            joined
        };

        let event = if joined {
            PresenceEvent::Join { entry }
        } else {
            PresenceEvent::Sync
        };
        let _ = self.event_tx.send(event);
        Ok(())
    }

    async fn untrack(&self, conn_id: &str, user_id: &str) {
        let removed = match self.members.get_mut(user_id) {
            Some(mut metas) => {
                let before = metas.len();
                metas.retain(|m| m.conn_id != conn_id);
                before != metas.len()
            }
            None => false,
        };
        if !removed {
            return;
        }

        let left = self
            .members
            .remove_if(user_id, |_, metas| metas.is_empty())
            .is_some();
        let event = if left {
            PresenceEvent::Leave {
                user_id: user_id.to_string(),
            }
        } else {
            PresenceEvent::Sync
        };
        let _ = self.event_tx.send(event);
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.members
            .iter()
            .flat_map(|r| r.value().iter().map(|m| m.entry.clone()).collect::<Vec<_>>())
            .collect()
    }
}

/// Connection lifecycle of a tracker, observable by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Retries exhausted; the user has to reload.
    Failed,
}

/// Bounded linear backoff for presence reconnects.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &LobbyConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            cap: Duration::from_millis(config.reconnect_cap_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.base * attempt).min(self.cap)
    }
}

/// One client's view of who is online.
pub struct PresenceTracker {
    transport: Arc<dyn PresenceTransport>,
    identity: PlayerIdentity,
    /// Distinguishes this connection from the same user's other tabs.
    conn_id: String,
    tracked: AtomicBool,
    status: Mutex<PresenceStatus>,
    roster: RwLock<Vec<PresenceEntry>>,
    retry: RetryPolicy,
    attempts: AtomicU32,
    state_tx: watch::Sender<ConnectionState>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<dyn PresenceTransport>, identity: PlayerIdentity, retry: RetryPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            transport,
            identity,
            conn_id: Uuid::new_v4().to_string(),
            tracked: AtomicBool::new(false),
            status: Mutex::new(PresenceStatus::Online),
            roster: RwLock::new(Vec::new()),
            retry,
            attempts: AtomicU32::new(0),
            state_tx,
        }
    }

    pub fn identity(&self) -> &PlayerIdentity {
        &self.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn status(&self) -> PresenceStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Joins the channel, retrying with backoff until the attempt budget runs out.
    pub async fn connect(&self) -> Result<broadcast::Receiver<PresenceEvent>> {
        self.state_tx.send_replace(ConnectionState::Connecting);
        loop {
            match self.join_once().await {
                Ok(rx) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.state_tx.send_replace(ConnectionState::Connected);
                    self.rebuild();
                    tracing::info!("Presence connected: {}", self.identity.user_id);
                    return Ok(rx);
                }
                Err(e) => {
                    self.tracked.store(false, Ordering::SeqCst);
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > self.retry.max_attempts {
                        tracing::error!(
                            "Presence gave up after {} attempts for {}: {}",
                            attempt,
                            self.identity.user_id,
                            e
                        );
                        self.state_tx.send_replace(ConnectionState::Failed);
                        return Err(LobbyError::Transport(
                            "connection error, please reload".to_string(),
                        ));
                    }

                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Presence failed ({}), retry {}/{} in {:?}",
                        e,
                        attempt,
                        self.retry.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Rejoins after the channel closed. The transport dropped our meta with
    /// the old subscription, so it is announced again.
    pub async fn reconnect(&self) -> Result<broadcast::Receiver<PresenceEvent>> {
        self.tracked.store(false, Ordering::SeqCst);
        self.connect().await
    }

    async fn join_once(&self) -> Result<broadcast::Receiver<PresenceEvent>> {
        let rx = self.transport.subscribe(&self.identity.user_id).await?;
        self.announce().await?;
        Ok(rx)
    }

    /// Publishes the self descriptor as `online`. Returns `false` if already announced.
    pub async fn announce(&self) -> Result<bool> {
        if self.tracked.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = PresenceStatus::Online;
        let entry = PresenceEntry::from_identity(&self.identity, PresenceStatus::Online);
        if let Err(e) = self.transport.track(&self.conn_id, entry).await {
            self.tracked.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    /// Republishes the self descriptor with a new status.
    pub async fn update_own_status(&self, status: PresenceStatus) -> Result<()> {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        if !self.tracked.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .track(&self.conn_id, PresenceEntry::from_identity(&self.identity, status))
            .await
    }

    pub async fn leave(&self) {
        if self.tracked.swap(false, Ordering::SeqCst) {
            self.transport.untrack(&self.conn_id, &self.identity.user_id).await;
            tracing::info!("Presence left: {}", self.identity.user_id);
        }
    }

    /// Any membership event triggers a rebuild from the full snapshot.
    pub fn on_membership_changed(&self, event: &PresenceEvent) -> Vec<PresenceEntry> {
        match event {
            PresenceEvent::Join { entry } => tracing::debug!("Presence join: {}", entry.user_id),
            PresenceEvent::Leave { user_id } => tracing::debug!("Presence leave: {}", user_id),
            PresenceEvent::Sync => {}
        }
        self.rebuild()
    }

    /// Rebuilds the roster: one entry per user, first one wins.
    pub fn rebuild(&self) -> Vec<PresenceEntry> {
        let mut users: Vec<PresenceEntry> = Vec::new();
        for mut entry in self.transport.snapshot() {
            if users.iter().any(|u| u.user_id == entry.user_id) {
                continue;
            }
            if entry.username.is_empty() {
                entry.username = "Unknown".to_string();
            }
            if entry.avatar_ref.is_empty() {
                entry.avatar_ref = "normal".to_string();
            }
            users.push(entry);
        }
        users.sort_by(|a, b| a.username.to_lowercase().cmp(&b.username.to_lowercase()));

        *self.roster.write().unwrap_or_else(|e| e.into_inner()) = users.clone();
        users
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.roster.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn find(&self, user_id: &str) -> Option<PresenceEntry> {
        self.roster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|u| u.user_id == user_id)
            .cloned()
    }

    /// Online users whose name starts with `query`, excluding self.
    pub fn search(&self, query: &str) -> Vec<PresenceEntry> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        self.roster()
            .into_iter()
            .filter(|u| u.user_id != self.identity.user_id)
            .filter(|u| u.username.to_lowercase().starts_with(&query))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{identity, ClosingTransport, FlakyTransport};

    fn tracker(hub: Arc<dyn PresenceTransport>, user: &str) -> PresenceTracker {
        PresenceTracker::new(hub, identity(user), RetryPolicy::from_config(&LobbyConfig::default()))
    }

    #[tokio::test]
    async fn test_join_then_leave_removes_entry() {
        let hub = Arc::new(PresenceHub::new());
        let observer = tracker(hub.clone(), "u1");
        let mut events = observer.connect().await.unwrap();
        // Our own join.
        events.recv().await.unwrap();

        let peer = tracker(hub.clone(), "u2");
        peer.connect().await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, PresenceEvent::Join { .. }));
        let roster = observer.on_membership_changed(&event);
        assert!(roster.iter().any(|u| u.user_id == "u2"));

        peer.leave().await;
        let event = events.recv().await.unwrap();
        assert!(matches!(event, PresenceEvent::Leave { ref user_id } if user_id == "u2"));
        let roster = observer.on_membership_changed(&event);
        assert!(roster.iter().all(|u| u.user_id != "u2"));
    }

    #[tokio::test]
    async fn test_second_tab_keeps_user_present() {
        let hub = Arc::new(PresenceHub::new());
        let observer = tracker(hub.clone(), "u1");
        observer.connect().await.unwrap();
        let tab_a = tracker(hub.clone(), "u2");
        tab_a.connect().await.unwrap();
        let tab_b = tracker(hub.clone(), "u2");
        tab_b.connect().await.unwrap();

        let roster = observer.rebuild();
        assert_eq!(roster.iter().filter(|u| u.user_id == "u2").count(), 1);
        assert_eq!(hub.online_count(), 2);

        let mut events = hub.subscribe("u1").await.unwrap();
        tab_a.leave().await;
        assert!(matches!(events.recv().await.unwrap(), PresenceEvent::Sync));
        assert!(observer.rebuild().iter().any(|u| u.user_id == "u2"));

        tab_b.leave().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            PresenceEvent::Leave { ref user_id } if user_id == "u2"
        ));
        assert!(observer.rebuild().iter().all(|u| u.user_id != "u2"));
        assert_eq!(hub.online_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_reconnect_announces_again() {
        let transport = Arc::new(ClosingTransport::new());
        let me = tracker(transport.clone(), "u1");
        let mut events = me.connect().await.unwrap();
        assert_eq!(transport.track_calls(), 1);

        transport.close().await;
        // Drain our own join, then observe the close.
        while events.recv().await.is_ok() {}
        assert!(transport.snapshot().is_empty());

        me.reconnect().await.unwrap();
        assert_eq!(transport.track_calls(), 2);
        assert!(transport.snapshot().iter().any(|u| u.user_id == "u1"));
        assert!(me.roster().iter().any(|u| u.user_id == "u1"));
    }

    #[tokio::test]
    async fn test_status_update_keeps_single_entry() {
        let hub = Arc::new(PresenceHub::new());
        let observer = tracker(hub.clone(), "u1");
        observer.connect().await.unwrap();
        let peer = tracker(hub.clone(), "u2");
        peer.connect().await.unwrap();

        peer.update_own_status(PresenceStatus::Playing).await.unwrap();
        let roster = observer.rebuild();
        let entries: Vec<_> = roster.iter().filter(|u| u.user_id == "u2").collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, PresenceStatus::Playing);
    }

    #[tokio::test]
    async fn test_announce_is_idempotent() {
        let transport = Arc::new(FlakyTransport::new(0));
        let me = tracker(transport.clone(), "u1");
        assert!(me.announce().await.unwrap());
        assert!(!me.announce().await.unwrap());

        assert_eq!(transport.track_calls(), 1);
        let mine: Vec<_> = transport.snapshot().into_iter().filter(|u| u.user_id == "u1").collect();
        assert_eq!(mine.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_attempts_on_success() {
        let transport = Arc::new(FlakyTransport::new(2));
        let me = tracker(transport.clone(), "u1");

        me.connect().await.unwrap();
        assert_eq!(transport.subscribe_calls(), 3);
        assert_eq!(me.connection_state(), ConnectionState::Connected);
        assert_eq!(me.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let transport = Arc::new(FlakyTransport::new(u32::MAX));
        let me = tracker(transport.clone(), "u1");

        let err = me.connect().await.unwrap_err();
        assert!(matches!(err, LobbyError::Transport(_)));
        assert_eq!(me.connection_state(), ConnectionState::Failed);
        // First try plus five retries.
        assert_eq!(transport.subscribe_calls(), 6);
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let policy = RetryPolicy::from_config(&LobbyConfig::default());
        assert_eq!(policy.delay_for(1), Duration::from_millis(1200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3600));
        assert_eq!(policy.delay_for(5), Duration::from_millis(6000));
        assert_eq!(policy.delay_for(9), Duration::from_millis(6000));
    }

    #[tokio::test]
    async fn test_search_matches_prefix_and_skips_self() {
        let hub = Arc::new(PresenceHub::new());
        let me = PresenceTracker::new(
            hub.clone(),
            PlayerIdentity {
                username: "Bravo".to_string(),
                ..identity("u1")
            },
            RetryPolicy::from_config(&LobbyConfig::default()),
        );
        me.connect().await.unwrap();
        let peer = PresenceTracker::new(
            hub.clone(),
            PlayerIdentity {
                username: "bramble".to_string(),
                ..identity("u2")
            },
            RetryPolicy::from_config(&LobbyConfig::default()),
        );
        peer.connect().await.unwrap();
        me.rebuild();

        let hits = me.search("BRA");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "u2");
        assert!(me.search("   ").is_empty());
    }
}
