//! Recording fakes shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bridge::{IncomingInvite, InviteUi, PendingInvite};
use crate::config::LobbyConfig;
use crate::error::{LobbyError, Result};
use crate::handoff::{MemoryStorage, Navigator, SessionHandoff};
use crate::invite::InviteCoordinator;
use crate::presence::{PresenceEvent, PresenceHub, PresenceTracker, PresenceTransport, RetryPolicy};
use crate::store::{
    ChangeFeed, ChangeFilter, InsertOutcome, MatchStore, MemoryStore, RowChange,
};
use crate::types::*;

pub fn identity(user_id: &str) -> PlayerIdentity {
    PlayerIdentity {
        user_id: user_id.to_string(),
        username: format!("player-{}", user_id),
        avatar_ref: None,
        vip_display: VipDisplay::default(),
        language: None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Incoming(IncomingInvite),
    Pending(PendingInvite),
    Sent(String),
    Info(String),
    Clear,
}

#[derive(Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&UiEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl InviteUi for RecordingUi {
    fn receive_invite(&self, invite: IncomingInvite) {
        self.push(UiEvent::Incoming(invite));
    }

    fn show_pending_invite(&self, invite: PendingInvite) {
        self.push(UiEvent::Pending(invite));
    }

    fn show_sent(&self, message: String) {
        self.push(UiEvent::Sent(message));
    }

    fn show_info(&self, message: String) {
        self.push(UiEvent::Info(message));
    }

    fn clear_invite(&self) {
        self.push(UiEvent::Clear);
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    calls: Mutex<Vec<(String, MatchSession)>>,
}

impl RecordingNavigator {
    pub fn calls(&self) -> Vec<(String, MatchSession)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str, session: &MatchSession) {
        self.calls.lock().unwrap().push((path.to_string(), session.clone()));
    }
}

/// Delegates to a [`MemoryStore`] but can reject writes on demand.
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    fail_writes: AtomicBool,
    yield_reads: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            yield_reads: AtomicBool::new(false),
        }
    }

    /// Makes `get_invite` yield after reading, so concurrent callers interleave.
    pub fn set_yield_reads(&self, yield_reads: bool) {
        self.yield_reads.store(yield_reads, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LobbyError::Write("rejected by test".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MatchStore for FailingStore {
    async fn find_pending_between(&self, a: &str, b: &str) -> Result<Option<MatchInvite>> {
        self.inner.find_pending_between(a, b).await
    }

    async fn latest_pending_for(&self, user_id: &str) -> Result<Option<MatchInvite>> {
        self.inner.latest_pending_for(user_id).await
    }

    async fn insert_invite(&self, from: &str, to: &str) -> Result<InsertOutcome> {
        self.check_write()?;
        self.inner.insert_invite(from, to).await
    }

    async fn get_invite(&self, id: &str) -> Result<Option<MatchInvite>> {
        let row = self.inner.get_invite(id).await;
        if self.yield_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        row
    }

    async fn update_invite_if(&self, invite: &MatchInvite, expected: InviteState) -> Result<()> {
        self.check_write()?;
        self.inner.update_invite_if(invite, expected).await
    }

    async fn finish_match(&self, id: &str) -> Result<MatchInvite> {
        self.check_write()?;
        self.inner.finish_match(id).await
    }

    async fn expire_stale(&self, max_age: Duration) -> Result<usize> {
        self.check_write()?;
        self.inner.expire_stale(max_age).await
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        self.inner.subscribe(filter)
    }
}

/// Presence transport that fails the first `failures` subscribes.
pub struct FlakyTransport {
    hub: PresenceHub,
    failures_left: AtomicU32,
    subscribe_calls: AtomicU32,
    track_calls: AtomicU32,
}

impl FlakyTransport {
    pub fn new(failures: u32) -> Self {
        Self {
            hub: PresenceHub::new(),
            failures_left: AtomicU32::new(failures),
            subscribe_calls: AtomicU32::new(0),
            track_calls: AtomicU32::new(0),
        }
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn track_calls(&self) -> u32 {
        self.track_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceTransport for FlakyTransport {
    async fn subscribe(&self, key: &str) -> Result<broadcast::Receiver<PresenceEvent>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LobbyError::Transport("TIMED_OUT".to_string()));
        }
        self.hub.subscribe(key).await
    }

    async fn track(&self, conn_id: &str, entry: PresenceEntry) -> Result<()> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.hub.track(conn_id, entry).await
    }

    async fn untrack(&self, conn_id: &str, user_id: &str) {
        self.hub.untrack(conn_id, user_id).await
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.hub.snapshot()
    }
}

/// Presence transport whose channel can be closed, dropping every meta with it.
pub struct ClosingTransport {
    hub: PresenceHub,
    channel: Mutex<Option<broadcast::Sender<PresenceEvent>>>,
    tracked: Mutex<Vec<(String, UserId)>>,
    track_calls: AtomicU32,
}

impl ClosingTransport {
    pub fn new() -> Self {
        Self {
            hub: PresenceHub::new(),
            channel: Mutex::new(None),
            tracked: Mutex::new(Vec::new()),
            track_calls: AtomicU32::new(0),
        }
    }

    pub fn track_calls(&self) -> u32 {
        self.track_calls.load(Ordering::SeqCst)
    }

    /// Ends the current subscription the way a server-side disconnect would.
    pub async fn close(&self) {
        self.channel.lock().unwrap().take();
        let tracked: Vec<_> = self.tracked.lock().unwrap().drain(..).collect();
        for (conn_id, user_id) in tracked {
            self.hub.untrack(&conn_id, &user_id).await;
        }
    }
}

#[async_trait]
impl PresenceTransport for ClosingTransport {
    async fn subscribe(&self, _key: &str) -> Result<broadcast::Receiver<PresenceEvent>> {
        let (tx, rx) = broadcast::channel(16);
        *self.channel.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn track(&self, conn_id: &str, entry: PresenceEntry) -> Result<()> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.tracked
            .lock()
            .unwrap()
            .push((conn_id.to_string(), entry.user_id.clone()));
        self.hub.track(conn_id, entry).await
    }

    async fn untrack(&self, conn_id: &str, user_id: &str) {
        self.hub.untrack(conn_id, user_id).await
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.hub.snapshot()
    }
}

/// One lobby participant wired to a shared store, with recording fakes.
pub struct TestClient {
    pub coordinator: Arc<InviteCoordinator>,
    pub ui: Arc<RecordingUi>,
    pub navigator: Arc<RecordingNavigator>,
    pub failing: Arc<FailingStore>,
    pub feed: ChangeFeed,
}

impl TestClient {
    pub async fn new(store: Arc<MemoryStore>, user_id: &str, username: &str) -> Self {
        let config = LobbyConfig::default();
        store.upsert_profile(user_id, username, None);
        let me = PlayerIdentity {
            username: username.to_string(),
            ..identity(user_id)
        };

        let presence = Arc::new(PresenceTracker::new(
            Arc::new(PresenceHub::new()),
            me.clone(),
            RetryPolicy::from_config(&config),
        ));
        presence.connect().await.unwrap();

        let failing = Arc::new(FailingStore::new(store.clone()));
        let ui = Arc::new(RecordingUi::default());
        let navigator = Arc::new(RecordingNavigator::default());
        let handoff = Arc::new(SessionHandoff::new(
            presence,
            store.clone(),
            Arc::new(MemoryStorage::new()),
            navigator.clone(),
            config.status_grace(),
            config.entry_path.clone(),
        ));
        let coordinator = InviteCoordinator::new(
            me,
            failing.clone(),
            store.clone(),
            store.clone(),
            ui.clone(),
            handoff,
            &config,
        );
        let feed = store.subscribe(ChangeFilter::Participant(user_id.to_string()));

        Self {
            coordinator,
            ui,
            navigator,
            failing,
            feed,
        }
    }

    /// Delivers every queued change to the coordinator.
    pub async fn pump(&mut self) {
        while let Some(change) = self.feed.try_next() {
            self.coordinator.handle_change(change).await;
        }
    }

    /// Takes queued changes without delivering them.
    pub fn drain(&mut self) -> Vec<RowChange> {
        let mut changes = Vec::new();
        while let Some(change) = self.feed.try_next() {
            changes.push(change);
        }
        changes
    }
}
