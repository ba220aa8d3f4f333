//! Relational store seams and the in-process platform implementation.
//!
//! Invites live in a `matches`-like table, usernames and languages in a
//! `profiles`-like table, and system messages go to a shared chat log. Every
//! insert/update on `matches` is published on a broadcast change feed that
//! clients filter down to the rows they take part in.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{LobbyError, Result};
use crate::types::*;

/// Kind of row-level change observed on the `matches` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A row-change notification.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub row: MatchInvite,
}

/// Filter applied to the change feed.
#[derive(Debug, Clone)]
pub enum ChangeFilter {
    /// Rows where the user is either party.
    Participant(UserId),
}

impl ChangeFilter {
    pub fn matches(&self, row: &MatchInvite) -> bool {
        match self {
            Self::Participant(id) => row.involves(id),
        }
    }
}

/// A filtered subscription to `matches` row changes.
pub struct ChangeFeed {
    rx: broadcast::Receiver<RowChange>,
    filter: ChangeFilter,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<RowChange>, filter: ChangeFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching change, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<RowChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change.row) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed deltas are fine: handlers re-read the row anyway.
                    tracing::warn!("Change feed lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`ChangeFeed::recv`].
    pub fn try_next(&mut self) -> Option<RowChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.filter.matches(&change.row) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Result of an insert-or-fetch on the invite table.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(MatchInvite),
    /// A pending invite for the same pair already existed.
    Existing(MatchInvite),
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Newest pending multiplayer invite between `a` and `b`, either direction.
    async fn find_pending_between(&self, a: &str, b: &str) -> Result<Option<MatchInvite>>;

    /// Newest pending multiplayer invite addressed to `user_id`.
    async fn latest_pending_for(&self, user_id: &str) -> Result<Option<MatchInvite>>;

    /// Creates a pending invite unless one already exists for the pair.
    async fn insert_invite(&self, from: &str, to: &str) -> Result<InsertOutcome>;

    async fn get_invite(&self, id: &str) -> Result<Option<MatchInvite>>;

    /// Whole-row update that only applies while the stored state is `expected`.
    /// Fails with [`LobbyError::Stale`] once another writer moved the row on.
    async fn update_invite_if(&self, invite: &MatchInvite, expected: InviteState) -> Result<()>;

    /// Marks an accepted match as finished.
    async fn finish_match(&self, id: &str) -> Result<MatchInvite>;

    /// Cancels pending invites older than `max_age`. Returns how many changed.
    async fn expire_stale(&self, max_age: Duration) -> Result<usize>;

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn username(&self, user_id: &str) -> Result<String>;
    async fn language(&self, user_id: &str) -> Result<Option<String>>;
}

/// A system line posted to the shared lobby chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub match_id: InviteId,
    pub from_user: UserId,
    pub to_user: UserId,
}

#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn post_system(&self, message: SystemMessage) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Profile {
    username: String,
    language: Option<String>,
}

/// In-memory store backing every connected client.
pub struct MemoryStore {
    matches: DashMap<InviteId, MatchInvite>,
    profiles: DashMap<UserId, Profile>,
    chat: Mutex<Vec<SystemMessage>>,
    /// Serialises lookup-then-insert so the pair uniqueness holds.
    insert_lock: Mutex<()>,
    change_tx: broadcast::Sender<RowChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            matches: DashMap::new(),
            profiles: DashMap::new(),
            chat: Mutex::new(Vec::new()),
            insert_lock: Mutex::new(()),
            change_tx,
        }
    }

    /// Creates or refreshes a profile row.
    pub fn upsert_profile(&self, user_id: &str, username: &str, language: Option<&str>) {
        self.profiles.insert(
            user_id.to_string(),
            Profile {
                username: username.to_string(),
                language: language.map(str::to_string),
            },
        );
    }

    pub fn chat_messages(&self) -> Vec<SystemMessage> {
        self.chat.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All invites between a pair, newest first.
    pub fn invites_between(&self, a: &str, b: &str) -> Vec<MatchInvite> {
        let mut rows: Vec<MatchInvite> = self
            .matches
            .iter()
            .filter(|r| r.value().is_between(a, b))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|x, y| y.created_at.cmp(&x.created_at));
        rows
    }

    fn newest_pending<F>(&self, pred: F) -> Option<MatchInvite>
    where
        F: Fn(&MatchInvite) -> bool,
    {
        self.matches
            .iter()
            .filter(|r| {
                let row = r.value();
                row.state == InviteState::Pending && row.is_multiplayer() && pred(row)
            })
            .map(|r| r.value().clone())
            .max_by(|x, y| x.created_at.cmp(&y.created_at))
    }

    fn publish(&self, kind: ChangeKind, row: MatchInvite) {
        let _ = self.change_tx.send(RowChange { kind, row });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn find_pending_between(&self, a: &str, b: &str) -> Result<Option<MatchInvite>> {
        Ok(self.newest_pending(|row| row.is_between(a, b)))
    }

    async fn latest_pending_for(&self, user_id: &str) -> Result<Option<MatchInvite>> {
        Ok(self.newest_pending(|row| row.to_user_id == user_id))
    }

    async fn insert_invite(&self, from: &str, to: &str) -> Result<InsertOutcome> {
        let row = {
            let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = self.newest_pending(|row| row.is_between(from, to)) {
                return Ok(InsertOutcome::Existing(existing));
            }

            let row = MatchInvite {
                id: Uuid::new_v4().to_string(),
                from_user_id: from.to_string(),
                to_user_id: to.to_string(),
                state: InviteState::Pending,
                mode: MULTIPLAYER_MODE.to_string(),
                phase: MatchPhase::Lobby,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            };
            self.matches.insert(row.id.clone(), row.clone());
            row
        };

        tracing::info!("Match invite {} created: {} -> {}", row.id, from, to);
        self.publish(ChangeKind::Insert, row.clone());
        Ok(InsertOutcome::Created(row))
    }

    async fn get_invite(&self, id: &str) -> Result<Option<MatchInvite>> {
        Ok(self.matches.get(id).map(|r| r.value().clone()))
    }

    async fn update_invite_if(&self, invite: &MatchInvite, expected: InviteState) -> Result<()> {
        {
            let mut row = self
                .matches
                .get_mut(&invite.id)
                .ok_or_else(|| LobbyError::Write(format!("no match row {}", invite.id)))?;
            if row.state != expected {
                return Err(LobbyError::Stale {
                    invite_id: invite.id.clone(),
                    state: row.state,
                });
            }
            *row = invite.clone();
        }
        self.publish(ChangeKind::Update, invite.clone());
        Ok(())
    }

    async fn finish_match(&self, id: &str) -> Result<MatchInvite> {
        let row = {
            let mut row = self
                .matches
                .get_mut(id)
                .ok_or_else(|| LobbyError::NotFound(id.to_string()))?;
            row.phase = MatchPhase::Finished;
            row.finished_at = Some(Utc::now());
            row.clone()
        };
        tracing::info!("Match {} finished", id);
        self.publish(ChangeKind::Update, row.clone());
        Ok(row)
    }

    async fn expire_stale(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| LobbyError::Config(e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let mut expired = Vec::new();
        for mut row in self.matches.iter_mut() {
            if row.state == InviteState::Pending && row.created_at <= cutoff {
                row.state = InviteState::Cancelled;
                expired.push(row.clone());
            }
        }

        let count = expired.len();
        for row in expired {
            tracing::info!("Match invite {} expired by sweep", row.id);
            self.publish(ChangeKind::Update, row);
        }
        Ok(count)
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        ChangeFeed::new(self.change_tx.subscribe(), filter)
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn username(&self, user_id: &str) -> Result<String> {
        self.profiles
            .get(user_id)
            .map(|p| p.username.clone())
            .ok_or_else(|| LobbyError::Lookup(format!("no profile for {}", user_id)))
    }

    async fn language(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.profiles.get(user_id).and_then(|p| p.language.clone()))
    }
}

#[async_trait]
impl ChatLog for MemoryStore {
    async fn post_system(&self, message: SystemMessage) -> Result<()> {
        self.chat.lock().unwrap_or_else(|e| e.into_inner()).push(message);
        Ok(())
    }
}
