//! Match invite state machine and the coordinator that drives it.
//!
//! ```text
//!  (none) --create--> PENDING --accept--> ACCEPTED
//!                        |
//!                        +--decline/cancel/expire--> CANCELLED
//! ```
//!
//! Each client keeps one [`InviteMachine`] per invite it has seen. User
//! actions go through the machine before touching the store, and change
//! events are folded into it so duplicates and stale deliveries are ignored.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::bridge::{IncomingInvite, InviteUi, PendingInvite};
use crate::config::LobbyConfig;
use crate::error::{LobbyError, Result};
use crate::handoff::SessionHandoff;
use crate::store::{ChangeKind, ChatLog, InsertOutcome, MatchStore, ProfileStore, RowChange, SystemMessage};
use crate::types::*;

const FALLBACK_OPPONENT: &str = "Opponent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteRole {
    Sender,
    Recipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteAction {
    Accept,
    Decline,
    Cancel,
    /// System-initiated decline after the answer window closes.
    Expire,
}

impl InviteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
        }
    }

    fn allowed_for(self, role: InviteRole) -> bool {
        match self {
            Self::Accept | Self::Decline | Self::Expire => role == InviteRole::Recipient,
            Self::Cancel => role == InviteRole::Sender,
        }
    }

    fn target(self) -> InviteState {
        match self {
            Self::Accept => InviteState::Accepted,
            Self::Decline | Self::Cancel | Self::Expire => InviteState::Cancelled,
        }
    }
}

/// What folding an observed row state into a machine did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Advanced(InviteState),
    Unchanged,
    /// The machine is already terminal in a different state.
    Stale,
}

/// Local view of one invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteMachine {
    pub invite_id: InviteId,
    pub role: InviteRole,
    pub state: InviteState,
    pub opponent_id: UserId,
    pub opponent_username: Option<String>,
}

impl InviteMachine {
    /// `None` when `user_id` is not a party to the invite.
    pub fn new(invite: &MatchInvite, user_id: &str) -> Option<Self> {
        let role = if invite.to_user_id == user_id {
            InviteRole::Recipient
        } else if invite.from_user_id == user_id {
            InviteRole::Sender
        } else {
            return None;
        };

        Some(Self {
            invite_id: invite.id.clone(),
            role,
            state: invite.state,
            opponent_id: invite.counterpart(user_id).to_string(),
            opponent_username: None,
        })
    }

    /// Applies a local action. Terminal states reject every action as stale.
    pub fn apply(&mut self, action: InviteAction, user_id: &str) -> Result<InviteState> {
        if !action.allowed_for(self.role) {
            return Err(LobbyError::NotParticipant {
                user_id: user_id.to_string(),
                invite_id: self.invite_id.clone(),
                action: action.as_str(),
            });
        }
        if self.state.is_terminal() {
            return Err(LobbyError::Stale {
                invite_id: self.invite_id.clone(),
                state: self.state,
            });
        }

        self.state = action.target();
        Ok(self.state)
    }

    /// Folds a state read from the store or a change event.
    pub fn observe(&mut self, state: InviteState) -> Observation {
        if state == self.state {
            return Observation::Unchanged;
        }
        if self.state.is_terminal() || state == InviteState::Pending {
            return Observation::Stale;
        }
        self.state = state;
        Observation::Advanced(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// A new invite was created.
    Sent(MatchInvite),
    /// We already have a pending invite out to this user.
    AlreadySent(MatchInvite),
    /// The other user already challenged us; decide on theirs.
    AwaitingDecision(MatchInvite),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied(MatchInvite),
    /// Someone already decided; nothing was changed.
    Stale,
}

#[derive(Debug, Clone)]
struct ActiveDialog {
    invite_id: InviteId,
    other_user_id: UserId,
}

/// Localised system line announcing an accepted challenge.
pub fn acceptance_message(language: &str, acceptor: &str, challenger: &str) -> String {
    let (accepted, battle_started) = match language {
        "pt" => ("aceitou", "Batalha começou!"),
        "es" => ("aceptó", "¡Batalla comenzada!"),
        _ => ("accepted", "Battle started!"),
    };
    format!("⚔️ {} {} {}. {}", acceptor, accepted, challenger, battle_started)
}

pub struct InviteCoordinator {
    identity: PlayerIdentity,
    store: Arc<dyn MatchStore>,
    profiles: Arc<dyn ProfileStore>,
    chat: Arc<dyn ChatLog>,
    ui: Arc<dyn InviteUi>,
    handoff: Arc<SessionHandoff>,
    machines: DashMap<InviteId, InviteMachine>,
    timers: DashMap<InviteId, watch::Sender<bool>>,
    active: Mutex<Option<ActiveDialog>>,
    expiry: Duration,
    default_language: String,
}

impl InviteCoordinator {
    pub fn new(
        identity: PlayerIdentity,
        store: Arc<dyn MatchStore>,
        profiles: Arc<dyn ProfileStore>,
        chat: Arc<dyn ChatLog>,
        ui: Arc<dyn InviteUi>,
        handoff: Arc<SessionHandoff>,
        config: &LobbyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            store,
            profiles,
            chat,
            ui,
            handoff,
            machines: DashMap::new(),
            timers: DashMap::new(),
            active: Mutex::new(None),
            expiry: config.invite_expiry(),
            default_language: config.default_language.clone(),
        })
    }

    fn me(&self) -> &str {
        &self.identity.user_id
    }

    pub fn machine(&self, invite_id: &str) -> Option<InviteMachine> {
        self.machines.get(invite_id).map(|m| m.value().clone())
    }

    pub fn active_invite(&self) -> Option<InviteId> {
        self.lock_active().as_ref().map(|d| d.invite_id.clone())
    }

    pub fn has_timer(&self, invite_id: &str) -> bool {
        self.timers.contains_key(invite_id)
    }

    /// Challenges `to_user_id`, reusing any pending invite between the pair.
    pub async fn challenge(self: &Arc<Self>, to_user_id: &str, to_username: &str) -> Result<ChallengeOutcome> {
        if to_user_id == self.me() {
            self.ui.show_info("You cannot challenge yourself".to_string());
            return Err(LobbyError::SelfChallenge);
        }

        // Best effort only: the store settles the race on insert.
        let existing = match self.store.find_pending_between(self.me(), to_user_id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!("Pending invite lookup failed: {}", e);
                None
            }
        };
        if let Some(row) = existing {
            return self.present_existing(row, to_username);
        }

        match self.store.insert_invite(self.me(), to_user_id).await {
            Ok(InsertOutcome::Created(row)) => {
                self.track(&row, Some(to_username));
                self.ui.show_sent(format!("Challenge sent to {}!", to_username));
                Ok(ChallengeOutcome::Sent(row))
            }
            Ok(InsertOutcome::Existing(row)) => self.present_existing(row, to_username),
            Err(e) => {
                tracing::error!("Error creating match {} -> {}: {}", self.me(), to_user_id, e);
                self.ui.show_info("Failed to send challenge".to_string());
                Err(e)
            }
        }
    }

    fn present_existing(self: &Arc<Self>, row: MatchInvite, other_username: &str) -> Result<ChallengeOutcome> {
        let machine = self
            .track(&row, Some(other_username))
            .ok_or_else(|| LobbyError::NotParticipant {
                user_id: self.me().to_string(),
                invite_id: row.id.clone(),
                action: "challenge",
            })?;
        let other_user_id = machine.opponent_id.clone();

        let direction = match machine.role {
            InviteRole::Recipient => InviteDirection::Received,
            InviteRole::Sender => InviteDirection::Sent,
        };
        if self.open_dialog(&row.id, &other_user_id) {
            self.ui.show_pending_invite(PendingInvite {
                invite_id: row.id.clone(),
                other_user_id,
                other_username: other_username.to_string(),
                direction,
            });
        }

        Ok(match machine.role {
            InviteRole::Recipient => {
                self.start_expiry(&row.id);
                ChallengeOutcome::AwaitingDecision(row)
            }
            InviteRole::Sender => ChallengeOutcome::AlreadySent(row),
        })
    }

    pub async fn accept(self: &Arc<Self>, invite_id: &str) -> Result<ActionOutcome> {
        self.resolve(invite_id, InviteAction::Accept).await
    }

    pub async fn decline(self: &Arc<Self>, invite_id: &str) -> Result<ActionOutcome> {
        self.resolve(invite_id, InviteAction::Decline).await
    }

    pub async fn cancel(self: &Arc<Self>, invite_id: &str) -> Result<ActionOutcome> {
        self.resolve(invite_id, InviteAction::Cancel).await
    }

    pub async fn expire(self: &Arc<Self>, invite_id: &str) -> Result<ActionOutcome> {
        self.resolve(invite_id, InviteAction::Expire).await
    }

    async fn resolve(self: &Arc<Self>, invite_id: &str, action: InviteAction) -> Result<ActionOutcome> {
        let (machine, row) = self.load(invite_id).await?;

        let mut next = machine.clone();
        match next.apply(action, self.me()) {
            Ok(_) => {}
            Err(e) if e.is_stale() => {
                tracing::debug!("Ignoring {} on {}: {}", action.as_str(), invite_id, e);
                self.settle(invite_id);
                return Ok(ActionOutcome::Stale);
            }
            Err(e) => return Err(e),
        }

        let mut updated = row;
        updated.state = next.state;
        if action == InviteAction::Accept {
            updated.started_at = Some(Utc::now());
        }

        match self.store.update_invite_if(&updated, InviteState::Pending).await {
            Ok(()) => {}
            Err(e) if e.is_stale() => {
                // The other side resolved it between our read and our write.
                tracing::debug!("Lost race to {} {}: {}", action.as_str(), invite_id, e);
                if let Err(e) = self.load(invite_id).await {
                    tracing::warn!("Re-read of {} failed: {}", invite_id, e);
                }
                self.settle(invite_id);
                return Ok(ActionOutcome::Stale);
            }
            Err(e) => {
                tracing::error!("Failed to {} invite {}: {}", action.as_str(), invite_id, e);
                if action == InviteAction::Expire {
                    self.settle(invite_id);
                } else {
                    self.ui.show_info(format!("Failed to {} challenge", action.as_str()));
                }
                return Err(e);
            }
        }

        self.machines.insert(invite_id.to_string(), next.clone());
        self.settle(invite_id);
        tracing::info!("Invite {} {} by {}", invite_id, updated.state, self.me());

        if action == InviteAction::Accept {
            let challenger = self.opponent_name(&next).await;
            self.post_acceptance_message(&updated, &challenger).await;
            self.handoff.hand_off(&updated, Some(&challenger)).await;
        }

        Ok(ActionOutcome::Applied(updated))
    }

    /// Reads the latest row and folds it into the local machine.
    async fn load(&self, invite_id: &str) -> Result<(InviteMachine, MatchInvite)> {
        let row = self
            .store
            .get_invite(invite_id)
            .await?
            .ok_or_else(|| LobbyError::NotFound(invite_id.to_string()))?;

        let mut machine = match self.machine(invite_id) {
            Some(machine) => machine,
            None => InviteMachine::new(&row, self.me()).ok_or_else(|| LobbyError::NotParticipant {
                user_id: self.me().to_string(),
                invite_id: invite_id.to_string(),
                action: "view",
            })?,
        };
        machine.observe(row.state);
        self.machines.insert(invite_id.to_string(), machine.clone());
        Ok((machine, row))
    }

    /// Reacts to a row change on an invite this user takes part in.
    pub async fn handle_change(self: &Arc<Self>, change: RowChange) {
        let row = change.row;
        if !row.is_multiplayer() || !row.involves(self.me()) {
            return;
        }

        match change.kind {
            ChangeKind::Insert => {
                if row.state == InviteState::Pending && row.to_user_id == self.me() {
                    self.present_incoming(row).await;
                } else if row.from_user_id == self.me() {
                    self.track(&row, None);
                }
            }
            ChangeKind::Update => self.on_update(row).await,
        }
    }

    /// Shows the newest pending invite addressed to us, if any.
    pub async fn restore_pending(self: &Arc<Self>) {
        match self.store.latest_pending_for(self.me()).await {
            Ok(Some(row)) => self.present_incoming(row).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("Pending invite restore failed for {}: {}", self.me(), e),
        }
    }

    async fn present_incoming(self: &Arc<Self>, row: MatchInvite) {
        if let Some(machine) = self.machine(&row.id) {
            if machine.state.is_terminal() {
                tracing::debug!("Dropping stale insert for {}", row.id);
                return;
            }
        }

        let from_username = self.resolve_username(&row.from_user_id).await;
        let Some(machine) = self.track(&row, Some(&from_username)) else {
            return;
        };
        if machine.state.is_terminal() {
            return;
        }

        if self.open_dialog(&row.id, &row.from_user_id) {
            self.ui.receive_invite(IncomingInvite {
                invite_id: row.id.clone(),
                from_user_id: row.from_user_id.clone(),
                from_username,
            });
            self.start_expiry(&row.id);
        } else {
            tracing::debug!("Invite {} collapsed into an open dialog", row.id);
        }
    }

    async fn on_update(self: &Arc<Self>, row: MatchInvite) {
        // Event order is not trusted; go by the latest stored row.
        let row = match self.store.get_invite(&row.id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => row,
            Err(e) => {
                tracing::warn!("Re-read of {} failed, using event payload: {}", row.id, e);
                row
            }
        };

        let mut machine = match self.machine(&row.id) {
            Some(machine) => machine,
            None => match InviteMachine::new(&row, self.me()) {
                Some(machine) => machine,
                None => return,
            },
        };
        let observation = machine.observe(row.state);
        self.machines.insert(row.id.clone(), machine.clone());

        if observation == Observation::Stale {
            tracing::debug!("Stale update for {} ({})", row.id, row.state);
            return;
        }

        match row.state {
            InviteState::Pending => {}
            InviteState::Cancelled => {
                self.settle(&row.id);
                if machine.role == InviteRole::Sender && observation != Observation::Unchanged {
                    let name = self.opponent_name(&machine).await;
                    self.ui.show_info(format!("{} declined your challenge", name));
                }
            }
            InviteState::Accepted => {
                self.settle(&row.id);
                self.handoff.on_invite_accepted(&row).await;
            }
        }
    }

    /// Registers (or refreshes) the local machine for a row. `None` when we
    /// are not a party to it.
    fn track(&self, row: &MatchInvite, opponent_username: Option<&str>) -> Option<InviteMachine> {
        let mut machine = match self.machine(&row.id) {
            Some(machine) => machine,
            None => InviteMachine::new(row, self.me())?,
        };
        machine.observe(row.state);
        if let Some(name) = opponent_username {
            machine.opponent_username = Some(name.to_string());
        }
        self.machines.insert(row.id.clone(), machine.clone());
        Some(machine)
    }

    /// Claims the popup for an invite. Returns false when it is already shown
    /// or when a dialog for the same opponent is open.
    fn open_dialog(&self, invite_id: &str, other_user_id: &str) -> bool {
        let mut active = self.lock_active();
        if let Some(dialog) = active.as_ref() {
            if dialog.invite_id == invite_id || dialog.other_user_id == other_user_id {
                return false;
            }
        }
        *active = Some(ActiveDialog {
            invite_id: invite_id.to_string(),
            other_user_id: other_user_id.to_string(),
        });
        true
    }

    /// Clears the timer and any popup for a resolved invite.
    fn settle(&self, invite_id: &str) {
        self.cancel_expiry(invite_id);

        let closed = {
            let mut active = self.lock_active();
            match active.as_ref() {
                Some(dialog) if dialog.invite_id == invite_id => {
                    *active = None;
                    true
                }
                _ => false,
            }
        };
        if closed {
            self.ui.clear_invite();
        }
    }

    fn start_expiry(self: &Arc<Self>, invite_id: &str) {
        if self.timers.contains_key(invite_id) {
            return;
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.timers.insert(invite_id.to_string(), cancel_tx);

        let coordinator = Arc::downgrade(self);
        let expiry = self.expiry;
        let invite_id = invite_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(expiry) => {
                    let Some(coordinator) = coordinator.upgrade() else {
                        return;
                    };
                    coordinator.timers.remove(&invite_id);
                    match coordinator.expire(&invite_id).await {
                        Ok(ActionOutcome::Applied(_)) => tracing::info!("Invite {} expired", invite_id),
                        Ok(ActionOutcome::Stale) => {}
                        Err(e) => tracing::warn!("Invite {} expiry failed: {}", invite_id, e),
                    }
                }
                _ = cancel_rx.changed() => {}
            }
        });
    }

    fn cancel_expiry(&self, invite_id: &str) {
        if let Some((_, cancel)) = self.timers.remove(invite_id) {
            let _ = cancel.send(true);
        }
    }

    async fn opponent_name(&self, machine: &InviteMachine) -> String {
        match &machine.opponent_username {
            Some(name) => name.clone(),
            None => self.resolve_username(&machine.opponent_id).await,
        }
    }

    async fn resolve_username(&self, user_id: &str) -> String {
        match self.profiles.username(user_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!("Username lookup failed for {}: {}", user_id, e);
                FALLBACK_OPPONENT.to_string()
            }
        }
    }

    async fn post_acceptance_message(&self, invite: &MatchInvite, challenger: &str) {
        let language = match &self.identity.language {
            Some(language) => language.clone(),
            None => match self.profiles.language(self.me()).await {
                Ok(Some(language)) => language,
                Ok(None) => self.default_language.clone(),
                Err(e) => {
                    tracing::warn!("Language lookup failed for {}: {}", self.me(), e);
                    self.default_language.clone()
                }
            },
        };

        let message = SystemMessage {
            user_id: self.me().to_string(),
            username: self.identity.username.clone(),
            message: acceptance_message(&language, &self.identity.username, challenger),
            match_id: invite.id.clone(),
            from_user: invite.from_user_id.clone(),
            to_user: invite.to_user_id.clone(),
        };
        if let Err(e) = self.chat.post_system(message).await {
            tracing::warn!("Failed to post acceptance message for {}: {}", invite.id, e);
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveDialog>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}
