use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::backend::Backend;
use crate::bridge::SocketUi;
use crate::handoff::{self, MemoryStorage, SessionHandoff, SocketNavigator};
use crate::invite::InviteCoordinator;
use crate::presence::{PresenceEvent, PresenceTracker, RetryPolicy};
use crate::store::{ChangeFilter, MatchStore};
use crate::types::*;

/// Commands the WebSocket handler sends to a client task.
#[derive(Debug, Clone)]
pub enum LobbyCommand {
    Challenge { user_id: UserId, username: String },
    Accept { invite_id: InviteId },
    Decline { invite_id: InviteId },
    Cancel { invite_id: InviteId },
    SetStatus { status: PresenceStatus },
    Search { query: String },
    ViewProfile { user_id: UserId },
    TakeSession,
}

impl From<ClientMsg> for LobbyCommand {
    fn from(msg: ClientMsg) -> Self {
        match msg {
            ClientMsg::Challenge { user_id, username } => Self::Challenge { user_id, username },
            ClientMsg::Accept { invite_id } => Self::Accept { invite_id },
            ClientMsg::Decline { invite_id } => Self::Decline { invite_id },
            ClientMsg::Cancel { invite_id } => Self::Cancel { invite_id },
            ClientMsg::SetStatus { status } => Self::SetStatus { status },
            ClientMsg::Search { query } => Self::Search { query },
            ClientMsg::ViewProfile { user_id } => Self::ViewProfile { user_id },
            ClientMsg::TakeSession => Self::TakeSession,
        }
    }
}

#[derive(Clone)]
pub struct ClientHandle {
    pub user_id: UserId,
    pub cmd_tx: mpsc::Sender<LobbyCommand>,
}

/// One connected user: presence tracker, invite coordinator and handoff.
struct LobbyClient {
    identity: PlayerIdentity,
    store: Arc<dyn MatchStore>,
    presence: Arc<PresenceTracker>,
    coordinator: Arc<InviteCoordinator>,
    storage: Arc<MemoryStorage>,
    out: mpsc::UnboundedSender<ServerMsg>,
    resync: Duration,
}

impl LobbyClient {
    fn send(&self, msg: ServerMsg) {
        let _ = self.out.send(msg);
    }

    fn send_roster(&self, users: Vec<PresenceEntry>) {
        self.send(ServerMsg::Roster { users });
    }

    async fn handle_command(&self, cmd: LobbyCommand) {
        let result = match cmd {
            LobbyCommand::Challenge { user_id, username } => {
                self.coordinator.challenge(&user_id, &username).await.map(|_| ())
            }
            LobbyCommand::Accept { invite_id } => self.coordinator.accept(&invite_id).await.map(|_| ()),
            LobbyCommand::Decline { invite_id } => self.coordinator.decline(&invite_id).await.map(|_| ()),
            LobbyCommand::Cancel { invite_id } => self.coordinator.cancel(&invite_id).await.map(|_| ()),
            LobbyCommand::SetStatus { status } if status == self.presence.status() => Ok(()),
            LobbyCommand::SetStatus { status } => self.presence.update_own_status(status).await,
            LobbyCommand::Search { query } => {
                self.send(ServerMsg::SearchResults {
                    users: self.presence.search(&query),
                });
                Ok(())
            }
            LobbyCommand::ViewProfile { user_id } => {
                self.send(ServerMsg::PlayerProfile {
                    user: self.presence.find(&user_id),
                });
                Ok(())
            }
            LobbyCommand::TakeSession => {
                self.send(ServerMsg::Session {
                    session: handoff::take_session(self.storage.as_ref()),
                });
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!("Command from {} failed: {}", self.identity.user_id, e);
        }
    }

    async fn connect_presence(&self) -> Option<broadcast::Receiver<PresenceEvent>> {
        let joined = self.presence.connect().await;
        self.presence_joined(joined)
    }

    async fn reconnect_presence(&self) -> Option<broadcast::Receiver<PresenceEvent>> {
        let joined = self.presence.reconnect().await;
        self.presence_joined(joined)
    }

    fn presence_joined(
        &self,
        joined: crate::error::Result<broadcast::Receiver<PresenceEvent>>,
    ) -> Option<broadcast::Receiver<PresenceEvent>> {
        match joined {
            Ok(rx) => {
                self.send_roster(self.presence.roster());
                Some(rx)
            }
            Err(e) => {
                self.send(ServerMsg::ConnectionError {
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

/// Builds a client for `identity` on the shared backend and spawns its task.
pub fn spawn_client(
    backend: &Arc<Backend>,
    identity: PlayerIdentity,
    out: mpsc::UnboundedSender<ServerMsg>,
) -> ClientHandle {
    let config = &backend.config;
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    backend
        .store
        .upsert_profile(&identity.user_id, &identity.username, identity.language.as_deref());

    let presence = Arc::new(PresenceTracker::new(
        backend.presence.clone(),
        identity.clone(),
        RetryPolicy::from_config(config),
    ));
    let ui = Arc::new(SocketUi::new(
        out.clone(),
        config.invite_expiry_secs,
        config.sent_notice_ms,
        config.info_notice_ms,
    ));
    let storage = backend.session_storage(&identity.user_id);
    let handoff = Arc::new(SessionHandoff::new(
        presence.clone(),
        backend.store.clone(),
        storage.clone(),
        Arc::new(SocketNavigator::new(out.clone())),
        config.status_grace(),
        config.entry_path.clone(),
    ));
    let coordinator = InviteCoordinator::new(
        identity.clone(),
        backend.store.clone(),
        backend.store.clone(),
        backend.store.clone(),
        ui,
        handoff,
        config,
    );

    let client = LobbyClient {
        identity: identity.clone(),
        store: backend.store.clone(),
        presence,
        coordinator,
        storage,
        out,
        resync: config.resync_interval(),
    };
    tokio::spawn(client_task(client, cmd_rx));

    tracing::info!("Lobby client started: {} ({})", identity.username, identity.user_id);

    ClientHandle {
        user_id: identity.user_id,
        cmd_tx,
    }
}

async fn next_presence(
    rx: &mut Option<broadcast::Receiver<PresenceEvent>>,
) -> Result<PresenceEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn client_task(client: LobbyClient, mut cmd_rx: mpsc::Receiver<LobbyCommand>) {
    // Subscribe before the restore so nothing slips between the two.
    let mut feed = client
        .store
        .subscribe(ChangeFilter::Participant(client.identity.user_id.clone()));
    let mut presence_rx = client.connect_presence().await;
    client.coordinator.restore_pending().await;

    let mut resync = tokio::time::interval(client.resync);
    resync.tick().await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => client.handle_command(cmd).await,
                None => break,
            },
            change = feed.recv() => match change {
                Some(change) => client.coordinator.handle_change(change).await,
                None => break,
            },
            event = next_presence(&mut presence_rx) => match event {
                Ok(event) => {
                    let users = client.presence.on_membership_changed(&event);
                    client.send_roster(users);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    client.send_roster(client.presence.rebuild());
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Presence channel closed for {}, reconnecting", client.identity.user_id);
                    presence_rx = client.reconnect_presence().await;
                }
            },
            _ = resync.tick() => {
                client.send_roster(client.presence.rebuild());
            }
        }
    }

    client.presence.leave().await;
    tracing::info!("Lobby client {} task ended", client.identity.user_id);
}
