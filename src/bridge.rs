//! Capability interface the invite coordinator uses to drive popup UI.
//!
//! Anything that needs to open or close the invite popup depends on
//! [`InviteUi`] instead of reaching for shared global state.

use tokio::sync::mpsc;

use crate::types::*;

/// Incoming invite awaiting the local user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingInvite {
    pub invite_id: InviteId,
    pub from_user_id: UserId,
    pub from_username: String,
}

/// A pending invite found while trying to challenge the same user again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    pub invite_id: InviteId,
    pub other_user_id: UserId,
    pub other_username: String,
    pub direction: InviteDirection,
}

pub trait InviteUi: Send + Sync {
    fn receive_invite(&self, invite: IncomingInvite);
    fn show_pending_invite(&self, invite: PendingInvite);
    /// Transient "challenge sent" confirmation.
    fn show_sent(&self, message: String);
    /// Transient informational notice.
    fn show_info(&self, message: String);
    fn clear_invite(&self);
}

/// Forwards popup commands to a WebSocket connection.
pub struct SocketUi {
    tx: mpsc::UnboundedSender<ServerMsg>,
    expires_in: u64,
    sent_notice_ms: u64,
    info_notice_ms: u64,
}

impl SocketUi {
    pub fn new(
        tx: mpsc::UnboundedSender<ServerMsg>,
        expires_in: u64,
        sent_notice_ms: u64,
        info_notice_ms: u64,
    ) -> Self {
        Self {
            tx,
            expires_in,
            sent_notice_ms,
            info_notice_ms,
        }
    }

    fn send(&self, msg: ServerMsg) {
        // Receiver gone means the socket closed; nothing left to show.
        let _ = self.tx.send(msg);
    }
}

impl InviteUi for SocketUi {
    fn receive_invite(&self, invite: IncomingInvite) {
        self.send(ServerMsg::IncomingInvite {
            invite_id: invite.invite_id,
            from_user_id: invite.from_user_id,
            from_username: invite.from_username,
            expires_in: self.expires_in,
        });
    }

    fn show_pending_invite(&self, invite: PendingInvite) {
        let message = match invite.direction {
            InviteDirection::Received => {
                format!("You have a pending challenge from {}", invite.other_username)
            }
            InviteDirection::Sent => format!("You already challenged {}", invite.other_username),
        };
        self.send(ServerMsg::PendingInvite {
            invite_id: invite.invite_id,
            other_user_id: invite.other_user_id,
            other_username: invite.other_username,
            direction: invite.direction,
            message,
        });
    }

    fn show_sent(&self, message: String) {
        self.send(ServerMsg::ChallengeSent {
            message,
            dismiss_after_ms: self.sent_notice_ms,
        });
    }

    fn show_info(&self, message: String) {
        self.send(ServerMsg::Info {
            message,
            dismiss_after_ms: self.info_notice_ms,
        });
    }

    fn clear_invite(&self) {
        self.send(ServerMsg::ClearInvite);
    }
}
