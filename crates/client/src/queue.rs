//! Matchmaking requests and remote-departure handling.
//!
//! The coordinator validates each request against the session status and
//! puts the corresponding message on the signaling channel. It returns the
//! status the controller should move to; the controller does the teardown.

use duet_protocol::ClientMessage;
use tracing::{debug, info};

use crate::session::{Notice, Status};
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum QueueError {
    #[error("{op} is not available while {status}")]
    InvalidState { op: &'static str, status: Status },
    #[error("{0} needs a signaling channel")]
    NoChannel(&'static str),
}

pub(crate) struct QueueCoordinator;

impl QueueCoordinator {
    fn send(
        op: &'static str,
        channel: Option<&SignalingChannel>,
        msg: ClientMessage,
    ) -> Result<(), QueueError> {
        let channel = channel.ok_or(QueueError::NoChannel(op))?;
        channel.send(msg);
        Ok(())
    }

    pub fn join(
        &self,
        status: Status,
        channel: Option<&SignalingChannel>,
    ) -> Result<Status, QueueError> {
        if status != Status::Ready {
            return Err(QueueError::InvalidState { op: "join", status });
        }
        Self::send("join", channel, ClientMessage::Queue)?;
        info!("Joined matchmaking queue");
        Ok(Status::Queued)
    }

    pub fn leave(
        &self,
        status: Status,
        channel: Option<&SignalingChannel>,
    ) -> Result<Status, QueueError> {
        if status != Status::Queued {
            return Err(QueueError::InvalidState { op: "leave", status });
        }
        Self::send("leave", channel, ClientMessage::Unqueue)?;
        info!("Left matchmaking queue");
        Ok(Status::Ready)
    }

    /// Tell the peer's side we are moving on. The caller tears down the
    /// transport and remote state.
    pub fn skip(
        &self,
        status: Status,
        channel: Option<&SignalingChannel>,
    ) -> Result<Status, QueueError> {
        if !status.is_matched() {
            return Err(QueueError::InvalidState { op: "skip", status });
        }
        Self::send("skip", channel, ClientMessage::Leave)?;
        info!("Skipping current partner");
        Ok(Status::Queued)
    }

    /// Ask the relay to drop our recent-pairing history. No local effect.
    pub fn forget(&self, channel: Option<&SignalingChannel>) -> Result<Notice, QueueError> {
        Self::send("forget", channel, ClientMessage::Forget)?;
        Ok(Notice::info("Removed skip/next cache"))
    }

    /// The matched peer went away. Acknowledges with a leave and returns the
    /// notice to show, or `None` if the event does not concern us.
    pub fn departure(
        &self,
        status: Status,
        channel: Option<&SignalingChannel>,
        remote_connection_id: &str,
        remote_identity: &str,
        is_timeout: bool,
    ) -> Option<Notice> {
        let own = channel.and_then(SignalingChannel::connection_id);
        if own == Some(remote_connection_id) {
            debug!(remote_connection_id, "Ignoring echo of our own leave");
            return None;
        }
        if !status.is_matched() {
            debug!(remote_connection_id, %status, "Ignoring leave outside a match");
            return None;
        }
        // Acknowledge so the relay closes the room on our side too
        let _ = Self::send("leave", channel, ClientMessage::Leave);
        info!(remote_connection_id, is_timeout, "Partner left");
        Some(if is_timeout {
            Notice::info(format!("{remote_identity} disconnected"))
        } else {
            Notice::info(format!("{remote_identity} left"))
        })
    }

    /// Abandon a failed negotiation as if the peer had left.
    pub fn abandon(&self, channel: Option<&SignalingChannel>) {
        let _ = Self::send("abandon", channel, ClientMessage::Leave);
    }
}
