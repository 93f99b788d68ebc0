use std::fmt;

use duet_protocol::AccountConfig;

use crate::media::MediaStream;

/// Lifecycle of a chat session.
///
/// ```text
/// idle -> acquiring-media -> connecting-channel -> ready <-> queued -> negotiating -> connected
///              |   ^                ^                                      |              |
///              v   |                +------- channel loss (media held) ----+--------------+
///          media-error                                  queued <- skip / peer left / failure
/// ```
/// Every non-idle state may also drop straight back to `idle` on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Idle,
    AcquiringMedia,
    MediaError,
    ConnectingChannel,
    Ready,
    Queued,
    Negotiating,
    Connected,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Idle,
        Status::AcquiringMedia,
        Status::MediaError,
        Status::ConnectingChannel,
        Status::Ready,
        Status::Queued,
        Status::Negotiating,
        Status::Connected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::AcquiringMedia => "acquiring-media",
            Status::MediaError => "media-error",
            Status::ConnectingChannel => "connecting-channel",
            Status::Ready => "ready",
            Status::Queued => "queued",
            Status::Negotiating => "negotiating",
            Status::Connected => "connected",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Idle | MediaError, AcquiringMedia) => true,
            (AcquiringMedia, MediaError | ConnectingChannel) => true,
            (ConnectingChannel, Ready) => true,
            (Ready, Queued) | (Queued, Ready) | (Queued, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Negotiating | Connected, Queued) => true,
            // Channel loss with media held restarts the handshake
            (Ready | Queued | Negotiating | Connected, ConnectingChannel) => true,
            (from, Idle) => from != Idle,
            _ => false,
        }
    }

    /// States in which a remote identity may be set.
    pub fn is_matched(self) -> bool {
        matches!(self, Status::Negotiating | Status::Connected)
    }

    /// States in which local media may be held.
    pub fn may_hold_media(self) -> bool {
        !matches!(self, Status::Idle | Status::MediaError | Status::AcquiringMedia)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single mutable session record. Written only by the controller.
#[derive(Debug)]
pub(crate) struct Session {
    pub status: Status,
    pub local_identity: String,
    pub local_media: Option<MediaStream>,
    pub remote_identity: String,
    pub remote_media: Option<MediaStream>,
    pub account: Option<AccountConfig>,
}

impl Session {
    pub fn new(local_identity: String, account: Option<AccountConfig>) -> Self {
        Self {
            status: Status::Idle,
            local_identity,
            local_media: None,
            remote_identity: String::new(),
            remote_media: None,
            account,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            local_identity: self.local_identity.clone(),
            local_media: self.local_media.clone(),
            remote_identity: self.remote_identity.clone(),
            remote_media: self.remote_media.clone(),
            signed_in: self.account.is_some(),
        }
    }
}

/// Read-only view of the session published to subscribers after every
/// handled event that changed it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: Status,
    pub local_identity: String,
    pub local_media: Option<MediaStream>,
    pub remote_identity: String,
    pub remote_media: Option<MediaStream>,
    pub signed_in: bool,
}

impl SessionSnapshot {
    pub fn can_open_media(&self) -> bool {
        matches!(self.status, Status::Idle | Status::MediaError)
    }

    pub fn can_join(&self) -> bool {
        self.status == Status::Ready
    }

    pub fn can_leave(&self) -> bool {
        self.status == Status::Queued
    }

    /// "Next" is offered for the whole match, including while the
    /// transport is still negotiating.
    pub fn can_skip(&self) -> bool {
        self.status.is_matched()
    }

    /// Caption for the remote pane, if any.
    pub fn remote_label(&self) -> Option<String> {
        match self.status {
            Status::Queued => Some("Waiting for participant...".to_string()),
            Status::Negotiating if !self.remote_identity.is_empty() => {
                Some(format!("{} | Connecting...", self.remote_identity))
            }
            Status::Connected if !self.remote_identity.is_empty() => {
                Some(self.remote_identity.clone())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A transient user-visible message (rendered as a toast by the UI layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}
