//! Failure taxonomy of the session client.
//!
//! None of these cross the controller boundary: every one is converted into
//! a state transition plus a user-visible [`Notice`](crate::session::Notice).

/// Local media capture failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Relay channel could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("relay connection failed: {0}")]
    Connect(String),
}

/// One negotiation attempt failed; the attempt is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    Description(String),
    #[error("invalid ICE candidate: {0}")]
    Candidate(String),
    #[error("unexpected {0} for the current negotiation role")]
    Unexpected(&'static str),
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
    #[error("negotiation did not complete within {0} seconds")]
    Timeout(u64),
}

/// The controller loop has shut down and no longer accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session controller is no longer running")]
pub struct SessionClosed;
