//! The peer media transport seam. [`crate::rtc`] implements it with the
//! `webrtc` crate; tests use an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;
use duet_protocol::{IceConfig, IceCandidate};

use crate::error::NegotiationError;
use crate::media::{MediaStream, MediaTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// One ICE server entry handed to the transport at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Discovery (STUN) plus relay (TURN) servers for NAT traversal.
pub fn ice_servers(config: &IceConfig) -> Vec<IceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(IceServer {
            urls: config.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }
    if !config.turn_urls.is_empty() {
        servers.push(IceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone(),
            credential: config.turn_credential.clone(),
        });
    }
    servers
}

/// What the runtime's transport supports for attaching media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Legacy whole-stream attachment (`addStream`/`onaddstream` style)
    pub stream_attachment: bool,
}

/// Inbound media as the transport reports it.
#[derive(Debug, Clone)]
pub enum RemoteMedia {
    Stream(MediaStream),
    Track(MediaTrack),
}

/// Asynchronous happenings on a transport, delivered to the controller.
#[derive(Debug)]
pub enum TransportEvent {
    /// Our description is applied and ready to forward to the peer
    LocalDescription { kind: SdpKind, sdp: String },
    /// Trickled local candidate; `None` ends the stream
    LocalCandidate(Option<IceCandidate>),
    RemoteMedia(RemoteMedia),
    Failed(NegotiationError),
}

/// Callback a transport uses to report events. Must be cheap and non-blocking.
pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_stream(&self, _stream: &MediaStream) -> Result<(), NegotiationError> {
        Err(NegotiationError::Unsupported("whole-stream attachment"))
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<String, NegotiationError>;

    async fn create_answer(&self) -> Result<String, NegotiationError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str)
    -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NegotiationError>;

    /// `None` is the end-of-candidates marker and must not fail.
    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError>;

    /// Unhook every event callback so nothing fires after teardown.
    fn detach_handlers(&self);

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Probed once per transport to choose the attachment style.
    fn capabilities(&self) -> TransportCapabilities;

    async fn create(
        &self,
        ice_servers: &[IceServer],
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError>;
}
