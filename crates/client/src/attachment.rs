//! The two ways media is attached to a peer transport. One style is chosen
//! per transport from its capabilities and used for both directions for the
//! transport's whole lifetime.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::NegotiationError;
use crate::media::MediaStream;
use crate::transport::{PeerTransport, RemoteMedia, TransportCapabilities};

#[async_trait]
pub trait AttachmentStyle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attach_local(
        &self,
        transport: &dyn PeerTransport,
        local: &MediaStream,
    ) -> Result<(), NegotiationError>;

    /// Fold inbound media into `remote`. Returns true if it was accepted.
    fn accept_remote(
        &self,
        remote: &mut Option<MediaStream>,
        media: RemoteMedia,
        remote_stream_id: &str,
    ) -> bool;
}

/// Pick the style for a new transport. Whole-stream wins when available.
pub fn select(capabilities: TransportCapabilities) -> Box<dyn AttachmentStyle> {
    if capabilities.stream_attachment {
        Box::new(StreamAttachment)
    } else {
        Box::new(TrackAttachment)
    }
}

/// Legacy style: the local stream is attached as a whole, the peer's media
/// arrives as a whole stream.
pub struct StreamAttachment;

#[async_trait]
impl AttachmentStyle for StreamAttachment {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn attach_local(
        &self,
        transport: &dyn PeerTransport,
        local: &MediaStream,
    ) -> Result<(), NegotiationError> {
        transport.add_stream(local).await
    }

    fn accept_remote(
        &self,
        remote: &mut Option<MediaStream>,
        media: RemoteMedia,
        _remote_stream_id: &str,
    ) -> bool {
        match media {
            RemoteMedia::Stream(stream) => {
                debug!(stream = stream.id(), "Remote stream attached");
                *remote = Some(stream);
                true
            }
            RemoteMedia::Track(track) => {
                warn!(track = track.id(), "Ignoring per-track media on a whole-stream transport");
                false
            }
        }
    }
}

/// Modern style: each local track is attached individually, the peer's
/// tracks are collected into one remote stream as they arrive.
pub struct TrackAttachment;

#[async_trait]
impl AttachmentStyle for TrackAttachment {
    fn name(&self) -> &'static str {
        "track"
    }

    async fn attach_local(
        &self,
        transport: &dyn PeerTransport,
        local: &MediaStream,
    ) -> Result<(), NegotiationError> {
        for track in local.tracks() {
            transport.add_track(&track).await?;
        }
        Ok(())
    }

    fn accept_remote(
        &self,
        remote: &mut Option<MediaStream>,
        media: RemoteMedia,
        remote_stream_id: &str,
    ) -> bool {
        match media {
            RemoteMedia::Track(track) => {
                debug!(track = track.id(), kind = track.kind().as_str(), "Remote track attached");
                remote
                    .get_or_insert_with(|| MediaStream::new(remote_stream_id))
                    .add_track(track);
                true
            }
            RemoteMedia::Stream(stream) => {
                warn!(stream = stream.id(), "Ignoring whole-stream media on a per-track transport");
                false
            }
        }
    }
}
