//! Client side of a paired video chat: captures local media, identifies with
//! a matchmaking relay, waits in its queue and negotiates a peer-to-peer
//! media session with whoever it is matched with.
//!
//! [`SessionController`] owns all state. The rendering layer drives it
//! through a [`SessionHandle`] and observes it through [`SessionSnapshot`]s
//! and [`Notice`]s.

mod attachment;
mod controller;
mod error;
mod event;
mod media;
mod names;
mod negotiator;
mod queue;
mod rtc;
mod session;
mod signaling;
#[cfg(test)]
mod testing;
mod transport;

pub use attachment::{AttachmentStyle, StreamAttachment, TrackAttachment};
pub use controller::{Components, ControllerSettings, SessionController, SessionHandle};
pub use error::{CaptureError, NegotiationError, SessionClosed, SignalingError};
pub use event::{ChannelId, Command, TransportId};
pub use media::{
    MediaConstraints, MediaDevice, MediaStream, MediaTrack, SampleDevice, TrackKind, TrackSource,
    TrackState,
};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use session::{Notice, NoticeLevel, SessionSnapshot, Status};
pub use signaling::{RelayConnector, RelayLink, WsRelayConnector};
pub use transport::{
    IceServer, PeerTransport, RemoteMedia, SdpKind, TransportCapabilities, TransportEvent,
    TransportFactory, TransportSink, ice_servers,
};
