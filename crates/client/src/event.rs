//! Everything the controller reacts to arrives as one [`Event`] on a single
//! queue, handled strictly in arrival order.

use std::fmt;

use duet_protocol::RelayMessage;
use tokio::sync::mpsc;

use crate::error::{CaptureError, NegotiationError, SignalingError};
use crate::media::MediaStream;
use crate::transport::TransportEvent;

pub(crate) type EventTx = mpsc::UnboundedSender<Event>;
pub(crate) type EventRx = mpsc::UnboundedReceiver<Event>;

/// Identity of one signaling channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u64);

/// Identity of one peer transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc{}", self.0)
    }
}

/// Operations exposed to the rendering layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    OpenMedia,
    JoinQueue,
    LeaveQueue,
    Skip,
    Forget,
    Reset { keep_identity: bool },
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// Transport is up; carries the connection id the transport was given
    Connected { connection_id: String },
    Relay(RelayMessage),
    ConnectFailed(SignalingError),
    Lost { reason: String },
}

#[derive(Debug)]
pub(crate) enum Event {
    Command(Command),
    /// Result of the capture request issued by attempt `attempt`
    MediaAcquired {
        attempt: u64,
        result: Result<MediaStream, CaptureError>,
    },
    /// A local track ended from the device side
    TrackEnded { attempt: u64, track_id: String },
    Channel {
        channel: ChannelId,
        event: ChannelEvent,
    },
    /// Backoff elapsed for reconnect round `epoch`
    ReconnectDue { epoch: u64 },
    Transport {
        transport: TransportId,
        event: TransportEvent,
    },
    /// Negotiation for match `epoch` ran out of time
    NegotiationTimeout { epoch: u64, error: NegotiationError },
}
