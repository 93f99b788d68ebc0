use serde::{Deserialize, Serialize};

/// Account classification announced to the relay during identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "member")]
    Member,
    #[default]
    #[serde(rename = "non-member")]
    Guest,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Member => "member",
            AccountType::Guest => "non-member",
        }
    }
}

/// Identity payload of the `identify` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub name: String,
    pub account_type: AccountType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A trickled ICE candidate, in the shape browsers produce with `toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Events sent from a client to the matchmaking relay.
///
/// Adjacently tagged: `{"event":"offer","data":{"sdp":"..."}}`. Events
/// without a payload carry no `data` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Announce identity right after the transport connects
    Identify(Identify),
    /// Request matchmaking
    Queue,
    /// Cancel matchmaking
    Unqueue,
    /// Leave the current match
    Leave,
    /// Clear the relay's pairing-affinity cache for this client
    Forget,
    Offer { sdp: String },
    Answer { sdp: String },
    /// `candidate: null` marks the end of the local candidate stream
    #[serde(rename = "icecandidate")]
    IceCandidate { candidate: Option<IceCandidate> },
}

impl ClientMessage {
    /// Wire event name, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Identify(_) => "identify",
            ClientMessage::Queue => "queue",
            ClientMessage::Unqueue => "unqueue",
            ClientMessage::Leave => "leave",
            ClientMessage::Forget => "forget",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "icecandidate",
        }
    }

    pub fn to_text(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }
}

/// Events sent from the matchmaking relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RelayMessage {
    /// Identity accepted; echoes the connection id the relay assigned
    IdentifyAck { assigned_connection_id: String },
    /// Pairing established. Exactly one side of a room gets `is_offerer`.
    Match {
        room_id: String,
        remote_name: String,
        #[serde(default)]
        is_offerer: bool,
    },
    Offer { sdp: String },
    Answer { sdp: String },
    #[serde(rename = "icecandidate")]
    IceCandidate { candidate: Option<IceCandidate> },
    /// The matched peer departed, voluntarily or by timeout
    Leave {
        remote_connection_id: String,
        #[serde(default)]
        is_timeout: bool,
    },
    /// Transport-level channel loss
    Disconnect { reason: String },
}

impl RelayMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayMessage::IdentifyAck { .. } => "identifyAck",
            RelayMessage::Match { .. } => "match",
            RelayMessage::Offer { .. } => "offer",
            RelayMessage::Answer { .. } => "answer",
            RelayMessage::IceCandidate { .. } => "icecandidate",
            RelayMessage::Leave { .. } => "leave",
            RelayMessage::Disconnect { .. } => "disconnect",
        }
    }

    pub fn from_text(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(WireError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode client message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed relay message: {0}")]
    Decode(#[source] serde_json::Error),
}
