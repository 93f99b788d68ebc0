//! Peer transport backed by the `webrtc` crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use duet_protocol::IceCandidate;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::media::{MediaTrack, TrackKind, TrackSource};
use crate::transport::{
    IceServer, PeerTransport, RemoteMedia, SdpKind, TransportCapabilities, TransportEvent,
    TransportFactory, TransportSink,
};

fn transport_err(context: &str, e: webrtc::Error) -> NegotiationError {
    NegotiationError::Transport(format!("{context}: {e}"))
}

/// Creates one `RTCPeerConnection` per match.
#[derive(Default)]
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    fn capabilities(&self) -> TransportCapabilities {
        // webrtc-rs only offers per-track attachment
        TransportCapabilities {
            stream_attachment: false,
        }
    }

    async fn create(
        &self,
        ice_servers: &[IceServer],
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| transport_err("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| transport_err("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| transport_err("Failed to create peer connection", e))?,
        );

        let transport = RtcTransport {
            peer_connection,
            detached: Arc::new(AtomicBool::new(false)),
        };
        transport.attach_handlers(sink);
        info!(ice_servers = ice_servers.len(), "WebRTC peer connection created");
        Ok(Arc::new(transport))
    }
}

pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    /// Set before handlers are swapped out so in-flight callbacks stay quiet
    detached: Arc<AtomicBool>,
}

impl RtcTransport {
    fn attach_handlers(&self, sink: TransportSink) {
        let emit = {
            let detached = Arc::clone(&self.detached);
            Arc::new(move |event: TransportEvent| {
                if !detached.load(Ordering::Acquire) {
                    sink(event);
                }
            })
        };

        let on_candidate = Arc::clone(&emit);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                match candidate {
                    None => on_candidate(TransportEvent::LocalCandidate(None)),
                    Some(c) => match c.to_json() {
                        Ok(json) => on_candidate(TransportEvent::LocalCandidate(Some(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }))),
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    },
                }
                Box::pin(async {})
            }));

        let on_track = Arc::clone(&emit);
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                let media = MediaTrack::new(
                    format!("{}-{}", track.stream_id(), track.id()),
                    kind,
                    TrackSource::Remote(Arc::clone(&track)),
                );
                info!(track = media.id(), kind = kind.as_str(), "Remote track arrived");
                on_track(TransportEvent::RemoteMedia(RemoteMedia::Track(media.clone())));

                // Keep the receive pipeline drained; the track ends with it
                Box::pin(async move {
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        media.end();
                        debug!(track = media.id(), "Remote track ended");
                    });
                })
            }));

        let on_state = emit;
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                match state {
                    RTCPeerConnectionState::Failed => {
                        warn!("Peer connection failed");
                        on_state(TransportEvent::Failed(NegotiationError::Transport(
                            "ICE connectivity failed".to_string(),
                        )));
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!("Peer connection disconnected (ICE reconnecting)");
                    }
                    _ => {
                        info!(?state, "Peer connection state changed");
                    }
                }
                Box::pin(async {})
            }));
    }

    fn description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, NegotiationError> {
        let parsed = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        };
        parsed.map_err(|e| NegotiationError::Description(e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let TrackSource::Local(sample) = track.source() else {
            return Err(NegotiationError::Unsupported("sending a non-local track"));
        };
        let sender = self
            .peer_connection
            .add_track(Arc::clone(sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_err("Failed to add track", e))?;

        // RTCP has to be read for interceptors (NACK, reports) to work
        tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
        debug!(track = track.id(), kind = track.kind().as_str(), "Local track attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| transport_err("Failed to create offer", e))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| transport_err("Failed to create answer", e))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), NegotiationError> {
        let desc = Self::description(kind, sdp)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::Description(format!("local {}: {e}", kind.as_str())))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), NegotiationError> {
        let desc = Self::description(kind, sdp)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Description(format!("remote {}: {e}", kind.as_str())))
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        // webrtc-rs has no end-of-candidates call; the marker needs no action
        let Some(candidate) = candidate else {
            debug!("Remote end of candidates");
            return Ok(());
        };
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    fn detach_handlers(&self) {
        self.detached.store(true, Ordering::Release);
        self.peer_connection
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.peer_connection
            .on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.peer_connection
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {e}");
        } else {
            info!("Peer connection closed");
        }
    }
}
