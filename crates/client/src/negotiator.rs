//! Peer transport negotiation.
//!
//! Each transport is driven by its own task that applies negotiation steps
//! strictly in order (offer/answer, then buffered candidates). The
//! controller talks to it through [`Negotiator`] and hears back through
//! [`TransportEvent`]s tagged with the transport's id, so anything a closed
//! transport still emits is recognisably stale.

use std::sync::{Arc, Mutex};

use duet_protocol::IceCandidate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attachment::{self, AttachmentStyle};
use crate::error::NegotiationError;
use crate::event::{Event, EventTx, TransportId};
use crate::media::MediaStream;
use crate::transport::{
    IceServer, PeerTransport, RemoteMedia, SdpKind, TransportEvent, TransportFactory,
    TransportSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

enum Step {
    RemoteDescription(SdpKind, String),
    RemoteCandidate(Option<IceCandidate>),
}

type Slot = Arc<Mutex<Option<Arc<dyn PeerTransport>>>>;

struct Active {
    id: TransportId,
    role: Role,
    style: Arc<dyn AttachmentStyle>,
    steps: mpsc::UnboundedSender<Step>,
    slot: Slot,
    task: JoinHandle<()>,
}

/// Owns at most one live peer transport.
pub(crate) struct Negotiator {
    factory: Arc<dyn TransportFactory>,
    ice_servers: Arc<Vec<IceServer>>,
    next_id: u64,
    current: Option<Active>,
}

impl Negotiator {
    pub fn new(factory: Arc<dyn TransportFactory>, ice_servers: Vec<IceServer>) -> Self {
        Self {
            factory,
            ice_servers: Arc::new(ice_servers),
            next_id: 0,
            current: None,
        }
    }

    pub fn current(&self) -> Option<TransportId> {
        self.current.as_ref().map(|a| a.id)
    }

    pub fn is_current(&self, id: TransportId) -> bool {
        self.current() == Some(id)
    }

    pub fn role(&self) -> Option<Role> {
        self.current.as_ref().map(|a| a.role)
    }

    /// Replace any existing transport with a new one negotiating as `role`.
    pub fn start(&mut self, role: Role, local: Option<MediaStream>, events: EventTx) -> TransportId {
        self.close();
        self.next_id += 1;
        let id = TransportId(self.next_id);

        let style: Arc<dyn AttachmentStyle> = Arc::from(attachment::select(self.factory.capabilities()));
        let (steps, steps_rx) = mpsc::unbounded_channel();
        let slot: Slot = Arc::new(Mutex::new(None));

        let task = tokio::spawn(drive(Driver {
            id,
            role,
            factory: Arc::clone(&self.factory),
            ice_servers: Arc::clone(&self.ice_servers),
            style: Arc::clone(&style),
            local,
            slot: Arc::clone(&slot),
            steps: steps_rx,
            events,
        }));

        info!(transport = %id, ?role, style = style.name(), "Peer transport starting");
        self.current = Some(Active {
            id,
            role,
            style,
            steps,
            slot,
            task,
        });
        id
    }

    /// Hand a remote description to the current transport.
    pub fn remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), NegotiationError> {
        let Some(active) = &self.current else {
            return Err(NegotiationError::Unexpected(kind.as_str()));
        };
        let expected = match active.role {
            Role::Offerer => SdpKind::Answer,
            Role::Answerer => SdpKind::Offer,
        };
        if kind != expected {
            return Err(NegotiationError::Unexpected(kind.as_str()));
        }
        if sdp.trim().is_empty() {
            return Err(NegotiationError::Description(format!("empty {}", kind.as_str())));
        }
        let _ = active.steps.send(Step::RemoteDescription(kind, sdp));
        Ok(())
    }

    /// Queue a remote candidate. Returns false when there is no transport.
    pub fn remote_candidate(&self, candidate: Option<IceCandidate>) -> bool {
        match &self.current {
            Some(active) => active.steps.send(Step::RemoteCandidate(candidate)).is_ok(),
            None => false,
        }
    }

    /// Fold inbound media into `remote` using the transport's attachment style.
    pub fn accept_remote(&self, remote: &mut Option<MediaStream>, media: RemoteMedia) -> bool {
        match &self.current {
            Some(active) => {
                active
                    .style
                    .accept_remote(remote, media, &format!("remote-{}", active.id))
            }
            None => false,
        }
    }

    /// Detach handlers and close the current transport. Idempotent.
    pub fn close(&mut self) {
        let Some(active) = self.current.take() else {
            return;
        };
        active.task.abort();
        let transport = active.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(transport) = transport {
            transport.detach_handlers();
            tokio::spawn(async move {
                transport.close().await;
            });
        }
        info!(transport = %active.id, "Peer transport closed");
    }
}

struct Driver {
    id: TransportId,
    role: Role,
    factory: Arc<dyn TransportFactory>,
    ice_servers: Arc<Vec<IceServer>>,
    style: Arc<dyn AttachmentStyle>,
    local: Option<MediaStream>,
    slot: Slot,
    steps: mpsc::UnboundedReceiver<Step>,
    events: EventTx,
}

async fn drive(driver: Driver) {
    let id = driver.id;
    let events = driver.events.clone();
    if let Err(e) = negotiate(driver).await {
        warn!(transport = %id, "Negotiation failed: {e}");
        let _ = events.send(Event::Transport {
            transport: id,
            event: TransportEvent::Failed(e),
        });
    }
}

async fn negotiate(mut driver: Driver) -> Result<(), NegotiationError> {
    let id = driver.id;
    let sink: TransportSink = {
        let events = driver.events.clone();
        Arc::new(move |event| {
            let _ = events.send(Event::Transport {
                transport: id,
                event,
            });
        })
    };
    let emit = |event: TransportEvent| {
        let _ = driver.events.send(Event::Transport {
            transport: id,
            event,
        });
    };

    let transport = driver.factory.create(&driver.ice_servers, sink).await?;
    *driver.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&transport));

    if let Some(local) = &driver.local {
        driver.style.attach_local(transport.as_ref(), local).await?;
    }

    if driver.role == Role::Offerer {
        let sdp = transport.create_offer().await?;
        transport.set_local_description(SdpKind::Offer, &sdp).await?;
        debug!(transport = %id, "Offer created");
        emit(TransportEvent::LocalDescription {
            kind: SdpKind::Offer,
            sdp,
        });
    }

    let mut remote_applied = false;
    let mut pending = Vec::new();
    while let Some(step) = driver.steps.recv().await {
        match step {
            Step::RemoteDescription(kind, sdp) => {
                if remote_applied {
                    return Err(NegotiationError::Unexpected(kind.as_str()));
                }
                transport.set_remote_description(kind, &sdp).await?;
                remote_applied = true;
                debug!(transport = %id, kind = kind.as_str(), buffered = pending.len(), "Remote description applied");
                for candidate in pending.drain(..) {
                    transport.add_ice_candidate(candidate).await?;
                }
                if driver.role == Role::Answerer {
                    let answer = transport.create_answer().await?;
                    transport.set_local_description(SdpKind::Answer, &answer).await?;
                    debug!(transport = %id, "Answer created");
                    emit(TransportEvent::LocalDescription {
                        kind: SdpKind::Answer,
                        sdp: answer,
                    });
                }
            }
            Step::RemoteCandidate(candidate) => {
                if remote_applied {
                    transport.add_ice_candidate(candidate).await?;
                } else {
                    pending.push(candidate);
                }
            }
        }
    }
    Ok(())
}
