//! In-memory stand-ins for the device, the relay and the peer transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duet_protocol::{ClientMessage, IceCandidate, RelayMessage};
use tokio::sync::{Semaphore, mpsc};

use crate::error::{CaptureError, NegotiationError, SignalingError};
use crate::media::{MediaConstraints, MediaDevice, MediaStream, MediaTrack, TrackKind, TrackSource};
use crate::signaling::{RelayConnector, RelayLink};
use crate::transport::{
    IceServer, PeerTransport, SdpKind, TransportCapabilities, TransportEvent, TransportFactory,
    TransportSink,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Media device
// ---------------------------------------------------------------------------

pub struct FakeDevice {
    deny: Mutex<Option<CaptureError>>,
    gate: Option<Arc<Semaphore>>,
    issued: Mutex<Vec<MediaStream>>,
    counter: AtomicUsize,
}

impl FakeDevice {
    pub fn granting() -> Self {
        Self {
            deny: Mutex::new(None),
            gate: None,
            issued: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn denying(reason: &str) -> Self {
        let device = Self::granting();
        device.set_deny(Some(CaptureError::PermissionDenied(reason.to_string())));
        device
    }

    /// Every acquire blocks until [`FakeDevice::release`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::granting()
        }
    }

    pub fn set_deny(&self, deny: Option<CaptureError>) {
        *lock(&self.deny) = deny;
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn issued(&self) -> Vec<MediaStream> {
        lock(&self.issued).clone()
    }
}

#[async_trait]
impl MediaDevice for FakeDevice {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<MediaStream, CaptureError> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(err) = lock(&self.deny).clone() {
            return Err(err);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cam{n}");
        let stream = MediaStream::with_tracks(
            id.clone(),
            vec![
                MediaTrack::new(format!("{id}-audio"), TrackKind::Audio, TrackSource::Detached),
                MediaTrack::new(format!("{id}-video"), TrackKind::Video, TrackSource::Detached),
            ],
        );
        lock(&self.issued).push(stream.clone());
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

struct RelayConn {
    inbound: mpsc::UnboundedSender<RelayMessage>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    log: Vec<ClientMessage>,
}

#[derive(Default)]
struct RelayState {
    next_id: u32,
    fail_next: usize,
    conns: Vec<RelayConn>,
}

/// Scriptable relay. Connection ids are handed out as `S1`, `S2`, ...
#[derive(Default)]
pub struct MockRelay {
    state: Mutex<RelayState>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_connects(&self, n: usize) {
        lock(&self.state).fail_next = n;
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).conns.len()
    }

    /// Everything received so far, across all connections in connect order.
    pub fn sent(&self) -> Vec<ClientMessage> {
        let mut state = lock(&self.state);
        let mut all = Vec::new();
        for conn in state.conns.iter_mut() {
            while let Ok(msg) = conn.outbound.try_recv() {
                conn.log.push(msg);
            }
            all.extend(conn.log.iter().cloned());
        }
        all
    }

    /// Messages received on connection `index` only.
    pub fn sent_on(&self, index: usize) -> Vec<ClientMessage> {
        self.sent();
        lock(&self.state)
            .conns
            .get(index)
            .map(|c| c.log.clone())
            .unwrap_or_default()
    }

    /// Deliver `msg` on the most recent connection.
    pub fn push(&self, msg: RelayMessage) {
        if let Some(conn) = lock(&self.state).conns.last() {
            let _ = conn.inbound.send(msg);
        }
    }

    pub fn drop_connection(&self, reason: &str) {
        self.push(RelayMessage::Disconnect {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl RelayConnector for MockRelay {
    async fn connect(&self) -> Result<RelayLink, SignalingError> {
        let mut state = lock(&self.state);
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SignalingError::Connect("connection refused".to_string()));
        }
        state.next_id += 1;
        let connection_id = format!("S{}", state.next_id);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        state.conns.push(RelayConn {
            inbound: inbound_tx,
            outbound: outbound_rx,
            log: Vec::new(),
        });
        Ok(RelayLink {
            connection_id,
            outbound,
            inbound,
        })
    }
}

// ---------------------------------------------------------------------------
// Peer transport
// ---------------------------------------------------------------------------

/// Records every call; descriptions are canned strings.
pub struct MockTransport {
    sink: TransportSink,
    stream_attachment: bool,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<&'static str>>,
    detached: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(sink: TransportSink, stream_attachment: bool) -> Self {
        Self {
            sink,
            stream_attachment,
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// A transport whose events go nowhere.
    pub fn detached(stream_attachment: bool) -> Self {
        Self::new(Arc::new(|_| {}), stream_attachment)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn fail_on(&self, op: &'static str) {
        *lock(&self.fail_on) = Some(op);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fire an event as the real transport would. Swallowed once detached.
    pub fn emit(&self, event: TransportEvent) {
        if !self.is_detached() {
            (self.sink)(event);
        }
    }

    fn record(&self, op: &'static str, call: String) -> Result<(), NegotiationError> {
        lock(&self.calls).push(call);
        if *lock(&self.fail_on) == Some(op) {
            return Err(NegotiationError::Description(format!("{op} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        if !self.stream_attachment {
            return Err(NegotiationError::Unsupported("whole-stream attachment"));
        }
        self.record("add_stream", format!("add_stream:{}", stream.id()))
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        self.record("add_track", format!("add_track:{}", track.id()))
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.record("create_offer", "create_offer".to_string())?;
        Ok("v=0 mock-offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        self.record("create_answer", "create_answer".to_string())?;
        Ok("v=0 mock-answer".to_string())
    }

    async fn set_local_description(&self, kind: SdpKind, _sdp: &str) -> Result<(), NegotiationError> {
        self.record("set_local", format!("set_local:{}", kind.as_str()))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        _sdp: &str,
    ) -> Result<(), NegotiationError> {
        self.record("set_remote", format!("set_remote:{}", kind.as_str()))
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        match candidate {
            None => {
                lock(&self.calls).push("candidate:end".to_string());
                Ok(())
            }
            Some(c) => {
                let foundation = c
                    .candidate
                    .strip_prefix("candidate:")
                    .and_then(|rest| rest.split_whitespace().next())
                    .unwrap_or("?")
                    .to_string();
                self.record("candidate", format!("candidate:{foundation}"))
            }
        }
    }

    fn detach_handlers(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockTransportFactory {
    stream_attachment: bool,
    fail_on: Mutex<Option<&'static str>>,
    fail_create: AtomicBool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new(stream_attachment: bool) -> Self {
        Self {
            stream_attachment,
            fail_on: Mutex::new(None),
            fail_create: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Make every transport created from now on fail at `op`.
    pub fn fail_on(&self, op: &'static str) {
        *lock(&self.fail_on) = Some(op);
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        lock(&self.created).len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&lock(&self.created)[index])
    }

    pub fn last(&self) -> Arc<MockTransport> {
        let created = lock(&self.created);
        Arc::clone(created.last().expect("no transport created"))
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            stream_attachment: self.stream_attachment,
        }
    }

    async fn create(
        &self,
        _ice_servers: &[IceServer],
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::Transport("mock create failure".to_string()));
        }
        let transport = Arc::new(MockTransport::new(sink, self.stream_attachment));
        if let Some(op) = *lock(&self.fail_on) {
            transport.fail_on(op);
        }
        lock(&self.created).push(Arc::clone(&transport));
        Ok(transport)
    }
}
