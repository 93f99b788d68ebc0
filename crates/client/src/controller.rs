//! The session controller: sole owner and writer of the [`Session`].
//!
//! Commands from the rendering layer, relay events, transport events and
//! the results of spawned async work all arrive on one queue and are handled
//! one at a time in arrival order. Spawned work is tagged with the identity
//! of the resource it was started against (media attempt, channel,
//! transport, timer epoch) and is discarded on arrival if that resource has
//! since been replaced or torn down.

use std::sync::Arc;
use std::time::Duration;

use duet_protocol::{AccountConfig, AccountType, ClientMessage, DuetConfig, Identify, RelayMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CaptureError, NegotiationError, SessionClosed};
use crate::event::{ChannelEvent, ChannelId, Command, Event, EventRx, EventTx, TransportId};
use crate::media::{MediaConstraints, MediaDevice, MediaStream, TrackState};
use crate::names;
use crate::negotiator::{Negotiator, Role};
use crate::queue::QueueCoordinator;
use crate::session::{Notice, Session, SessionSnapshot, Status};
use crate::signaling::{RelayConnector, SignalingChannel};
use crate::transport::{self, IceServer, SdpKind, TransportEvent, TransportFactory};

const NOTICE_CAPACITY: usize = 64;

/// External collaborators the controller drives.
pub struct Components {
    pub media: Arc<dyn MediaDevice>,
    pub relay: Arc<dyn RelayConnector>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub constraints: MediaConstraints,
    pub ice_servers: Vec<IceServer>,
    /// `None` disables the stall timeout
    pub negotiation_timeout: Option<Duration>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub account: Option<AccountConfig>,
    /// Fixed guest name instead of a random draw
    pub guest_name: Option<String>,
    /// Join the queue once the first handshake after acquiring media is acknowledged
    pub auto_join: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &DuetConfig) -> Self {
        let timeout = config.session.negotiation_timeout_secs;
        Self {
            constraints: MediaConstraints {
                audio: config.media.audio,
                video: config.media.video,
            },
            ice_servers: transport::ice_servers(&config.ice),
            negotiation_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
            initial_backoff: Duration::from_millis(config.session.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.session.reconnect_max_backoff_ms),
            account: config.account.clone(),
            guest_name: None,
            auto_join: config.session.auto_join,
        }
    }
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct SessionHandle {
    events: EventTx,
    snapshot: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl SessionHandle {
    fn command(&self, command: Command) -> Result<(), SessionClosed> {
        self.events
            .send(Event::Command(command))
            .map_err(|_| SessionClosed)
    }

    pub fn open_media(&self) -> Result<(), SessionClosed> {
        self.command(Command::OpenMedia)
    }

    pub fn join_queue(&self) -> Result<(), SessionClosed> {
        self.command(Command::JoinQueue)
    }

    pub fn leave_queue(&self) -> Result<(), SessionClosed> {
        self.command(Command::LeaveQueue)
    }

    pub fn skip(&self) -> Result<(), SessionClosed> {
        self.command(Command::Skip)
    }

    pub fn forget(&self) -> Result<(), SessionClosed> {
        self.command(Command::Forget)
    }

    /// Full reset to idle with a fresh display name.
    pub fn reset(&self) -> Result<(), SessionClosed> {
        self.command(Command::Reset {
            keep_identity: false,
        })
    }

    pub fn reset_keeping_identity(&self) -> Result<(), SessionClosed> {
        self.command(Command::Reset {
            keep_identity: true,
        })
    }

    /// Reset and stop the controller loop.
    pub fn shutdown(&self) -> Result<(), SessionClosed> {
        self.command(Command::Shutdown)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Change notifications; re-read the snapshot on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

pub struct SessionController {
    session: Session,
    components: Components,
    settings: ControllerSettings,
    queue: QueueCoordinator,
    negotiator: Negotiator,

    channel: Option<SignalingChannel>,
    next_channel: u64,
    /// Re-request queueing once the current handshake is acknowledged
    rejoin_queue: bool,
    /// Delay before the next reconnect; `None` means reconnect immediately
    backoff: Option<Duration>,
    reconnect_epoch: u64,
    reconnect_timer: Option<JoinHandle<()>>,

    media_attempt: u64,
    track_watchers: Vec<JoinHandle<()>>,

    match_epoch: u64,
    negotiation_timer: Option<JoinHandle<()>>,

    events_tx: EventTx,
    events_rx: EventRx,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notices_tx: broadcast::Sender<Notice>,
}

impl SessionController {
    pub fn new(components: Components, settings: ControllerSettings) -> Self {
        let local_identity = match &settings.account {
            Some(account) => account.display_identity.clone(),
            None => settings.guest_name.clone().unwrap_or_else(names::random_name),
        };
        let session = Session::new(local_identity, settings.account.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(session.snapshot());
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let negotiator = Negotiator::new(
            Arc::clone(&components.transports),
            settings.ice_servers.clone(),
        );

        info!(identity = %session.local_identity, signed_in = session.account.is_some(), "Session created");
        Self {
            session,
            components,
            settings,
            queue: QueueCoordinator,
            negotiator,
            channel: None,
            next_channel: 0,
            rejoin_queue: false,
            backoff: None,
            reconnect_epoch: 0,
            reconnect_timer: None,
            media_attempt: 0,
            track_watchers: Vec::new(),
            match_epoch: 0,
            negotiation_timer: None,
            events_tx,
            events_rx,
            snapshot_tx,
            notices_tx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            events: self.events_tx.clone(),
            snapshot: self.snapshot_tx.subscribe(),
            notices: self.notices_tx.clone(),
        }
    }

    /// Process events until a shutdown command arrives.
    pub async fn run(mut self) {
        info!("Session controller running");
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, Event::Command(Command::Shutdown)) {
                self.reset(true);
                self.publish();
                break;
            }
            self.dispatch(event);
        }
        info!("Session controller stopped");
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command),
            Event::MediaAcquired { attempt, result } => self.on_media_acquired(attempt, result),
            Event::TrackEnded { attempt, track_id } => self.on_track_ended(attempt, &track_id),
            Event::Channel { channel, event } => self.on_channel_event(channel, event),
            Event::ReconnectDue { epoch } => self.on_reconnect_due(epoch),
            Event::Transport { transport, event } => self.on_transport_event(transport, event),
            Event::NegotiationTimeout { epoch, error } => {
                if epoch == self.match_epoch && self.session.status == Status::Negotiating {
                    self.abandon_negotiation(error);
                } else {
                    debug!(epoch, "Stale negotiation timeout");
                }
            }
        }
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        debug!(?command, status = %self.session.status, "Command");
        match command {
            Command::OpenMedia => self.open_media(),
            Command::JoinQueue => self.join_queue(),
            Command::LeaveQueue => {
                match self.queue.leave(self.session.status, self.channel.as_ref()) {
                    Ok(next) => {
                        self.set_status(next);
                    }
                    Err(e) => warn!("Ignoring leave request: {e}"),
                }
            }
            Command::Skip => match self.queue.skip(self.session.status, self.channel.as_ref()) {
                Ok(next) => {
                    self.cleanup_transport();
                    self.cleanup_remote();
                    self.set_status(next);
                }
                Err(e) => warn!("Ignoring skip request: {e}"),
            },
            Command::Forget => match self.queue.forget(self.channel.as_ref()) {
                Ok(notice) => self.notify(notice),
                Err(e) => warn!("Ignoring forget request: {e}"),
            },
            Command::Reset { keep_identity } => self.reset(keep_identity),
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn open_media(&mut self) {
        let status = self.session.status;
        if !matches!(status, Status::Idle | Status::MediaError) {
            warn!(%status, "Ignoring media request, media already requested");
            return;
        }
        self.media_attempt += 1;
        let attempt = self.media_attempt;
        self.set_status(Status::AcquiringMedia);

        let device = Arc::clone(&self.components.media);
        let constraints = self.settings.constraints;
        let events = self.events_tx.clone();
        info!(attempt, "Requesting local media");
        tokio::spawn(async move {
            let result = device.acquire(constraints).await;
            let _ = events.send(Event::MediaAcquired { attempt, result });
        });
    }

    fn join_queue(&mut self) {
        match self.queue.join(self.session.status, self.channel.as_ref()) {
            Ok(next) => {
                self.set_status(next);
            }
            Err(e) => warn!("Ignoring join request: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Media
    // -----------------------------------------------------------------------

    fn on_media_acquired(&mut self, attempt: u64, result: Result<MediaStream, CaptureError>) {
        if attempt != self.media_attempt || self.session.status != Status::AcquiringMedia {
            debug!(attempt, current = self.media_attempt, "Discarding stale media result");
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        }
        match result {
            Ok(stream) => {
                info!(stream = stream.id(), "Local media ready");
                self.watch_local_tracks(&stream);
                self.session.local_media = Some(stream);
                self.set_status(Status::ConnectingChannel);
                self.rejoin_queue = self.settings.auto_join;
                self.backoff = None;
                self.open_channel();
            }
            Err(e) => {
                warn!("Media capture failed: {e}");
                self.set_status(Status::MediaError);
                self.notify(Notice::error(format!("Failed to access media device: {e}")));
            }
        }
    }

    fn watch_local_tracks(&mut self, stream: &MediaStream) {
        for track in stream.tracks() {
            let mut state = track.watch();
            let events = self.events_tx.clone();
            let attempt = self.media_attempt;
            let track_id = track.id().to_string();
            self.track_watchers.push(tokio::spawn(async move {
                loop {
                    let current = *state.borrow_and_update();
                    match current {
                        TrackState::Ended => {
                            let _ = events.send(Event::TrackEnded { attempt, track_id });
                            return;
                        }
                        TrackState::Stopped => return,
                        TrackState::Live => {}
                    }
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            }));
        }
    }

    fn on_track_ended(&mut self, attempt: u64, track_id: &str) {
        if attempt != self.media_attempt
            || self.session.status == Status::Idle
            || self.session.local_media.is_none()
        {
            debug!(track = track_id, "Ignoring end of a track we no longer hold");
            return;
        }
        warn!(track = track_id, status = %self.session.status, "Local media device went away");
        self.reset(true);
        self.notify(Notice::error("Media device disconnected"));
    }

    // -----------------------------------------------------------------------
    // Signaling
    // -----------------------------------------------------------------------

    fn identify(&self) -> Identify {
        match &self.session.account {
            Some(account) => Identify {
                name: account.display_identity.clone(),
                account_type: account.account_type,
                email: account.email.clone(),
            },
            None => Identify {
                name: self.session.local_identity.clone(),
                account_type: AccountType::Guest,
                email: None,
            },
        }
    }

    fn open_channel(&mut self) {
        self.cleanup_channel();
        self.next_channel += 1;
        let id = ChannelId(self.next_channel);
        self.channel = Some(SignalingChannel::connect(
            id,
            Arc::clone(&self.components.relay),
            self.identify(),
            self.events_tx.clone(),
        ));
    }

    fn send(&self, msg: ClientMessage) {
        match &self.channel {
            Some(channel) => channel.send(msg),
            None => debug!(event = msg.event_name(), "No channel, dropping outgoing message"),
        }
    }

    fn on_channel_event(&mut self, id: ChannelId, event: ChannelEvent) {
        if self.channel.as_ref().map(SignalingChannel::id) != Some(id) {
            debug!(channel = %id, "Discarding event from a closed channel");
            return;
        }
        match event {
            ChannelEvent::Connected { connection_id } => {
                if let Some(channel) = self.channel.as_mut() {
                    channel.set_connection_id(connection_id);
                }
            }
            ChannelEvent::Relay(msg) => self.on_relay(msg),
            ChannelEvent::ConnectFailed(e) => self.on_channel_lost(e.to_string()),
            ChannelEvent::Lost { reason } => self.on_channel_lost(reason),
        }
    }

    fn on_relay(&mut self, msg: RelayMessage) {
        let status = self.session.status;
        debug!(event = msg.event_name(), %status, "Relay event");
        match msg {
            RelayMessage::IdentifyAck {
                assigned_connection_id,
            } => self.on_identify_ack(assigned_connection_id),
            RelayMessage::Match {
                room_id,
                remote_name,
                is_offerer,
            } => {
                if status != Status::Queued {
                    warn!(%room_id, %status, "Match outside the queue, ignoring");
                    return;
                }
                info!(%room_id, %remote_name, is_offerer, "Matched");
                self.session.remote_identity = remote_name;
                self.set_status(Status::Negotiating);
                self.notify(Notice::success(format!(
                    "Matched with {}",
                    self.session.remote_identity
                )));
                self.match_epoch += 1;
                self.arm_negotiation_timer();
                if is_offerer {
                    self.negotiator.start(
                        Role::Offerer,
                        self.session.local_media.clone(),
                        self.events_tx.clone(),
                    );
                }
            }
            RelayMessage::Offer { sdp } => {
                if !status.is_matched() {
                    warn!(%status, "Offer outside a match, ignoring");
                    return;
                }
                if self.negotiator.current().is_none() {
                    self.negotiator.start(
                        Role::Answerer,
                        self.session.local_media.clone(),
                        self.events_tx.clone(),
                    );
                }
                if let Err(e) = self.negotiator.remote_description(SdpKind::Offer, sdp) {
                    self.abandon_negotiation(e);
                }
            }
            RelayMessage::Answer { sdp } => {
                if !status.is_matched() || self.negotiator.current().is_none() {
                    warn!(%status, "Answer without an outstanding offer, ignoring");
                    return;
                }
                if let Err(e) = self.negotiator.remote_description(SdpKind::Answer, sdp) {
                    self.abandon_negotiation(e);
                }
            }
            RelayMessage::IceCandidate { candidate } => {
                if !status.is_matched() {
                    debug!(%status, "Candidate outside a match, ignoring");
                } else if !self.negotiator.remote_candidate(candidate) {
                    debug!("No transport yet, dropping remote candidate");
                }
            }
            RelayMessage::Leave {
                remote_connection_id,
                is_timeout,
            } => {
                let notice = self.queue.departure(
                    status,
                    self.channel.as_ref(),
                    &remote_connection_id,
                    &self.session.remote_identity,
                    is_timeout,
                );
                if let Some(notice) = notice {
                    self.cleanup_transport();
                    self.cleanup_remote();
                    self.set_status(Status::Queued);
                    self.notify(notice);
                }
            }
            RelayMessage::Disconnect { reason } => self.on_channel_lost(reason),
        }
    }

    fn on_identify_ack(&mut self, assigned: String) {
        let status = self.session.status;
        if status != Status::ConnectingChannel {
            warn!(%status, "identifyAck outside the handshake, ignoring");
            return;
        }
        match self.channel.as_ref().and_then(SignalingChannel::connection_id) {
            Some(own) if own != assigned => {
                error!(own, %assigned, "Relay acknowledged a different connection id");
            }
            None => warn!(%assigned, "identifyAck before the transport reported its id"),
            Some(_) => {}
        }
        info!(connection_id = %assigned, "Identified with relay");
        self.backoff = None;
        self.set_status(Status::Ready);
        if std::mem::take(&mut self.rejoin_queue) {
            info!("Joining queue after handshake");
            self.join_queue();
        }
    }

    /// The channel failed to open or dropped.
    fn on_channel_lost(&mut self, reason: String) {
        let status = self.session.status;
        if self.session.local_media.is_none() {
            warn!(%status, %reason, "Channel lost without media, resetting");
            self.notify(Notice::error(format!("Network error. ({reason})")));
            self.reset(true);
            return;
        }

        warn!(%status, %reason, "Channel lost, reconnecting");
        self.notify(Notice::error(format!("Reconnecting... ({reason})")));
        let rejoin = match status {
            Status::Queued | Status::Negotiating | Status::Connected => true,
            Status::ConnectingChannel => self.rejoin_queue,
            _ => false,
        };
        self.cleanup_transport();
        self.cleanup_remote();
        self.cleanup_channel();
        self.set_status(Status::ConnectingChannel);
        self.rejoin_queue = rejoin;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();
        match self.backoff {
            None => {
                self.backoff = Some(self.settings.initial_backoff);
                self.open_channel();
            }
            Some(delay) => {
                info!("Reconnecting in {} seconds...", delay.as_secs());
                self.backoff = Some((delay * 2).min(self.settings.max_backoff));
                let epoch = self.reconnect_epoch;
                let events = self.events_tx.clone();
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::ReconnectDue { epoch });
                }));
            }
        }
    }

    fn on_reconnect_due(&mut self, epoch: u64) {
        if epoch != self.reconnect_epoch || self.session.status != Status::ConnectingChannel {
            debug!(epoch, "Stale reconnect timer");
            return;
        }
        self.reconnect_timer = None;
        self.open_channel();
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_epoch += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Negotiation
    // -----------------------------------------------------------------------

    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        if !self.negotiator.is_current(id) {
            debug!(transport = %id, "Discarding event from a closed transport");
            return;
        }
        match event {
            TransportEvent::LocalDescription { kind, sdp } => {
                debug!(transport = %id, role = ?self.negotiator.role(), kind = kind.as_str(), "Forwarding local description");
                self.send(match kind {
                    SdpKind::Offer => ClientMessage::Offer { sdp },
                    SdpKind::Answer => ClientMessage::Answer { sdp },
                });
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.send(ClientMessage::IceCandidate { candidate });
            }
            TransportEvent::RemoteMedia(media) => {
                let accepted = self
                    .negotiator
                    .accept_remote(&mut self.session.remote_media, media);
                if accepted && self.session.status == Status::Negotiating {
                    self.disarm_negotiation_timer();
                    self.set_status(Status::Connected);
                }
            }
            TransportEvent::Failed(e) => self.abandon_negotiation(e),
        }
    }

    /// Give up on the current match and go back to waiting.
    fn abandon_negotiation(&mut self, e: NegotiationError) {
        error!(error = %e, "Negotiation failed, abandoning match");
        if !self.session.status.is_matched() {
            self.cleanup_transport();
            return;
        }
        let remote = self.session.remote_identity.clone();
        self.queue.abandon(self.channel.as_ref());
        self.cleanup_transport();
        self.cleanup_remote();
        self.set_status(Status::Queued);
        self.notify(Notice::error(format!("Connection with {remote} failed")));
    }

    fn arm_negotiation_timer(&mut self) {
        self.disarm_negotiation_timer();
        let Some(timeout) = self.settings.negotiation_timeout else {
            return;
        };
        let epoch = self.match_epoch;
        let events = self.events_tx.clone();
        self.negotiation_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::NegotiationTimeout {
                epoch,
                error: NegotiationError::Timeout(timeout.as_secs()),
            });
        }));
    }

    fn disarm_negotiation_timer(&mut self) {
        if let Some(timer) = self.negotiation_timer.take() {
            timer.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    pub(crate) fn cleanup_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.disconnect();
        }
    }

    pub(crate) fn cleanup_transport(&mut self) {
        self.disarm_negotiation_timer();
        self.negotiator.close();
    }

    pub(crate) fn cleanup_local(&mut self, keep_identity: bool) {
        for watcher in self.track_watchers.drain(..) {
            watcher.abort();
        }
        if let Some(stream) = self.session.local_media.take() {
            stream.stop_all();
            info!(stream = stream.id(), "Local media released");
        }
        if !keep_identity && self.session.account.is_none() {
            self.session.local_identity = self
                .settings
                .guest_name
                .clone()
                .unwrap_or_else(names::random_name);
        }
    }

    pub(crate) fn cleanup_remote(&mut self) {
        self.session.remote_identity.clear();
        self.session.remote_media = None;
    }

    /// Release everything and return to idle.
    pub(crate) fn reset(&mut self, keep_identity: bool) {
        info!(status = %self.session.status, keep_identity, "Resetting session");
        self.cancel_reconnect();
        self.cleanup_channel();
        self.cleanup_transport();
        self.cleanup_local(keep_identity);
        self.cleanup_remote();
        self.rejoin_queue = false;
        self.backoff = None;
        // Invalidates any capture still in flight
        self.media_attempt += 1;
        self.set_status(Status::Idle);
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    fn set_status(&mut self, next: Status) -> bool {
        let current = self.session.status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            error!(from = %current, to = %next, "Refusing transition outside the session lifecycle");
            return false;
        }
        debug_assert!(
            next.may_hold_media() || self.session.local_media.is_none(),
            "local media held in {next}"
        );
        info!(from = %current, to = %next, "Status changed");
        self.session.status = next;
        true
    }

    fn notify(&self, notice: Notice) {
        debug!(level = ?notice.level, message = %notice.message, "Notice");
        let _ = self.notices_tx.send(notice);
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
impl SessionController {
    /// Handle queued events until nothing arrives for a short while.
    async fn settle(&mut self) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), self.events_rx.recv()).await
        {
            if matches!(event, Event::Command(Command::Shutdown)) {
                self.reset(true);
                self.publish();
                continue;
            }
            self.dispatch(event);
        }
    }

    fn status(&self) -> Status {
        self.session.status
    }

    fn channel_open(&self) -> bool {
        self.channel.is_some()
    }

    fn transport_open(&self) -> bool {
        self.negotiator.current().is_some()
    }
}
