use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use duet_protocol::{ClientMessage, Identify, RelayMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::event::{ChannelEvent, ChannelId, Event, EventTx};

/// Open bidirectional link to the relay.
///
/// Dropping `outbound` closes the link. The relay side reports channel loss
/// with [`RelayMessage::Disconnect`] or by closing `inbound`.
pub struct RelayLink {
    pub connection_id: String,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
}

/// Establishes transport connections to the matchmaking relay.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<RelayLink, SignalingError>;
}

/// One signaling channel: lives from connect until disconnect and is never
/// reused across reconnects.
pub(crate) struct SignalingChannel {
    id: ChannelId,
    connection_id: Option<String>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Start connecting. `identify` is queued ahead of anything sent later, so
    /// it is the first message the relay sees on the new transport.
    pub fn connect(
        id: ChannelId,
        connector: Arc<dyn RelayConnector>,
        identify: Identify,
        events: EventTx,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let _ = outbound.send(ClientMessage::Identify(identify));
        let task = tokio::spawn(pump(id, connector, outbound_rx, events));
        info!(channel = %id, "Signaling channel connecting");
        Self {
            id,
            connection_id: None,
            outbound,
            task: Some(task),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn set_connection_id(&mut self, connection_id: String) {
        self.connection_id = Some(connection_id);
    }

    pub fn send(&self, msg: ClientMessage) {
        let event = msg.event_name();
        if self.outbound.send(msg).is_err() {
            debug!(channel = %self.id, event, "Channel closed, dropping outgoing message");
        } else {
            debug!(channel = %self.id, event, "Queued outgoing message");
        }
    }

    /// Stop delivering events and close the transport. Idempotent.
    pub fn disconnect(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        info!(channel = %self.id, "Signaling channel disconnected");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Bridge one relay link to the controller's event queue.
async fn pump(
    id: ChannelId,
    connector: Arc<dyn RelayConnector>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events: EventTx,
) {
    let emit = |event: ChannelEvent| {
        let _ = events.send(Event::Channel { channel: id, event });
    };

    let mut link = match connector.connect().await {
        Ok(link) => link,
        Err(e) => {
            warn!(channel = %id, "Relay connect failed: {e}");
            emit(ChannelEvent::ConnectFailed(e));
            return;
        }
    };
    info!(channel = %id, connection_id = %link.connection_id, "Connected to relay");
    emit(ChannelEvent::Connected {
        connection_id: link.connection_id.clone(),
    });

    loop {
        tokio::select! {
            msg = link.inbound.recv() => {
                match msg {
                    Some(RelayMessage::Disconnect { reason }) => {
                        emit(ChannelEvent::Lost { reason });
                        return;
                    }
                    Some(msg) => {
                        debug!(channel = %id, event = msg.event_name(), "Relay event");
                        emit(ChannelEvent::Relay(msg));
                    }
                    None => {
                        emit(ChannelEvent::Lost { reason: "transport closed".to_string() });
                        return;
                    }
                }
            }
            Some(msg) = outbound_rx.recv() => {
                if link.outbound.send(msg).is_err() {
                    emit(ChannelEvent::Lost { reason: "transport closed".to_string() });
                    return;
                }
            }
        }
    }
}

/// Relay connector speaking JSON text frames over a WebSocket.
pub struct WsRelayConnector {
    url: String,
    tls_cert_path: Option<String>,
    max_message_size: usize,
}

impl WsRelayConnector {
    pub fn new(url: String, tls_cert_path: Option<String>, max_message_size: usize) -> Self {
        Self {
            url,
            tls_cert_path,
            max_message_size,
        }
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self) -> Result<RelayLink, SignalingError> {
        connect_ws(&self.url, self.tls_cert_path.as_deref(), self.max_message_size)
            .await
            .map_err(|e| SignalingError::Connect(format!("{e:#}")))
    }
}

/// Build a TLS connector, pinning the relay certificate if a cert path is provided.
/// Falls back to system roots if no cert path is given.
fn build_tls_connector(tls_cert_path: Option<&str>) -> anyhow::Result<tokio_tungstenite::Connector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        let pem_data = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert from {cert_path}"))?;
        for cert in rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()) {
            if let Err(e) = root_store.add(cert) {
                warn!("Failed to add pinned cert to root store: {e}");
            } else {
                info!("Pinned relay certificate from {cert_path}");
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Failed to select TLS protocol versions")?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}

async fn connect_ws(
    base_url: &str,
    tls_cert_path: Option<&str>,
    max_message_size: usize,
) -> anyhow::Result<RelayLink> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    // The connection id is chosen here and announced in the URL; the relay
    // echoes it back in `identifyAck`.
    let connection_id = uuid::Uuid::new_v4().to_string();
    let url = format!(
        "{base_url}?connectionId={}",
        urlencoding::encode(&connection_id)
    );

    let connector = build_tls_connector(tls_cert_path)?;
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(max_message_size);
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        &url,
        Some(ws_config),
        false,
        Some(connector),
    )
    .await
    .context("WebSocket connection failed")?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (inbound_tx, inbound) = mpsc::unbounded_channel::<RelayMessage>();

    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match RelayMessage::from_text(&text) {
                            Ok(msg) => {
                                if inbound_tx.send(msg).is_err() {
                                    break "channel dropped".to_string();
                                }
                            }
                            Err(e) => warn!("Invalid message from relay: {e}"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "server closed the connection".to_string());
                        }
                        None => break "transport closed".to_string(),
                        Some(Err(e)) => break format!("transport error: {e}"),
                        _ => {}
                    }
                }
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else {
                        // Our side hung up
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return;
                    };
                    let text = match msg.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping outgoing {}: {e}", msg.event_name());
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        break format!("send failed: {e}");
                    }
                }
            }
        };
        debug!(%reason, "Relay WebSocket closed");
        let _ = inbound_tx.send(RelayMessage::Disconnect { reason });
    });

    Ok(RelayLink {
        connection_id,
        outbound,
        inbound,
    })
}
