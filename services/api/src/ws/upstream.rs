//! Upstream Connector
//!
//! Opens the connection to the real-time speech API for one session and sends
//! the negotiation message. The socket itself is driven by a pump task; the
//! session coordinator only ever sees an [`UpstreamLink`], a pair of channels,
//! so the coordinator can be exercised without a network.

use crate::config::Config;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    realtime::{TurnDetectionSettings, UpstreamInstruction},
    session::SessionConfig,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message as WsMessage,
    },
};
use tracing::{Instrument, debug, error, info};

const LINK_BUFFER: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("No upstream API credential is configured")]
    MissingCredential,
    #[error("Failed to connect to the upstream API: {0}")]
    Connect(String),
    #[error("The upstream connection is closed")]
    Closed,
    #[error("Failed to encode upstream instruction: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The relay's handle on an open upstream connection.
///
/// Dropping or closing the link closes the underlying connection.
#[derive(Debug)]
pub struct UpstreamLink {
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<String>,
}

/// The far side of an [`UpstreamLink`], held by whatever drives the transport.
#[derive(Debug)]
pub struct UpstreamPeer {
    /// Serialized instructions the relay wants delivered upstream.
    pub instructions: mpsc::Receiver<String>,
    /// Raw text frames received from upstream.
    pub events: mpsc::Sender<String>,
}

impl UpstreamLink {
    /// Creates a connected link/peer pair.
    pub fn channel(buffer: usize) -> (UpstreamLink, UpstreamPeer) {
        let (outbound, instructions) = mpsc::channel(buffer);
        let (events, inbound) = mpsc::channel(buffer);
        (
            UpstreamLink { outbound, inbound },
            UpstreamPeer {
                instructions,
                events,
            },
        )
    }

    pub async fn send(&self, instruction: &UpstreamInstruction) -> Result<(), RelayError> {
        let text = serde_json::to_string(instruction)?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| RelayError::Closed)
    }

    /// Next raw upstream frame, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn close(self) {
        drop(self);
    }
}

/// Opens raw transport connections to the upstream API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    async fn dial(&self) -> Result<UpstreamLink, RelayError>;
}

/// Dials the OpenAI Realtime WebSocket endpoint.
pub struct OpenAiDialer {
    config: Arc<Config>,
}

impl OpenAiDialer {
    pub fn new(config: Arc<Config>) -> Self {
        install_crypto_provider();
        Self { config }
    }
}

/// Selects ring as the process-wide rustls provider used for `wss://` dials.
fn install_crypto_provider() {
    // Fails only when a provider is already installed, which is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[async_trait]
impl UpstreamDialer for OpenAiDialer {
    async fn dial(&self) -> Result<UpstreamLink, RelayError> {
        let api_key = self
            .config
            .openai_api_key
            .as_ref()
            .ok_or(RelayError::MissingCredential)?;

        let url = self.config.realtime_endpoint();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", authorization);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        info!(%url, "Connected to upstream realtime API.");

        let (link, peer) = UpstreamLink::channel(LINK_BUFFER);
        tokio::spawn(pump(ws_stream, peer).in_current_span());
        Ok(link)
    }
}

/// Shuttles frames between the upstream WebSocket and the link channels until
/// either side goes away.
async fn pump(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>, mut peer: UpstreamPeer) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            outbound = peer.instructions.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        error!(error = %e, "Failed to write to upstream WebSocket.");
                        break;
                    }
                }
                None => {
                    debug!("Upstream link released. Closing upstream WebSocket.");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    if peer.events.send(text.as_str().to_owned()).await.is_err() {
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!(?close_frame, "Upstream WebSocket closed by server.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Error reading from upstream WebSocket.");
                    break;
                }
                None => break,
            },
        }
    }
}

/// Opens and negotiates upstream connections.
pub struct UpstreamConnector {
    dialer: Arc<dyn UpstreamDialer>,
    turn_detection: TurnDetectionSettings,
}

impl UpstreamConnector {
    pub fn new(dialer: Arc<dyn UpstreamDialer>, turn_detection: TurnDetectionSettings) -> Self {
        Self {
            dialer,
            turn_detection,
        }
    }

    /// Dials upstream and sends the `session.update` negotiation for `config`.
    pub async fn connect(&self, config: &SessionConfig) -> Result<UpstreamLink, RelayError> {
        let link = self.dialer.dial().await?;
        link.send(&UpstreamInstruction::negotiate(config, self.turn_detection))
            .await?;
        Ok(link)
    }
}
