//! Session Coordinator
//!
//! One coordinator task owns one session end to end. It polls the client
//! socket, the pending upstream connect, the upstream link and the greeting
//! timer from a single `select!` loop, so the session's mutable state never
//! needs a lock.

use super::upstream::{RelayError, UpstreamConnector, UpstreamLink};
use anyhow::{Result, anyhow};
use futures_util::{Stream, StreamExt};
use relay_core::{
    protocol::{ClientMessage, ServerMessage},
    realtime::{UpstreamEvent, UpstreamInstruction},
    session::{Session, SessionConfig, SessionState},
    translator::{ClientAction, translate_client, translate_upstream},
};
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::Sleep,
};
use tracing::{debug, error, info, warn};

/// A frame read from the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    /// Binary payloads are not part of the protocol; only the size is kept for logging.
    Binary(usize),
    /// Ping/pong, answered by the transport itself.
    Control,
    Close,
}

type ConnectResult = Result<UpstreamLink, RelayError>;

pub struct SessionCoordinator {
    session: Session,
    connector: Arc<UpstreamConnector>,
    greeting_delay: Duration,
    client_tx: mpsc::Sender<ServerMessage>,
    state_tx: watch::Sender<SessionState>,
    connecting: Option<JoinHandle<ConnectResult>>,
    upstream: Option<UpstreamLink>,
    greeting: Option<Pin<Box<Sleep>>>,
}

impl SessionCoordinator {
    /// Builds a coordinator for `session`, returning it along with a receiver
    /// that follows the session's state.
    pub fn new(
        session: Session,
        connector: Arc<UpstreamConnector>,
        greeting_delay: Duration,
        client_tx: mpsc::Sender<ServerMessage>,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(session.state());
        (
            Self {
                session,
                connector,
                greeting_delay,
                client_tx,
                state_tx,
                connecting: None,
                upstream: None,
                greeting: None,
            },
            state_rx,
        )
    }

    /// Drives the session until the client transport closes, then tears down
    /// the upstream side and hands the final session state back.
    pub async fn run<S>(mut self, inbound: S) -> Session
    where
        S: Stream<Item = ClientFrame> + Unpin,
    {
        if let Err(e) = self.event_loop(inbound).await {
            warn!(error = %e, "Session loop stopped early.");
        }
        self.teardown();
        self.session
    }

    async fn event_loop<S>(&mut self, mut inbound: S) -> Result<()>
    where
        S: Stream<Item = ClientFrame> + Unpin,
    {
        loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(ClientFrame::Text(text)) => self.on_client_text(&text).await?,
                    Some(ClientFrame::Binary(len)) => {
                        warn!(len, "Ignoring binary frame from client.");
                    }
                    Some(ClientFrame::Control) => {}
                    Some(ClientFrame::Close) | None => {
                        info!("Client transport closed.");
                        return Ok(());
                    }
                },
                result = pending_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connected(result).await?;
                },
                frame = recv_upstream(&mut self.upstream) => match frame {
                    Some(text) => self.on_upstream_text(&text).await?,
                    None => self.on_upstream_closed().await?,
                },
                () = greeting_due(&mut self.greeting) => {
                    self.greeting = None;
                    self.on_greeting_due().await?;
                },
            }
        }
    }

    async fn on_client_text(&mut self, text: &str) -> Result<()> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed client message.");
                return self.send(ServerMessage::error("Invalid message format")).await;
            }
        };
        match translate_client(message) {
            ClientAction::Start(config) => self.start(config).await,
            ClientAction::Forward(instruction) => self.forward(instruction).await,
            ClientAction::End => self.end().await,
        }
    }

    async fn start(&mut self, config: SessionConfig) -> Result<()> {
        if let Err(e) = self.session.configure(config.clone()) {
            warn!(error = %e, "Rejecting session.start while a call is in progress.");
            return self
                .send(ServerMessage::error("A session is already in progress"))
                .await;
        }
        self.publish_state();
        // A timer left over from an earlier call must not fire on the new link.
        self.greeting = None;
        self.advance(SessionState::Connecting)?;

        info!(
            voice = config.voice.as_deref().unwrap_or_default(),
            agent_speaks_first = config.agent_speaks_first,
            "Connecting to upstream."
        );
        let connector = self.connector.clone();
        self.connecting = Some(tokio::spawn(async move {
            connector.connect(&config).await
        }));
        Ok(())
    }

    async fn on_connected(&mut self, result: Result<ConnectResult, JoinError>) -> Result<()> {
        match result {
            Ok(Ok(link)) => {
                self.upstream = Some(link);
                self.advance(SessionState::Ready)?;
                self.send(ServerMessage::SessionReady).await?;
                info!("Upstream negotiated. Session ready.");
                if self
                    .session
                    .config()
                    .is_some_and(|config| config.agent_speaks_first)
                {
                    self.greeting = Some(Box::pin(tokio::time::sleep(self.greeting_delay)));
                }
                Ok(())
            }
            Ok(Err(RelayError::MissingCredential)) => {
                error!("Cannot open upstream connection: no API credential configured.");
                self.fail("Server configuration error: the speech API credential is not set")
                    .await
            }
            Ok(Err(e)) => {
                error!(error = %e, "Upstream connection failed.");
                self.fail("Failed to connect to the speech service").await
            }
            Err(e) => {
                error!(error = %e, "Upstream connect task did not complete.");
                self.fail("Failed to connect to the speech service").await
            }
        }
    }

    async fn forward(&mut self, instruction: UpstreamInstruction) -> Result<()> {
        let Some(link) = &self.upstream else {
            debug!("Dropping client audio: no upstream link.");
            return Ok(());
        };
        if let Err(e) = link.send(&instruction).await {
            debug!(error = %e, "Dropping client audio: upstream link is closing.");
            return Ok(());
        }
        if self.session.state() == SessionState::Ready {
            self.advance(SessionState::Active)?;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.release_upstream();
        self.advance(SessionState::Ended)?;
        info!("Session ended by client.");
        self.send(ServerMessage::SessionEnded).await
    }

    async fn on_upstream_text(&mut self, text: &str) -> Result<()> {
        let (kind, event) = match UpstreamEvent::decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "Dropping malformed upstream frame.");
                return Ok(());
            }
        };
        if event == UpstreamEvent::Unrecognized {
            debug!(%kind, "Dropping unrecognized upstream event.");
            return Ok(());
        }
        let Some(message) = translate_upstream(event) else {
            return Ok(());
        };
        match &message {
            ServerMessage::UsageUpdate(report) => self.session.usage.record(report),
            ServerMessage::Error { message } => {
                warn!(upstream_error = %message, "Upstream reported an error.");
            }
            _ => {}
        }
        self.send(message).await
    }

    async fn on_upstream_closed(&mut self) -> Result<()> {
        self.upstream = None;
        info!("Upstream connection closed.");
        self.advance(SessionState::Ended)?;
        self.send(ServerMessage::SessionEnded).await
    }

    async fn on_greeting_due(&mut self) -> Result<()> {
        let Some(link) = &self.upstream else {
            debug!("Skipping greeting: upstream link is gone.");
            return Ok(());
        };
        if let Err(e) = link.send(&UpstreamInstruction::greeting()).await {
            debug!(error = %e, "Skipping greeting: upstream link is closing.");
            return Ok(());
        }
        info!("Sent greeting kickoff upstream.");
        if self.session.state() == SessionState::Ready {
            self.advance(SessionState::Active)?;
        }
        Ok(())
    }

    async fn fail(&mut self, message: &str) -> Result<()> {
        self.release_upstream();
        self.advance(SessionState::Failed)?;
        self.send(ServerMessage::error(message)).await
    }

    /// Abandons a pending connect and closes the upstream link, if any.
    fn release_upstream(&mut self) {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        if let Some(link) = self.upstream.take() {
            link.close();
            debug!("Closed upstream link.");
        }
    }

    fn teardown(&mut self) {
        self.release_upstream();
        self.greeting = None;
        if !self.session.state().is_terminal() {
            // Ending is legal from every state.
            let _ = self.advance(SessionState::Ended);
        }
        let usage = self.session.usage;
        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            audio_input_ms = usage.audio_input_ms,
            audio_output_ms = usage.audio_output_ms,
            responses = usage.responses,
            "Session torn down."
        );
    }

    fn advance(&mut self, next: SessionState) -> Result<()> {
        self.session.transition(next)?;
        self.publish_state();
        Ok(())
    }

    fn publish_state(&self) {
        let state = self.session.state();
        debug!(?state, "Session state changed.");
        self.state_tx.send_replace(state);
    }

    async fn send(&self, message: ServerMessage) -> Result<()> {
        self.client_tx
            .send(message)
            .await
            .map_err(|_| anyhow!("Client connection is gone"))
    }
}

async fn pending_connect(
    handle: &mut Option<JoinHandle<ConnectResult>>,
) -> Result<ConnectResult, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn recv_upstream(link: &mut Option<UpstreamLink>) -> Option<String> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn greeting_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
