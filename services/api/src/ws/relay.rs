//! Relay Server: accepts client WebSocket connections and runs one session
//! coordinator per connection.

use super::coordinator::{ClientFrame, SessionCoordinator};
use crate::{
    registry::{SessionEntry, new_session_id},
    state::AppState,
};
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use relay_core::{protocol::ServerMessage, session::Session};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, instrument, warn};

const CLIENT_BUFFER: usize = 256;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual client connection.
///
/// Issues the session id, registers the session, announces it to the client
/// and runs the coordinator until the connection closes. The registry entry is
/// removed on every exit path.
#[instrument(name = "relay_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = new_session_id();
    tracing::Span::current().record("session_id", session_id.as_str());

    let (socket_tx, socket_rx) = socket.split();
    let (client_tx, client_rx) = mpsc::channel(CLIENT_BUFFER);
    let writer = tokio::spawn(write_client(socket_tx, client_rx).in_current_span());

    let session = Session::new(session_id.clone());
    let created_at = session.created_at;
    let (coordinator, state_rx) = SessionCoordinator::new(
        session,
        state.connector.clone(),
        state.config.greeting_delay,
        client_tx.clone(),
    );
    if state
        .registry
        .insert(
            session_id.clone(),
            SessionEntry {
                created_at,
                state: state_rx,
            },
        )
        .is_some()
    {
        warn!("Session id collision. Replaced an existing registry entry.");
    }
    info!(live_sessions = state.registry.len(), "Client connected.");

    let announced = client_tx
        .send(ServerMessage::SessionCreated {
            session_id: session_id.to_string(),
        })
        .await;
    drop(client_tx);

    if announced.is_ok() {
        let session = coordinator.run(socket_rx.map(client_frame)).await;
        debug!(final_state = ?session.state(), "Coordinator finished.");
    } else {
        warn!("Client went away before the session was announced.");
    }

    state.registry.remove(&session_id);
    let _ = writer.await;
    info!(live_sessions = state.registry.len(), "Client disconnected.");
}

fn client_frame(message: Result<Message, axum::Error>) -> ClientFrame {
    match message {
        Ok(Message::Text(text)) => ClientFrame::Text(text.as_str().to_owned()),
        Ok(Message::Binary(data)) => ClientFrame::Binary(data.len()),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => ClientFrame::Control,
        Ok(Message::Close(_)) => ClientFrame::Close,
        Err(e) => {
            warn!(error = %e, "Error receiving from client WebSocket.");
            ClientFrame::Close
        }
    }
}

/// Forwards coordinator output to the client socket until either side is done.
async fn write_client(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut client_rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = client_rx.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, msg).await {
            warn!(error = %e, "Failed to write to client WebSocket.");
            return;
        }
    }
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
