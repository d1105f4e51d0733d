//! End-to-end test: boots the relay router on an ephemeral port, points it at
//! an in-process fake of the upstream real-time API, and drives it with a real
//! WebSocket client.

use futures_util::{SinkExt, StreamExt};
use relay_api::{config::Config, router::create_router, state::AppState};
use relay_core::session::SessionState;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
    },
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the fake upstream observed on one connection.
struct UpstreamConn {
    authorization: Option<String>,
    /// Text frames received from the relay; closes when the relay disconnects.
    received: mpsc::UnboundedReceiver<Value>,
    /// Frames to push to the relay.
    events: mpsc::UnboundedSender<Value>,
}

/// Boots a fake upstream WebSocket server on an ephemeral port.
async fn start_fake_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<UpstreamConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let (auth_tx, auth_rx) = oneshot::channel();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let auth = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    let _ = auth_tx.send(auth);
                    Ok(resp)
                };
                let ws = accept_hdr_async(stream, callback).await.unwrap();
                let (mut sink, mut stream) = ws.split();
                let (received_tx, received) = mpsc::unbounded_channel();
                let (events, mut events_rx) = mpsc::unbounded_channel::<Value>();
                let _ = conn_tx.send(UpstreamConn {
                    authorization: auth_rx.await.unwrap_or_default(),
                    received,
                    events,
                });
                loop {
                    tokio::select! {
                        msg = stream.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let _ = received_tx.send(serde_json::from_str(text.as_str()).unwrap());
                            }
                            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                            Some(Ok(_)) => {}
                        },
                        event = events_rx.recv() => match event {
                            Some(event) => {
                                if sink.send(Message::Text(event.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            // The test dropped its handle: hang up on the relay.
                            None => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        },
                    }
                }
            });
        }
    });

    (addr, conn_rx)
}

async fn start_relay(config: Config) -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn relay_config(upstream: SocketAddr, api_key: Option<&str>) -> Config {
    Config {
        openai_api_key: api_key.map(|k| SecretString::from(k.to_string())),
        realtime_url: format!("ws://{upstream}/v1/realtime"),
        greeting_delay: Duration::from_millis(50),
        ..Config::default()
    }
}

async fn connect(relay: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{relay}/ws")).await.unwrap();
    client
}

async fn send(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the connection")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_full_call_through_relay() {
    let (upstream_addr, mut upstream_conns) = start_fake_upstream().await;
    let (relay_addr, state) = start_relay(relay_config(upstream_addr, Some("sk-test"))).await;

    let mut client = connect(relay_addr).await;
    let created = next_json(&mut client).await;
    assert_eq!(created["type"], "session.created");
    assert!(created["sessionId"].as_str().unwrap().starts_with("session_"));
    assert_eq!(state.registry.len(), 1);

    send(
        &mut client,
        json!({"type": "session.start", "config": {
            "voice": "shimmer", "instructions": "Be brief.", "agentSpeaksFirst": false}}),
    )
    .await;
    assert_eq!(next_json(&mut client).await, json!({"type": "session.ready"}));
    assert_eq!(
        state.registry.state_counts().get(&SessionState::Ready),
        Some(&1)
    );

    let mut upstream = upstream_conns.recv().await.unwrap();
    assert_eq!(upstream.authorization.as_deref(), Some("Bearer sk-test"));
    let negotiation = upstream.received.recv().await.unwrap();
    assert_eq!(negotiation["type"], "session.update");
    assert_eq!(negotiation["session"]["voice"], "shimmer");
    assert_eq!(negotiation["session"]["instructions"], "Be brief.");
    assert_eq!(negotiation["session"]["modalities"], json!(["text", "audio"]));

    send(&mut client, json!({"type": "audio.input", "audio": "AAECAw=="})).await;
    assert_eq!(
        upstream.received.recv().await.unwrap(),
        json!({"type": "input_audio_buffer.append", "audio": "AAECAw=="})
    );

    for event in [
        json!({"type": "session.created", "session": {"id": "sess_x"}}),
        json!({"type": "response.audio.delta", "delta": "BAUG"}),
        json!({"type": "response.audio_transcript.delta", "item_id": "item_1", "delta": "Hi"}),
        json!({"type": "conversation.item.input_audio_transcription.completed", "item_id": "item_0", "transcript": ""}),
        json!({"type": "conversation.item.input_audio_transcription.completed", "item_id": "item_0", "transcript": "Hello?"}),
        json!({"type": "response.done", "response": {"usage": {
            "input_tokens": 120, "output_tokens": 45, "input_token_details": {"audio_tokens": 30}}}}),
    ] {
        upstream.events.send(event).unwrap();
    }

    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "audio.output", "audio": "BAUG"})
    );
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "transcript.partial", "role": "assistant", "text": "Hi", "itemId": "item_1"})
    );
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "transcript.final", "role": "user", "text": "Hello?", "itemId": "item_0"})
    );
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "usage.update", "inputTokens": 120, "outputTokens": 45, "audioInputMs": 30, "audioOutputMs": 0})
    );

    // Dropping the client closes the upstream link and clears the registry.
    client.close(None).await.unwrap();
    drop(client);
    assert!(upstream.received.recv().await.is_none());
    eventually(|| state.registry.is_empty()).await;
}

#[tokio::test]
async fn test_agent_speaks_first_and_session_end() {
    let (upstream_addr, mut upstream_conns) = start_fake_upstream().await;
    let (relay_addr, _state) = start_relay(relay_config(upstream_addr, Some("sk-test"))).await;

    let mut client = connect(relay_addr).await;
    assert_eq!(next_json(&mut client).await["type"], "session.created");
    send(
        &mut client,
        json!({"type": "session.start", "config": {"agentSpeaksFirst": true}}),
    )
    .await;
    assert_eq!(next_json(&mut client).await["type"], "session.ready");

    let mut upstream = upstream_conns.recv().await.unwrap();
    let negotiation = upstream.received.recv().await.unwrap();
    assert_eq!(negotiation["session"]["voice"], "alloy");
    assert_eq!(
        upstream.received.recv().await.unwrap()["type"],
        "response.create"
    );

    send(&mut client, json!({"type": "session.end"})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "session.ended"}));
    assert!(upstream.received.recv().await.is_none());

    send(&mut client, json!({"type": "session.end"})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "session.ended"}));
}

#[tokio::test]
async fn test_upstream_disconnect_is_reported() {
    let (upstream_addr, mut upstream_conns) = start_fake_upstream().await;
    let (relay_addr, state) = start_relay(relay_config(upstream_addr, Some("sk-test"))).await;

    let mut client = connect(relay_addr).await;
    next_json(&mut client).await;
    send(&mut client, json!({"type": "session.start", "config": {}})).await;
    assert_eq!(next_json(&mut client).await["type"], "session.ready");

    // Dropping the fake's handle makes it close the socket.
    let upstream = upstream_conns.recv().await.unwrap();
    drop(upstream);

    assert_eq!(next_json(&mut client).await, json!({"type": "session.ended"}));
    // The client connection itself stays registered.
    assert_eq!(state.registry.len(), 1);
}

#[tokio::test]
async fn test_missing_credential_never_dials() {
    let (upstream_addr, mut upstream_conns) = start_fake_upstream().await;
    let (relay_addr, _state) = start_relay(relay_config(upstream_addr, None)).await;

    let mut client = connect(relay_addr).await;
    next_json(&mut client).await;
    send(&mut client, json!({"type": "session.start", "config": {}})).await;

    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("credential"));
    assert!(upstream_conns.try_recv().is_err());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (upstream_addr, mut upstream_conns) = start_fake_upstream().await;
    let (relay_addr, state) = start_relay(relay_config(upstream_addr, Some("sk-test"))).await;

    let mut first = connect(relay_addr).await;
    let mut second = connect(relay_addr).await;
    let first_id = next_json(&mut first).await["sessionId"].clone();
    let second_id = next_json(&mut second).await["sessionId"].clone();
    assert_ne!(first_id, second_id);
    eventually(|| state.registry.len() == 2).await;

    send(&mut first, json!({"type": "session.start", "config": {}})).await;
    assert_eq!(next_json(&mut first).await["type"], "session.ready");
    let _upstream = upstream_conns.recv().await.unwrap();

    drop(second);
    eventually(|| state.registry.len() == 1).await;

    send(&mut first, json!({"type": "session.end"})).await;
    assert_eq!(next_json(&mut first).await["type"], "session.ended");
}
