//! WebSocket relay client
//!
//! Frames are JSON objects `{event, ack?, data}`. Requests that expect a reply
//! carry an `ack` id and the relay answers with an `ack` frame bearing the same
//! id. A background task owns the socket, reconnects with exponential backoff
//! when the link drops, and reports [`SignalingEvent::Reconnected`] so the mesh
//! can register again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{SignalingClient, SignalingEvent};
use crate::crypto::PublicKeyJwk;
use crate::error::{MeshError, MeshResult};
use crate::models::{RelayDelivery, RelayMessage, SignalPayload};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct InboundSignal {
    sender: String,
    payload: SignalPayload,
}

#[derive(Debug, Deserialize)]
struct PubkeyResponse {
    #[serde(default)]
    pubkey_jwk: Option<PublicKeyJwk>,
}

enum SessionEnd {
    ClientDropped,
    LinkLost,
}

/// Relay client over a WebSocket
pub struct WsSignalingClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    ack_timeout: Duration,
}

impl WsSignalingClient {
    /// Connect to the relay at `url`
    ///
    /// Fails if the first connection cannot be made; later drops are retried
    /// in the background.
    pub async fn connect(
        url: &str,
        ack_timeout: Duration,
    ) -> MeshResult<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| MeshError::Signaling(format!("Failed to connect to {}: {}", url, e)))?;
        tracing::info!("Connected to relay at {}", url);

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(connection_loop(
            url.to_string(),
            ws,
            outgoing_rx,
            events_tx,
            pending.clone(),
        ));

        Ok((
            Self {
                outgoing: outgoing_tx,
                pending,
                next_ack: AtomicU64::new(1),
                ack_timeout,
            },
            events_rx,
        ))
    }

    fn push(&self, event: &str, ack: Option<u64>, data: Value) -> MeshResult<()> {
        let frame = serde_json::to_string(&Frame {
            event: event.to_string(),
            ack,
            data,
        })?;
        self.outgoing
            .send(frame)
            .map_err(|_| MeshError::Signaling("relay connection task stopped".to_string()))
    }

    /// Send a frame and wait for the relay's ack payload
    async fn request(&self, event: &str, data: Value) -> MeshResult<Value> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.push(event, Some(id), data)?;

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MeshError::Signaling(format!("relay link lost during {}", event))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(MeshError::Signaling(format!("timed out waiting for {} ack", event)))
            }
        }
    }
}

#[async_trait]
impl SignalingClient for WsSignalingClient {
    async fn register(&self, user_id: &str, public_key: &PublicKeyJwk) -> MeshResult<()> {
        self.request("register", json!({ "user_id": user_id, "pubkey_jwk": public_key }))
            .await?;
        tracing::info!("Registered {} with relay", user_id);
        Ok(())
    }

    async fn request_public_key(&self, user_id: &str) -> MeshResult<Option<PublicKeyJwk>> {
        let reply = self.request("request_pubkey", json!({ "user_id": user_id })).await?;
        if reply.is_null() {
            return Ok(None);
        }
        let response: PubkeyResponse = serde_json::from_value(reply)?;
        Ok(response.pubkey_jwk)
    }

    async fn send_signal(&self, target: &str, sender: &str, payload: &SignalPayload) -> MeshResult<()> {
        self.push(
            "signal",
            None,
            json!({ "target": target, "sender": sender, "payload": payload }),
        )
    }

    async fn relay_message(&self, message: &RelayMessage) -> MeshResult<()> {
        self.push("send_message", None, serde_json::to_value(message)?)
    }
}

async fn connection_loop(
    url: String,
    mut ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    pending: PendingAcks,
) {
    loop {
        match run_session(ws, &mut outgoing, &events, &pending).await {
            SessionEnd::ClientDropped => {
                tracing::debug!("Relay client dropped, closing connection");
                return;
            }
            SessionEnd::LinkLost => {
                tracing::warn!("Relay connection lost");
                // Waiters see their oneshot cancelled
                pending.lock().await.clear();
            }
        }

        let mut delay = INITIAL_BACKOFF;
        ws = loop {
            tokio::time::sleep(delay).await;
            if outgoing.is_closed() {
                return;
            }
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    tracing::warn!("Relay reconnect failed (retry in {:?}): {}", delay, e);
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        };

        tracing::info!("Reconnected to relay at {}", url);
        if events.send(SignalingEvent::Reconnected).is_err() {
            return;
        }
    }
}

async fn run_session(
    ws: WsStream,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    pending: &PendingAcks,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::warn!("Relay write failed: {}", e);
                        return SessionEnd::LinkLost;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return SessionEnd::ClientDropped;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => handle_frame(&text, events, pending).await,
                Some(Ok(Message::Close(_))) | None => return SessionEnd::LinkLost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Relay read failed: {}", e);
                    return SessionEnd::LinkLost;
                }
            },
        }
    }
}

async fn handle_frame(text: &str, events: &mpsc::UnboundedSender<SignalingEvent>, pending: &PendingAcks) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Ignoring malformed relay frame: {}", e);
            return;
        }
    };

    match frame.event.as_str() {
        "ack" => {
            let Some(id) = frame.ack else { return };
            if let Some(waiter) = pending.lock().await.remove(&id) {
                let _ = waiter.send(frame.data);
            }
        }
        "signal" => match serde_json::from_value::<InboundSignal>(frame.data) {
            Ok(signal) => {
                let _ = events.send(SignalingEvent::Signal {
                    sender: signal.sender,
                    payload: signal.payload,
                });
            }
            Err(e) => tracing::warn!("Ignoring malformed signal: {}", e),
        },
        "deliver_message" => match serde_json::from_value::<RelayDelivery>(frame.data) {
            Ok(delivery) => {
                let _ = events.send(SignalingEvent::Delivery(delivery));
            }
            Err(e) => tracing::warn!("Ignoring malformed delivery: {}", e),
        },
        "sent" => tracing::debug!("Relay accepted message: {}", frame.data),
        other => tracing::debug!("Ignoring relay event: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal relay: acks `register`, answers `request_pubkey`, and pushes one
    /// signal after registration.
    async fn spawn_relay(key: PublicKeyJwk) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: Frame = serde_json::from_str(&text).unwrap();
                let reply = match frame.event.as_str() {
                    "register" => json!({ "event": "ack", "ack": frame.ack, "data": { "ok": true } }),
                    "request_pubkey" if frame.data["user_id"] == "bob" => {
                        json!({ "event": "ack", "ack": frame.ack, "data": { "pubkey_jwk": key } })
                    }
                    "request_pubkey" => json!({ "event": "ack", "ack": frame.ack, "data": null }),
                    _ => continue,
                };
                ws.send(Message::Text(reply.to_string())).await.unwrap();
                if frame.event == "register" {
                    let signal = json!({
                        "event": "signal",
                        "data": {
                            "sender": "bob",
                            "payload": { "type": "group_invite", "groupId": "g1", "members": ["alice", "bob"] }
                        }
                    });
                    ws.send(Message::Text(signal.to_string())).await.unwrap();
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_register_lookup_and_inbound_signal() {
        let bob_key = KeyPair::generate().public_jwk();
        let url = spawn_relay(bob_key.clone()).await;
        let (client, mut events) = WsSignalingClient::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();

        client
            .register("alice", &KeyPair::generate().public_jwk())
            .await
            .unwrap();
        assert_eq!(client.request_public_key("bob").await.unwrap(), Some(bob_key));
        assert_eq!(client.request_public_key("carol").await.unwrap(), None);

        match events.recv().await.unwrap() {
            SignalingEvent::Signal { sender, payload } => {
                assert_eq!(sender, "bob");
                assert_eq!(payload.kind(), "group_invite");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = WsSignalingClient::connect(&format!("ws://{}", addr), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MeshError::Signaling(_))));
    }
}
