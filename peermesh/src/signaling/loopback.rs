//! In-process signaling relay
//!
//! Mirrors what the relay server does: a registration table binding each
//! identity to one connected client, a public-key directory, and server-side
//! hashing of relay-routed messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{SignalingClient, SignalingEvent};
use crate::crypto::{sha256_hex, PublicKeyJwk};
use crate::error::{MeshError, MeshResult};
use crate::models::{RelayDelivery, RelayMessage, SignalPayload};

#[derive(Default)]
struct RelayState {
    next_client: u64,
    /// user_id -> (client id, event sender)
    online: HashMap<String, (u64, mpsc::UnboundedSender<SignalingEvent>)>,
    /// user_id -> published public key
    keys: HashMap<String, PublicKeyJwk>,
}

/// Shared in-process relay
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection to the relay
    pub async fn connect(&self) -> (LoopbackSignaling, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.next_client += 1;
        let client = LoopbackSignaling {
            relay: self.clone(),
            client_id: state.next_client,
            tx,
        };
        (client, rx)
    }

    /// Deliver a relay-routed message as-is, bypassing server hashing
    pub async fn inject_delivery(&self, to: &str, delivery: RelayDelivery) -> bool {
        let state = self.state.lock().await;
        match state.online.get(to) {
            Some((_, tx)) => tx.send(SignalingEvent::Delivery(delivery)).is_ok(),
            None => false,
        }
    }

    /// Simulate the relay link of `user_id` dropping and coming back
    pub async fn bounce(&self, user_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.online.remove(user_id) {
            Some((_, tx)) => tx.send(SignalingEvent::Reconnected).is_ok(),
            None => false,
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.state.lock().await.online.contains_key(user_id)
    }
}

/// One client's connection to a [`LoopbackRelay`]
pub struct LoopbackSignaling {
    relay: LoopbackRelay,
    client_id: u64,
    tx: mpsc::UnboundedSender<SignalingEvent>,
}

#[async_trait]
impl SignalingClient for LoopbackSignaling {
    async fn register(&self, user_id: &str, public_key: &PublicKeyJwk) -> MeshResult<()> {
        let mut state = self.relay.state.lock().await;
        state
            .online
            .insert(user_id.to_string(), (self.client_id, self.tx.clone()));
        state.keys.insert(user_id.to_string(), public_key.clone());
        tracing::debug!("Relay: registered {} (client {})", user_id, self.client_id);
        Ok(())
    }

    async fn request_public_key(&self, user_id: &str) -> MeshResult<Option<PublicKeyJwk>> {
        let state = self.relay.state.lock().await;
        if !state.online.contains_key(user_id) {
            return Ok(None);
        }
        Ok(state.keys.get(user_id).cloned())
    }

    async fn send_signal(&self, target: &str, sender: &str, payload: &SignalPayload) -> MeshResult<()> {
        let state = self.relay.state.lock().await;
        match state.online.get(target) {
            Some((_, tx)) => {
                let _ = tx.send(SignalingEvent::Signal {
                    sender: sender.to_string(),
                    payload: payload.clone(),
                });
            }
            None => tracing::debug!("Relay: dropping {} for offline {}", payload.kind(), target),
        }
        Ok(())
    }

    async fn relay_message(&self, message: &RelayMessage) -> MeshResult<()> {
        let ciphertext = message.payload.ciphertext_bytes()?;
        let state = self.relay.state.lock().await;
        let (_, tx) = state
            .online
            .get(&message.to)
            .ok_or_else(|| MeshError::Signaling(format!("{} is not online", message.to)))?;
        let _ = tx.send(SignalingEvent::Delivery(RelayDelivery {
            from: message.from.clone(),
            payload: message.payload.clone(),
            payload_hash: message.payload_hash.clone(),
            server_hash: sha256_hex(&ciphertext),
        }));
        Ok(())
    }
}
