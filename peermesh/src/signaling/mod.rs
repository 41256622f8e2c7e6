//! Signaling relay client
//!
//! Thin message-passing adapter to the external relay. Outbound requests are
//! methods on [`SignalingClient`]; everything the relay pushes to us arrives as
//! a [`SignalingEvent`] on the receiver returned when the client connects.

pub mod loopback;
pub mod websocket;

use async_trait::async_trait;

use crate::crypto::PublicKeyJwk;
use crate::error::MeshResult;
use crate::models::{RelayDelivery, RelayMessage, SignalPayload};

pub use loopback::{LoopbackRelay, LoopbackSignaling};
pub use websocket::WsSignalingClient;

/// Inbound traffic from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Peer-to-peer signal addressed to us
    Signal { sender: String, payload: SignalPayload },
    /// Relay-routed encrypted message
    Delivery(RelayDelivery),
    /// The relay link was re-established; registrations must be repeated
    Reconnected,
}

/// Requests the mesh makes of the relay
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Associate an identity with its public key for discovery
    async fn register(&self, user_id: &str, public_key: &PublicKeyJwk) -> MeshResult<()>;

    /// Look up a public key; `None` when the user is unknown or offline
    async fn request_public_key(&self, user_id: &str) -> MeshResult<Option<PublicKeyJwk>>;

    /// Relay an opaque signal to `target`
    async fn send_signal(&self, target: &str, sender: &str, payload: &SignalPayload) -> MeshResult<()>;

    /// Send an encrypted message through the relay itself
    async fn relay_message(&self, message: &RelayMessage) -> MeshResult<()>;
}
