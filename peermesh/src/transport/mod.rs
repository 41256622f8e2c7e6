//! Transport capability
//!
//! The reliable-transport / NAT-traversal primitive is supplied from outside.
//! Given a local description it produces offers and answers plus a stream of
//! local candidates, and once the remote description and candidates are in
//! place it opens an ordered, reliable, message-oriented channel.
//!
//! Everything the transport observes (candidates, state changes, channel
//! traffic) is reported as a [`TransportEvent`] through a
//! [`TransportEventSink`], so the mesh controller consumes it on its own task.

pub mod loopback;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{ConnectionState, IceCandidate, SessionDescription};

pub use loopback::LoopbackNetwork;

/// Errors reported by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// Description or candidate rejected
    #[error("Negotiation rejected: {0}")]
    Negotiation(String),

    /// Channel could not carry the message
    #[error("Channel error: {0}")]
    Channel(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,
}

/// What happened on a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

/// Event raised by the transport of one peer connection
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub peer_id: String,
    /// Identifies the connection attempt that raised the event
    pub connection_id: u64,
    pub kind: TransportEventKind,
}

/// Sender half handed to each transport at creation
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer_id: String,
    connection_id: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    pub fn new(peer_id: &str, connection_id: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            connection_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Report an event; silently dropped once the controller has stopped
    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            kind,
        });
    }
}

/// Creates one transport per peer connection attempt
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local_id: &str,
        remote_id: &str,
        initiator: bool,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

/// Negotiation and channel operations of one peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce a local offer and apply it as the local description
    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    /// Produce a local answer and apply it as the local description
    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Send one text message over the open channel
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    /// Release the transport
    async fn close(&mut self);
}
