//! Shared data types for signaling, the peer wire and UI events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedPacket;

/// Normalize an identity handle (trimmed, lower-cased)
pub fn normalize_identity(id: &str) -> String {
    id.trim().to_lowercase()
}

// ============================================================================
// Connection States
// ============================================================================

/// Transport-level state of one peer connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection is never reused
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Offer/answer progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
        }
    }
}

/// Message channel lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

// ============================================================================
// Signaling Types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description produced by the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Network path candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Opaque payload relayed between peers by the signaling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: SessionDescription,
    },
    Answer {
        sdp: SessionDescription,
    },
    Candidate {
        candidate: IceCandidate,
    },
    GroupInvite {
        #[serde(rename = "groupId")]
        group_id: String,
        members: Vec<String>,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::GroupInvite { .. } => "group_invite",
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Personal or group message tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Personal,
    Group,
}

/// Packet sent over an open peer channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WirePacket {
    #[serde(flatten)]
    pub encrypted: EncryptedPacket,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl WirePacket {
    pub fn proof(&self) -> Proof {
        Proof {
            ciphertext: self.encrypted.ciphertext.clone(),
            iv: self.encrypted.iv.clone(),
        }
    }
}

/// Informational excerpt of a sent or received packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proof {
    pub ciphertext: String,
    pub iv: String,
}

/// Content waiting for a peer's channel to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub content: String,
    pub is_group: bool,
    pub group_id: Option<String>,
}

/// Relay-routed message (legacy direct-relay mode)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMessage {
    pub from: String,
    pub to: String,
    pub payload: EncryptedPacket,
    /// Hex SHA-256 of the ciphertext bytes
    pub payload_hash: String,
}

/// Relay-routed message as delivered to the recipient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayDelivery {
    pub from: String,
    pub payload: EncryptedPacket,
    pub payload_hash: String,
    /// Hash computed by the relay on receipt
    pub server_hash: String,
}

// ============================================================================
// Events
// ============================================================================

/// Events emitted toward the UI layer
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum MeshEvent {
    StatusUpdate {
        target: String,
        status: ConnectionState,
    },
    #[serde(rename_all = "camelCase")]
    MessageReceived {
        from: String,
        text: String,
        #[serde(rename = "type")]
        kind: MessageKind,
        group_id: Option<String>,
        proof: Proof,
        received_at: DateTime<Utc>,
    },
    ContactConnected {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    GroupInvite {
        group_id: String,
        members: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Tampered {
        from: String,
        payload_hash: String,
        server_hash: String,
        computed: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
}

// ============================================================================
// Snapshots
// ============================================================================

/// Point-in-time view of one peer connection
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub target_id: String,
    pub connection_state: ConnectionState,
    pub signaling_state: SignalingState,
    pub channel: Option<ChannelState>,
    pub queued_candidates: usize,
}

/// Point-in-time view of the whole controller
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeshSnapshot {
    pub user_id: String,
    pub peers: Vec<PeerSnapshot>,
    pub tracked: Vec<String>,
    /// Queued message count per target
    pub pending: Vec<(String, usize)>,
}

impl MeshSnapshot {
    pub fn peer(&self, target_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.target_id == target_id)
    }

    pub fn pending_for(&self, target_id: &str) -> usize {
        self.pending
            .iter()
            .find(|(id, _)| id == target_id)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}
