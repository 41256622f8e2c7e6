//! In-process transport
//!
//! Every transport created by a [`LoopbackNetwork`] is an endpoint keyed by
//! `(local, remote)`. Two endpoints connect once each holds the other's
//! description and at least one of the other's candidates, and both identities
//! are reachable. Descriptions and candidates name the endpoint that produced
//! them, so material from a torn-down attempt never connects a new one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PeerTransport, TransportError, TransportEventKind, TransportEventSink, TransportFactory};
use crate::models::{ConnectionState, IceCandidate, SdpType, SessionDescription};

const SDP_PREFIX: &str = "v=0 o=loopback";

/// One message carried between two endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub from: String,
    pub to: String,
    pub payload: String,
}

#[derive(Debug)]
struct Endpoint {
    id: u64,
    sink: TransportEventSink,
    local_set: bool,
    /// Endpoint that produced the applied remote description
    remote_endpoint: Option<u64>,
    /// Endpoints whose candidates were applied
    candidates_from: HashSet<u64>,
    connecting_reported: bool,
    connected: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_endpoint: u64,
    endpoints: HashMap<(String, String), Endpoint>,
    unreachable: HashSet<String>,
    wire: Vec<WireRecord>,
}

impl NetworkState {
    fn endpoint_mut(&mut self, local: &str, remote: &str, id: u64) -> Result<&mut Endpoint, TransportError> {
        match self.endpoints.get_mut(&(local.to_string(), remote.to_string())) {
            Some(endpoint) if endpoint.id == id => Ok(endpoint),
            _ => Err(TransportError::Closed),
        }
    }

    /// Report `connecting` the first time an endpoint holds both descriptions
    fn report_connecting(&mut self, local: &str, remote: &str) {
        if let Some(endpoint) = self.endpoints.get_mut(&(local.to_string(), remote.to_string())) {
            if endpoint.local_set && endpoint.remote_endpoint.is_some() && !endpoint.connecting_reported {
                endpoint.connecting_reported = true;
                endpoint
                    .sink
                    .emit(TransportEventKind::ConnectionState(ConnectionState::Connecting));
            }
        }
    }

    fn try_connect(&mut self, local: &str, remote: &str) {
        if self.unreachable.contains(local) || self.unreachable.contains(remote) {
            return;
        }
        let a_key = (local.to_string(), remote.to_string());
        let b_key = (remote.to_string(), local.to_string());
        let ready = match (self.endpoints.get(&a_key), self.endpoints.get(&b_key)) {
            (Some(a), Some(b)) => {
                !a.connected
                    && !b.connected
                    && a.local_set
                    && b.local_set
                    && a.remote_endpoint == Some(b.id)
                    && b.remote_endpoint == Some(a.id)
                    && a.candidates_from.contains(&b.id)
                    && b.candidates_from.contains(&a.id)
            }
            _ => false,
        };
        if !ready {
            return;
        }

        tracing::debug!("Loopback link up: {} <-> {}", local, remote);
        for key in [&a_key, &b_key] {
            if let Some(endpoint) = self.endpoints.get_mut(key) {
                endpoint.connected = true;
                endpoint
                    .sink
                    .emit(TransportEventKind::ConnectionState(ConnectionState::Connected));
                endpoint.sink.emit(TransportEventKind::ChannelOpen);
            }
        }
    }

    /// Drop the link between two endpoints, notifying both sides
    fn break_link(&mut self, local: &str, remote: &str) {
        for key in [
            (local.to_string(), remote.to_string()),
            (remote.to_string(), local.to_string()),
        ] {
            if let Some(endpoint) = self.endpoints.get_mut(&key) {
                if endpoint.connected {
                    endpoint.connected = false;
                    endpoint
                        .sink
                        .emit(TransportEventKind::ConnectionState(ConnectionState::Disconnected));
                    endpoint.sink.emit(TransportEventKind::ChannelClosed);
                }
            }
        }
    }

    /// Remove an endpoint; a connected counterpart sees `disconnected`
    fn detach(&mut self, local: &str, remote: &str) {
        let key = (local.to_string(), remote.to_string());
        if let Some(endpoint) = self.endpoints.remove(&key) {
            if endpoint.connected {
                if let Some(other) = self.endpoints.get_mut(&(remote.to_string(), local.to_string())) {
                    if other.connected {
                        other.connected = false;
                        other
                            .sink
                            .emit(TransportEventKind::ConnectionState(ConnectionState::Disconnected));
                        other.sink.emit(TransportEventKind::ChannelClosed);
                    }
                }
            }
        }
    }
}

/// In-process network of loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an identity (un)reachable; going unreachable drops its live links
    pub async fn set_reachable(&self, user_id: &str, reachable: bool) {
        let mut state = self.state.lock().await;
        if reachable {
            state.unreachable.remove(user_id);
            return;
        }

        state.unreachable.insert(user_id.to_string());
        let links: Vec<(String, String)> = state
            .endpoints
            .iter()
            .filter(|((local, _), endpoint)| local == user_id && endpoint.connected)
            .map(|(key, _)| key.clone())
            .collect();
        for (local, remote) in links {
            state.break_link(&local, &remote);
        }
    }

    /// Every message carried so far, in send order
    pub async fn wire_log(&self) -> Vec<WireRecord> {
        self.state.lock().await.wire.clone()
    }

    /// Whether the `(local, remote)` endpoint currently has an open link
    pub async fn is_linked(&self, local: &str, remote: &str) -> bool {
        let state = self.state.lock().await;
        state
            .endpoints
            .get(&(local.to_string(), remote.to_string()))
            .map(|e| e.connected)
            .unwrap_or(false)
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        local_id: &str,
        remote_id: &str,
        initiator: bool,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut state = self.state.lock().await;
        state.detach(local_id, remote_id);

        state.next_endpoint += 1;
        let id = state.next_endpoint;
        state.endpoints.insert(
            (local_id.to_string(), remote_id.to_string()),
            Endpoint {
                id,
                sink: sink.clone(),
                local_set: false,
                remote_endpoint: None,
                candidates_from: HashSet::new(),
                connecting_reported: false,
                connected: false,
            },
        );
        tracing::debug!(
            "Loopback endpoint {} created: {} -> {} (initiator: {})",
            id,
            local_id,
            remote_id,
            initiator
        );

        Ok(Box::new(LoopbackTransport {
            network: self.clone(),
            local: local_id.to_string(),
            remote: remote_id.to_string(),
            endpoint_id: id,
            sink,
            closed: false,
        }))
    }
}

/// Transport half of one loopback endpoint
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local: String,
    remote: String,
    endpoint_id: u64,
    sink: TransportEventSink,
    closed: bool,
}

impl LoopbackTransport {
    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: format!("{} {} {}", SDP_PREFIX, self.endpoint_id, self.local),
        }
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.endpoint_id,
                40_000 + self.endpoint_id % 20_000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn apply_local(&mut self, sdp_type: SdpType) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let description = self.description(sdp_type);
        {
            let mut state = self.network.state.lock().await;
            state.endpoint_mut(&self.local, &self.remote, self.endpoint_id)?.local_set = true;
            state.report_connecting(&self.local, &self.remote);
        }
        self.sink.emit(TransportEventKind::LocalCandidate(self.candidate()));
        Ok(description)
    }
}

fn parse_description_owner(sdp: &str) -> Option<u64> {
    sdp.strip_prefix(SDP_PREFIX)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn parse_candidate_owner(candidate: &str) -> Option<u64> {
    candidate
        .strip_prefix("candidate:")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.apply_local(SdpType::Offer).await
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let mut state = self.network.state.lock().await;
        let has_remote = state
            .endpoint_mut(&self.local, &self.remote, self.endpoint_id)?
            .remote_endpoint
            .is_some();
        drop(state);
        if !has_remote {
            return Err(TransportError::Negotiation(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        self.apply_local(SdpType::Answer).await
    }

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let owner = parse_description_owner(&description.sdp).ok_or_else(|| {
            TransportError::Negotiation(format!("unrecognized description: {}", description.sdp))
        })?;

        let mut state = self.network.state.lock().await;
        state.endpoint_mut(&self.local, &self.remote, self.endpoint_id)?.remote_endpoint = Some(owner);
        state.report_connecting(&self.local, &self.remote);
        state.try_connect(&self.local, &self.remote);
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let owner = parse_candidate_owner(&candidate.candidate).ok_or_else(|| {
            TransportError::Negotiation(format!("unrecognized candidate: {}", candidate.candidate))
        })?;

        let mut state = self.network.state.lock().await;
        state
            .endpoint_mut(&self.local, &self.remote, self.endpoint_id)?
            .candidates_from
            .insert(owner);
        state.try_connect(&self.local, &self.remote);
        Ok(())
    }

    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        let mut state = self.network.state.lock().await;
        if !state.endpoint_mut(&self.local, &self.remote, self.endpoint_id)?.connected {
            return Err(TransportError::Channel("channel not open".to_string()));
        }
        let counterpart = state
            .endpoints
            .get(&(self.remote.clone(), self.local.clone()))
            .filter(|e| e.connected)
            .ok_or_else(|| TransportError::Channel("counterpart gone".to_string()))?;
        counterpart
            .sink
            .emit(TransportEventKind::ChannelMessage(message.clone()));
        state.wire.push(WireRecord {
            from: self.local.clone(),
            to: self.remote.clone(),
            payload: message,
        });
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.network.state.lock().await;
        let owns_slot = state
            .endpoints
            .get(&(self.local.clone(), self.remote.clone()))
            .map(|e| e.id == self.endpoint_id)
            .unwrap_or(false);
        if owns_slot {
            state.detach(&self.local, &self.remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use tokio::sync::mpsc;

    struct Side {
        transport: Box<dyn PeerTransport>,
        rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    async fn side(network: &LoopbackNetwork, local: &str, remote: &str, initiator: bool) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = TransportEventSink::new(remote, 1, tx);
        let transport = network.create(local, remote, initiator, sink).await.unwrap();
        Side { transport, rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind);
        }
        out
    }

    fn candidate_of(events: &[TransportEventKind]) -> IceCandidate {
        events
            .iter()
            .find_map(|k| match k {
                TransportEventKind::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap()
    }

    async fn handshake(a: &mut Side, b: &mut Side) -> (Vec<TransportEventKind>, Vec<TransportEventKind>) {
        let offer = a.transport.create_offer().await.unwrap();
        let a_events = drain(&mut a.rx);
        b.transport.set_remote_description(&offer).await.unwrap();
        let answer = b.transport.create_answer().await.unwrap();
        let b_events = drain(&mut b.rx);
        a.transport.set_remote_description(&answer).await.unwrap();
        b.transport.add_candidate(&candidate_of(&a_events)).await.unwrap();
        a.transport.add_candidate(&candidate_of(&b_events)).await.unwrap();
        (drain(&mut a.rx), drain(&mut b.rx))
    }

    #[tokio::test]
    async fn test_handshake_opens_channel() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob", true).await;
        let mut b = side(&network, "bob", "alice", false).await;

        let (a_events, b_events) = handshake(&mut a, &mut b).await;
        assert!(a_events.contains(&TransportEventKind::ChannelOpen));
        assert!(b_events.contains(&TransportEventKind::ChannelOpen));
        assert!(network.is_linked("alice", "bob").await);

        a.transport.send("ping".to_string()).await.unwrap();
        assert_eq!(drain(&mut b.rx), vec![TransportEventKind::ChannelMessage("ping".to_string())]);
        assert_eq!(network.wire_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_peer_never_connects() {
        let network = LoopbackNetwork::new();
        network.set_reachable("bob", false).await;
        let mut a = side(&network, "alice", "bob", true).await;
        let mut b = side(&network, "bob", "alice", false).await;

        let (a_events, _) = handshake(&mut a, &mut b).await;
        assert!(!a_events.contains(&TransportEventKind::ChannelOpen));
        assert!(a.transport.send("lost".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_reports_disconnect_to_counterpart() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob", true).await;
        let mut b = side(&network, "bob", "alice", false).await;
        handshake(&mut a, &mut b).await;

        a.transport.close().await;
        let b_events = drain(&mut b.rx);
        assert!(b_events.contains(&TransportEventKind::ConnectionState(ConnectionState::Disconnected)));
        assert!(b_events.contains(&TransportEventKind::ChannelClosed));
    }

    #[tokio::test]
    async fn test_stale_description_does_not_connect() {
        let network = LoopbackNetwork::new();
        let mut old = side(&network, "alice", "bob", true).await;
        let stale_offer = old.transport.create_offer().await.unwrap();
        let stale_events = drain(&mut old.rx);

        // A replacement attempt takes over the slot
        let mut fresh = side(&network, "alice", "bob", true).await;
        let mut b = side(&network, "bob", "alice", false).await;
        b.transport.set_remote_description(&stale_offer).await.unwrap();
        b.transport.create_answer().await.unwrap();
        b.transport.add_candidate(&candidate_of(&stale_events)).await.unwrap();

        assert!(!drain(&mut b.rx).contains(&TransportEventKind::ChannelOpen));
        assert!(drain(&mut fresh.rx).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_foreign_description() {
        let network = LoopbackNetwork::new();
        let mut b = side(&network, "bob", "alice", false).await;
        let bogus = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "v=0 o=- 0 0 IN IP4 0.0.0.0".to_string(),
        };
        assert!(matches!(
            b.transport.set_remote_description(&bogus).await,
            Err(TransportError::Negotiation(_))
        ));
        assert!(b.transport.create_answer().await.is_err());
    }
}
