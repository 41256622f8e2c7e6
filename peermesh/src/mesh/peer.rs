//! Peer connection state machine
//!
//! One `PeerConnection` per remote identity. Its connection and signaling
//! states change only through the transition methods below, which the
//! controller calls in response to signals and transport events.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{MeshError, MeshResult};
use crate::models::{
    ChannelState, ConnectionState, IceCandidate, PeerSnapshot, SessionDescription, SignalingState,
};
use crate::transport::{PeerTransport, TransportError};

/// Run a transport negotiation step with an upper time bound
async fn bounded<T>(
    limit: Duration,
    step: &str,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> MeshResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(|e| MeshError::Negotiation(format!("{} failed: {}", step, e))),
        Err(_) => Err(MeshError::Negotiation(format!("{} timed out after {:?}", step, limit))),
    }
}

pub struct PeerConnection {
    pub target_id: String,
    /// Distinguishes this attempt's transport events from earlier ones
    pub connection_id: u64,
    pub initiator: bool,
    connection_state: ConnectionState,
    signaling_state: SignalingState,
    started_at: Instant,
    remote_description_set: bool,
    candidate_queue: VecDeque<IceCandidate>,
    channel: Option<ChannelState>,
    transport: Box<dyn PeerTransport>,
}

impl PeerConnection {
    pub fn new(target_id: &str, connection_id: u64, initiator: bool, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            target_id: target_id.to_string(),
            connection_id,
            initiator,
            connection_state: ConnectionState::New,
            signaling_state: SignalingState::Stable,
            started_at: Instant::now(),
            remote_description_set: false,
            candidate_queue: VecDeque::new(),
            // The initiator opens the channel; the answerer learns of it on open
            channel: initiator.then_some(ChannelState::Connecting),
            transport,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.channel
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel == Some(ChannelState::Open)
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidate_queue.len()
    }

    /// Time since the current negotiation attempt started
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn restart_timer(&mut self) {
        self.started_at = Instant::now();
    }

    /// Still negotiating after the grace window
    pub fn is_stuck(&self, grace: Duration) -> bool {
        if self.connection_state == ConnectionState::Connected || self.age() <= grace {
            return false;
        }
        matches!(self.connection_state, ConnectionState::New | ConnectionState::Connecting)
            || self.signaling_state == SignalingState::HaveLocalOffer
    }

    /// Must be torn down and replaced
    pub fn needs_recycle(&self, grace: Duration) -> bool {
        self.connection_state.is_terminal()
            || self.channel == Some(ChannelState::Closed)
            || self.is_stuck(grace)
    }

    /// Create and apply a local offer
    pub async fn create_offer(&mut self, limit: Duration) -> MeshResult<SessionDescription> {
        let offer = bounded(limit, "create offer", self.transport.create_offer()).await?;
        self.signaling_state = SignalingState::HaveLocalOffer;
        self.restart_timer();
        Ok(offer)
    }

    /// Accept a remote offer and produce the answer
    pub async fn accept_offer(&mut self, offer: &SessionDescription, limit: Duration) -> MeshResult<SessionDescription> {
        bounded(limit, "set remote offer", self.transport.set_remote_description(offer)).await?;
        self.signaling_state = SignalingState::HaveRemoteOffer;
        self.remote_description_set = true;
        self.drain_candidates(limit).await;

        let answer = bounded(limit, "create answer", self.transport.create_answer()).await?;
        self.signaling_state = SignalingState::Stable;
        Ok(answer)
    }

    /// Accept the answer to our outstanding offer
    pub async fn accept_answer(&mut self, answer: &SessionDescription, limit: Duration) -> MeshResult<()> {
        if self.signaling_state != SignalingState::HaveLocalOffer {
            return Err(MeshError::Negotiation(format!(
                "answer from {} while {}",
                self.target_id, self.signaling_state
            )));
        }
        bounded(limit, "set remote answer", self.transport.set_remote_description(answer)).await?;
        self.signaling_state = SignalingState::Stable;
        self.remote_description_set = true;
        self.drain_candidates(limit).await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until a remote description exists
    pub async fn add_candidate(&mut self, candidate: IceCandidate, limit: Duration) -> MeshResult<()> {
        if !self.remote_description_set {
            self.candidate_queue.push_back(candidate);
            return Ok(());
        }
        bounded(limit, "add candidate", self.transport.add_candidate(&candidate)).await
    }

    /// Apply queued candidates in arrival order; failures are logged and skipped
    async fn drain_candidates(&mut self, limit: Duration) {
        if !self.candidate_queue.is_empty() {
            tracing::debug!(
                "Applying {} queued candidates for {}",
                self.candidate_queue.len(),
                self.target_id
            );
        }
        while let Some(candidate) = self.candidate_queue.pop_front() {
            if let Err(e) = bounded(limit, "add queued candidate", self.transport.add_candidate(&candidate)).await {
                tracing::warn!("Queued candidate for {} rejected: {}", self.target_id, e);
            }
        }
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn open_channel(&mut self) {
        self.channel = Some(ChannelState::Open);
    }

    pub fn close_channel(&mut self) {
        if self.channel.is_some() {
            self.channel = Some(ChannelState::Closed);
        }
    }

    /// Send over the open channel
    pub async fn send(&mut self, message: String, limit: Duration) -> MeshResult<()> {
        if !self.is_channel_open() {
            return Err(TransportError::Channel(format!("channel to {} is not open", self.target_id)).into());
        }
        match tokio::time::timeout(limit, self.transport.send(message)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Channel(format!("send to {} timed out", self.target_id)).into()),
        }
    }

    /// Release the transport
    pub async fn close(&mut self) {
        self.transport.close().await;
        self.connection_state = ConnectionState::Closed;
        self.close_channel();
        self.candidate_queue.clear();
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            target_id: self.target_id.clone(),
            connection_state: self.connection_state,
            signaling_state: self.signaling_state,
            channel: self.channel,
            queued_candidates: self.candidate_queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SdpType;
    use crate::transport::{LoopbackNetwork, TransportEvent, TransportEventSink, TransportFactory};
    use tokio::sync::mpsc;

    async fn peer(
        network: &LoopbackNetwork,
        local: &str,
        remote: &str,
        initiator: bool,
    ) -> (PeerConnection, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = network
            .create(local, remote, initiator, TransportEventSink::new(remote, 1, tx))
            .await
            .unwrap();
        (PeerConnection::new(remote, 1, initiator, transport), rx)
    }

    const LIMIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_offer_moves_to_have_local_offer() {
        let network = LoopbackNetwork::new();
        let (mut alice, _rx) = peer(&network, "alice", "bob", true).await;
        assert_eq!(alice.signaling_state(), SignalingState::Stable);
        assert_eq!(alice.channel_state(), Some(ChannelState::Connecting));

        let offer = alice.create_offer(LIMIT).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(alice.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let network = LoopbackNetwork::new();
        let (mut alice, _alice_rx) = peer(&network, "alice", "bob", true).await;
        let (mut bob, _bob_rx) = peer(&network, "bob", "alice", false).await;
        let offer = alice.create_offer(LIMIT).await.unwrap();

        let early = IceCandidate {
            candidate: "candidate:99 1 udp 1 127.0.0.1 1 typ host".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        bob.add_candidate(early.clone(), LIMIT).await.unwrap();
        bob.add_candidate(early, LIMIT).await.unwrap();
        assert_eq!(bob.queued_candidates(), 2);

        bob.accept_offer(&offer, LIMIT).await.unwrap();
        assert_eq!(bob.queued_candidates(), 0);
        assert!(bob.has_remote_description());
        assert_eq!(bob.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_answer_rejected_without_local_offer() {
        let network = LoopbackNetwork::new();
        let (mut bob, _rx) = peer(&network, "bob", "alice", false).await;
        let answer = SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0 o=loopback 7 alice".to_string(),
        };
        assert!(matches!(
            bob.accept_answer(&answer, LIMIT).await,
            Err(MeshError::Negotiation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_detection() {
        let network = LoopbackNetwork::new();
        let (mut alice, _rx) = peer(&network, "alice", "bob", true).await;
        let grace = Duration::from_millis(10);
        alice.create_offer(LIMIT).await.unwrap();
        assert!(!alice.is_stuck(grace));

        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(alice.is_stuck(grace));

        alice.restart_timer();
        assert!(!alice.needs_recycle(grace));

        alice.set_connection_state(ConnectionState::Connected);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!alice.needs_recycle(grace));

        alice.set_connection_state(ConnectionState::Failed);
        assert!(alice.needs_recycle(grace));
    }

    #[tokio::test]
    async fn test_closed_channel_needs_recycle() {
        let network = LoopbackNetwork::new();
        let (mut alice, _rx) = peer(&network, "alice", "bob", true).await;
        let grace = Duration::from_millis(10);
        alice.set_connection_state(ConnectionState::Connected);
        alice.open_channel();
        assert!(!alice.needs_recycle(grace));

        alice.close_channel();
        assert_eq!(alice.connection_state(), ConnectionState::Connected);
        assert!(alice.needs_recycle(grace));
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let network = LoopbackNetwork::new();
        let (mut alice, _rx) = peer(&network, "alice", "bob", true).await;
        assert!(matches!(
            alice.send("early".to_string(), LIMIT).await,
            Err(MeshError::Transport(TransportError::Channel(_)))
        ));
    }
}
