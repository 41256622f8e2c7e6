//! Mesh controller task
//!
//! Owns every peer connection, the public-key cache, the pending queues and
//! the tracked-contact set. All of it is mutated only from this one task, which
//! multiplexes application commands, relay events, transport events and the
//! heartbeat timer.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::peer::PeerConnection;
use super::Command;
use crate::config::{GlarePolicy, MeshConfig};
use crate::crypto::{CryptoService, PublicKeyJwk};
use crate::error::MeshResult;
use crate::models::{
    normalize_identity, ChannelState, ConnectionState, IceCandidate, MeshEvent, MeshSnapshot, PendingMessage,
    SessionDescription, SignalPayload, SignalingState,
};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::transport::{TransportEvent, TransportEventKind, TransportEventSink, TransportFactory};

pub(super) struct MeshController {
    pub(super) user_id: String,
    pub(super) public_key: PublicKeyJwk,
    pub(super) config: MeshConfig,
    pub(super) crypto: Arc<CryptoService>,
    pub(super) signaling: Arc<dyn SignalingClient>,
    pub(super) transport: Arc<dyn TransportFactory>,
    pub(super) peers: HashMap<String, PeerConnection>,
    pub(super) public_keys: HashMap<String, PublicKeyJwk>,
    pub(super) pending: HashMap<String, VecDeque<PendingMessage>>,
    pub(super) tracked: BTreeSet<String>,
    next_connection_id: u64,
    events: mpsc::UnboundedSender<MeshEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MeshController {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        user_id: String,
        public_key: PublicKeyJwk,
        config: MeshConfig,
        crypto: Arc<CryptoService>,
        signaling: Arc<dyn SignalingClient>,
        transport: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<MeshEvent>,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            user_id,
            public_key,
            config,
            crypto,
            signaling,
            transport,
            peers: HashMap::new(),
            public_keys: HashMap::new(),
            pending: HashMap::new(),
            tracked: BTreeSet::new(),
            next_connection_id: 0,
            events,
            transport_tx,
        }
    }

    /// Process inputs until shutdown or until every handle is dropped
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;
        let mut relay_open = true;

        tracing::info!("Mesh controller started for {}", self.user_id);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = signals.recv(), if relay_open => match event {
                    Some(event) => self.handle_signaling_event(event).await,
                    None => {
                        tracing::warn!("Relay event stream closed for {}", self.user_id);
                        relay_open = false;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                _ = heartbeat.tick() => self.check_connections().await,
            }
        }
        tracing::info!("Mesh controller stopped for {}", self.user_id);
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::ConnectTo { target, reply } => {
                self.connect_to(&target).await;
                let _ = reply.send(());
            }
            Command::Send {
                target,
                content,
                is_group,
                members,
                reply,
            } => {
                let result = self.send(&target, content, is_group, members).await;
                self.report_failure(&result);
                let _ = reply.send(result);
            }
            Command::CreateGroup { members, reply } => {
                let result = self.create_group(members).await;
                self.report_failure(&result);
                let _ = reply.send(result);
            }
            Command::SendViaRelay { target, content, reply } => {
                let result = self.send_via_relay(&target, content).await;
                self.report_failure(&result);
                let _ = reply.send(result);
            }
            Command::CheckConnections { reply } => {
                self.check_connections().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Signal { sender, payload } => {
                let sender = normalize_identity(&sender);
                if sender == self.user_id {
                    return;
                }
                tracing::debug!("Signal {} from {}", payload.kind(), sender);
                match payload {
                    SignalPayload::Offer { sdp } => self.on_offer(&sender, sdp).await,
                    SignalPayload::Answer { sdp } => self.on_answer(&sender, sdp).await,
                    SignalPayload::Candidate { candidate } => self.on_candidate(&sender, candidate).await,
                    SignalPayload::GroupInvite { group_id, members } => {
                        self.on_group_invite(&sender, group_id, members).await
                    }
                }
            }
            SignalingEvent::Delivery(delivery) => self.on_relay_delivery(delivery).await,
            SignalingEvent::Reconnected => {
                tracing::info!("Relay connection restored, re-registering {}", self.user_id);
                let registration = tokio::time::timeout(
                    self.config.lookup_timeout(),
                    self.signaling.register(&self.user_id, &self.public_key),
                )
                .await;
                match registration {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Re-registration failed: {}", e),
                    Err(_) => tracing::warn!("Re-registration timed out"),
                }
            }
        }
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// Make sure a connection to `target` exists or is being negotiated
    pub(super) async fn connect_to(&mut self, target: &str) {
        if target == self.user_id {
            return;
        }
        self.tracked.insert(target.to_string());

        if let Some(peer) = self.peers.get(target) {
            let state = peer.connection_state();
            let fresh = peer.age() < self.config.liveness_window();
            let live = state == ConnectionState::Connected && peer.channel_state() != Some(ChannelState::Closed);
            if live || (fresh && !state.is_terminal()) {
                tracing::debug!("Reusing connection to {} ({})", target, state);
                return;
            }
        }

        self.initiate(target).await;
    }

    /// Replace any connection to `target` with a fresh outgoing offer
    async fn initiate(&mut self, target: &str) {
        self.teardown(target).await;
        if !self.open_peer(target, true).await {
            return;
        }

        let limit = self.config.negotiation_timeout();
        let offer = match self.peers.get_mut(target) {
            Some(peer) => peer.create_offer(limit).await,
            None => return,
        };
        match offer {
            Ok(sdp) => {
                tracing::info!("Sending offer to {}", target);
                self.signal(target, SignalPayload::Offer { sdp }).await;
            }
            Err(e) => tracing::warn!("Offer to {} failed: {}", target, e),
        }
    }

    /// Create and register a new connection object for `target`
    async fn open_peer(&mut self, target: &str, initiator: bool) -> bool {
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let sink = TransportEventSink::new(target, connection_id, self.transport_tx.clone());

        match self.transport.create(&self.user_id, target, initiator, sink).await {
            Ok(transport) => {
                self.peers.insert(
                    target.to_string(),
                    PeerConnection::new(target, connection_id, initiator, transport),
                );
                self.emit(MeshEvent::StatusUpdate {
                    target: target.to_string(),
                    status: ConnectionState::Connecting,
                });
                true
            }
            Err(e) => {
                tracing::warn!("Transport for {} unavailable: {}", target, e);
                false
            }
        }
    }

    /// Close and forget the connection to `target`, if any
    pub(super) async fn teardown(&mut self, target: &str) {
        if let Some(mut peer) = self.peers.remove(target) {
            tracing::debug!("Tearing down connection {} to {}", peer.connection_id, target);
            peer.close().await;
        }
    }

    async fn on_offer(&mut self, sender: &str, sdp: SessionDescription) {
        self.tracked.insert(sender.to_string());

        if let Some(peer) = self.peers.get_mut(sender) {
            if peer.signaling_state() == SignalingState::HaveLocalOffer {
                let keep_local = match self.config.glare_policy {
                    GlarePolicy::LocalWins => true,
                    GlarePolicy::IdentityOrder => self.user_id.as_str() > sender,
                };
                if keep_local {
                    tracing::warn!("Signal collision with {}, keeping local offer", sender);
                    peer.restart_timer();
                    return;
                }
                tracing::info!("Signal collision with {}, yielding to remote offer", sender);
            } else if peer.has_remote_description() {
                tracing::info!("Remote restart from {}", sender);
            }
            self.teardown(sender).await;
        }

        if !self.open_peer(sender, false).await {
            return;
        }
        let limit = self.config.negotiation_timeout();
        let answer = match self.peers.get_mut(sender) {
            Some(peer) => peer.accept_offer(&sdp, limit).await,
            None => return,
        };
        match answer {
            Ok(sdp) => {
                tracing::info!("Answering offer from {}", sender);
                self.signal(sender, SignalPayload::Answer { sdp }).await;
            }
            Err(e) => tracing::warn!("Failed to answer {}: {}", sender, e),
        }
    }

    async fn on_answer(&mut self, sender: &str, sdp: SessionDescription) {
        let limit = self.config.negotiation_timeout();
        let Some(peer) = self.peers.get_mut(sender) else {
            tracing::debug!("Answer from {} without a connection", sender);
            return;
        };
        if peer.signaling_state() != SignalingState::HaveLocalOffer {
            tracing::debug!("Ignoring answer from {} in state {}", sender, peer.signaling_state());
            return;
        }
        if let Err(e) = peer.accept_answer(&sdp, limit).await {
            tracing::warn!("Answer from {} rejected: {}", sender, e);
        }
    }

    async fn on_candidate(&mut self, sender: &str, candidate: IceCandidate) {
        let limit = self.config.negotiation_timeout();
        let Some(peer) = self.peers.get_mut(sender) else {
            tracing::debug!("Dropping candidate from {}: no connection", sender);
            return;
        };
        if let Err(e) = peer.add_candidate(candidate, limit).await {
            tracing::warn!("Candidate from {} rejected: {}", sender, e);
        }
    }

    async fn on_group_invite(&mut self, sender: &str, group_id: String, members: Vec<String>) {
        let mut listed: Vec<String> = Vec::with_capacity(members.len());
        for member in members.iter().map(|m| normalize_identity(m)) {
            if !member.is_empty() && !listed.contains(&member) {
                listed.push(member);
            }
        }

        if !listed.iter().any(|m| m == sender) {
            tracing::warn!("Rejecting invite to group {} from non-member {}", group_id, sender);
            self.emit(MeshEvent::Error {
                message: format!("Rejected group invite from non-member {}", sender),
                from: Some(sender.to_string()),
            });
            return;
        }

        tracing::info!("Invited to group {} by {} ({} members)", group_id, sender, listed.len());
        self.emit(MeshEvent::GroupInvite {
            group_id,
            members: listed.clone(),
        });
        for member in listed {
            self.connect_to(&member).await;
        }
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let current = self.peers.get(&event.peer_id).map(|p| p.connection_id);
        if current != Some(event.connection_id) {
            tracing::debug!(
                "Ignoring event from stale connection {} to {}",
                event.connection_id,
                event.peer_id
            );
            return;
        }

        let peer_id = event.peer_id;
        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                self.signal(&peer_id, SignalPayload::Candidate { candidate }).await
            }
            TransportEventKind::ConnectionState(state) => self.on_connection_state(&peer_id, state).await,
            TransportEventKind::ChannelOpen => self.on_channel_open(&peer_id).await,
            TransportEventKind::ChannelMessage(text) => self.on_packet_received(&peer_id, &text).await,
            TransportEventKind::ChannelClosed => self.on_channel_closed(&peer_id).await,
        }
    }

    async fn on_connection_state(&mut self, peer_id: &str, state: ConnectionState) {
        tracing::info!("Connection state with {}: {}", peer_id, state);
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.set_connection_state(state);
        }
        self.emit(MeshEvent::StatusUpdate {
            target: peer_id.to_string(),
            status: state,
        });
        if state.is_terminal() {
            self.teardown(peer_id).await;
        }
    }

    async fn on_channel_open(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.open_channel();
        }
        tracing::info!("Channel open with {}", peer_id);
        self.emit(MeshEvent::StatusUpdate {
            target: peer_id.to_string(),
            status: ConnectionState::Connected,
        });
        self.emit(MeshEvent::ContactConnected {
            id: peer_id.to_string(),
        });
        self.tracked.insert(peer_id.to_string());
        self.flush_pending(peer_id).await;
    }

    /// A connection without its channel is useless; drop it so the next send
    /// or heartbeat negotiates a new one
    async fn on_channel_closed(&mut self, peer_id: &str) {
        tracing::info!("Channel with {} closed, dropping connection", peer_id);
        self.teardown(peer_id).await;
        self.emit(MeshEvent::StatusUpdate {
            target: peer_id.to_string(),
            status: ConnectionState::Closed,
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(super) async fn signal(&self, target: &str, payload: SignalPayload) {
        let kind = payload.kind();
        let sent = tokio::time::timeout(
            self.config.lookup_timeout(),
            self.signaling.send_signal(target, &self.user_id, &payload),
        )
        .await;
        match sent {
            Ok(Ok(())) => tracing::debug!("Sent {} to {}", kind, target),
            Ok(Err(e)) => tracing::warn!("Failed to send {} to {}: {}", kind, target, e),
            Err(_) => tracing::warn!("Timed out sending {} to {}", kind, target),
        }
    }

    pub(super) fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    fn report_failure<T>(&self, result: &MeshResult<T>) {
        if let Err(e) = result {
            self.emit(MeshEvent::Error {
                message: e.to_string(),
                from: None,
            });
        }
    }

    fn snapshot(&self) -> MeshSnapshot {
        let mut peers: Vec<_> = self.peers.values().map(PeerConnection::snapshot).collect();
        peers.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        let mut pending: Vec<_> = self
            .pending
            .iter()
            .map(|(id, queue)| (id.clone(), queue.len()))
            .collect();
        pending.sort();

        MeshSnapshot {
            user_id: self.user_id.clone(),
            peers,
            tracked: self.tracked.iter().cloned().collect(),
            pending,
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down mesh for {} ({} peers)", self.user_id, self.peers.len());
        let targets: Vec<String> = self.peers.keys().cloned().collect();
        for target in targets {
            self.teardown(&target).await;
        }
    }
}
