//! Message dispatcher
//!
//! Public send/receive surface: size checks, per-recipient encryption and
//! fan-out, queueing for peers whose channel is not open yet, and decryption
//! of inbound packets.

use chrono::Utc;

use super::controller::MeshController;
use crate::crypto::{sha256_hex, verify_payload_hash, CryptoError, PublicKeyJwk};
use crate::error::{MeshError, MeshResult};
use crate::models::{
    normalize_identity, MeshEvent, MessageKind, PendingMessage, Proof, RelayDelivery, RelayMessage,
    SignalPayload, WirePacket,
};

const DECRYPTION_FAILED: &str = "Decryption Failed";

/// Outcome of one transmission attempt
enum Transmit {
    Sent(Proof),
    /// Dropped for good (no key, encryption failure)
    Skipped,
    /// The channel refused it; still owed to the recipient
    Deferred(PendingMessage),
}

impl MeshController {
    /// Send `content` to one peer, or to every member of a group
    ///
    /// Returns the proof of the first packet actually transmitted. Recipients
    /// without an open channel get the message queued instead.
    pub(super) async fn send(
        &mut self,
        target: &str,
        content: String,
        is_group: bool,
        members: Vec<String>,
    ) -> MeshResult<Option<Proof>> {
        self.check_size(&content)?;

        let mut recipients: Vec<String> = Vec::new();
        let listed = if is_group { members } else { vec![target.to_string()] };
        for member in listed.iter().map(|m| normalize_identity(m)) {
            if !member.is_empty() && member != self.user_id && !recipients.contains(&member) {
                recipients.push(member);
            }
        }
        let group_id = is_group.then(|| target.to_string());

        let mut proof = None;
        for recipient in recipients {
            let message = PendingMessage {
                content: content.clone(),
                is_group,
                group_id: group_id.clone(),
            };
            let sent = self.deliver(&recipient, message).await;
            if proof.is_none() {
                proof = sent;
            }
        }
        Ok(proof)
    }

    fn check_size(&self, content: &str) -> MeshResult<()> {
        let limit = self.config.max_wire_size;
        if content.len() > limit {
            tracing::warn!("Rejecting {} byte message (limit {})", content.len(), limit);
            return Err(CryptoError::PayloadTooLarge {
                size: content.len(),
                limit,
            }
            .into());
        }
        Ok(())
    }

    /// Transmit to one recipient, or queue until its channel opens
    ///
    /// Older queued messages always go first, so a message only skips the
    /// queue when nothing is waiting for that recipient.
    async fn deliver(&mut self, recipient: &str, message: PendingMessage) -> Option<Proof> {
        self.tracked.insert(recipient.to_string());

        let open = self
            .peers
            .get(recipient)
            .map(|p| p.is_channel_open())
            .unwrap_or(false);
        if !open {
            tracing::debug!("Connection to {} not ready, queueing message", recipient);
            self.connect_to(recipient).await;
            self.enqueue(recipient, message);
            return None;
        }

        if self.pending.get(recipient).map(|q| !q.is_empty()).unwrap_or(false) {
            self.enqueue(recipient, message);
            return self.flush_pending(recipient).await;
        }

        match self.transmit(recipient, message).await {
            Transmit::Sent(proof) => Some(proof),
            Transmit::Skipped => None,
            Transmit::Deferred(message) => {
                self.enqueue(recipient, message);
                None
            }
        }
    }

    fn enqueue(&mut self, recipient: &str, message: PendingMessage) {
        self.pending
            .entry(recipient.to_string())
            .or_default()
            .push_back(message);
    }

    /// Encrypt and send over the open channel to `recipient`
    async fn transmit(&mut self, recipient: &str, message: PendingMessage) -> Transmit {
        let key = match self.lookup_key(recipient).await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", recipient, e);
                self.emit(MeshEvent::Error {
                    message: e.to_string(),
                    from: Some(recipient.to_string()),
                });
                return Transmit::Skipped;
            }
        };

        let packet = match self.crypto.encrypt_for(message.content.as_bytes(), &key) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Encryption for {} failed: {}", recipient, e);
                self.emit(MeshEvent::Error {
                    message: e.to_string(),
                    from: Some(recipient.to_string()),
                });
                return Transmit::Skipped;
            }
        };
        let wire = WirePacket {
            encrypted: packet,
            kind: if message.is_group {
                MessageKind::Group
            } else {
                MessageKind::Personal
            },
            group_id: message.group_id.clone(),
        };
        let proof = wire.proof();
        let json = match serde_json::to_string(&wire) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize packet for {}: {}", recipient, e);
                return Transmit::Skipped;
            }
        };

        let limit = self.config.negotiation_timeout();
        let result = match self.peers.get_mut(recipient) {
            Some(peer) => peer.send(json, limit).await,
            None => Err(MeshError::Closed),
        };
        match result {
            Ok(()) => {
                tracing::debug!("Sent {:?} message to {}", wire.kind, recipient);
                Transmit::Sent(proof)
            }
            Err(e) => {
                tracing::warn!("Send to {} failed, keeping message queued: {}", recipient, e);
                Transmit::Deferred(message)
            }
        }
    }

    /// Public key of `user_id`, cached after the first successful lookup
    async fn lookup_key(&mut self, user_id: &str) -> MeshResult<PublicKeyJwk> {
        if let Some(key) = self.public_keys.get(user_id) {
            return Ok(key.clone());
        }

        let reply = tokio::time::timeout(
            self.config.lookup_timeout(),
            self.signaling.request_public_key(user_id),
        )
        .await
        .map_err(|_| MeshError::LookupFailure(format!("timed out looking up '{}'", user_id)))??;

        match reply {
            Some(key) => {
                self.public_keys.insert(user_id.to_string(), key.clone());
                Ok(key)
            }
            None => Err(MeshError::LookupFailure(format!(
                "User '{}' not found or offline",
                user_id
            ))),
        }
    }

    /// Deliver everything queued for `peer_id`, oldest first
    ///
    /// Stops at the first message the channel does not take; it and everything
    /// behind it stay queued in order. Returns the proof of the last message
    /// sent.
    pub(super) async fn flush_pending(&mut self, peer_id: &str) -> Option<Proof> {
        let mut queue = self.pending.remove(peer_id)?;
        if queue.is_empty() {
            return None;
        }

        tracing::info!("Flushing {} pending messages to {}", queue.len(), peer_id);
        let mut last = None;
        while let Some(message) = queue.pop_front() {
            let open = self
                .peers
                .get(peer_id)
                .map(|p| p.is_channel_open())
                .unwrap_or(false);
            let outcome = if open {
                self.transmit(peer_id, message).await
            } else {
                Transmit::Deferred(message)
            };

            match outcome {
                Transmit::Sent(proof) => last = Some(proof),
                Transmit::Skipped => last = None,
                Transmit::Deferred(message) => {
                    queue.push_front(message);
                    tracing::warn!("Flush to {} interrupted, {} messages stay queued", peer_id, queue.len());
                    self.pending.insert(peer_id.to_string(), queue);
                    return None;
                }
            }
        }
        last
    }

    pub(super) async fn on_packet_received(&mut self, from: &str, raw: &str) {
        let packet: WirePacket = match serde_json::from_str(raw) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Malformed packet from {}: {}", from, e);
                self.emit(MeshEvent::Error {
                    message: DECRYPTION_FAILED.to_string(),
                    from: Some(from.to_string()),
                });
                return;
            }
        };

        let decrypted = self
            .crypto
            .decrypt_as(&self.user_id, &packet.encrypted)
            .await
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| CryptoError::MalformedPacket("content is not UTF-8".to_string()))
            });

        match decrypted {
            Ok(text) => {
                tracing::debug!("Message from {} ({:?})", from, packet.kind);
                self.emit(MeshEvent::MessageReceived {
                    from: from.to_string(),
                    text,
                    kind: packet.kind,
                    proof: packet.proof(),
                    group_id: packet.group_id,
                    received_at: Utc::now(),
                });
            }
            Err(e) => {
                tracing::warn!("Decryption of packet from {} failed: {}", from, e);
                self.emit(MeshEvent::Error {
                    message: DECRYPTION_FAILED.to_string(),
                    from: Some(from.to_string()),
                });
            }
        }
    }

    /// Send through the relay itself (legacy mode); returns the payload hash
    pub(super) async fn send_via_relay(&mut self, target: &str, content: String) -> MeshResult<String> {
        self.check_size(&content)?;

        let key = self.lookup_key(target).await?;
        let payload = self.crypto.encrypt_for(content.as_bytes(), &key)?;
        let payload_hash = sha256_hex(&payload.ciphertext_bytes()?);

        let message = RelayMessage {
            from: self.user_id.clone(),
            to: target.to_string(),
            payload,
            payload_hash: payload_hash.clone(),
        };
        tokio::time::timeout(self.config.lookup_timeout(), self.signaling.relay_message(&message))
            .await
            .map_err(|_| MeshError::Signaling(format!("timed out relaying message to {}", target)))??;

        tracing::info!("Relayed message to {} ({})", target, payload_hash);
        Ok(payload_hash)
    }

    /// Hash-check a relay-routed message, then decrypt it
    pub(super) async fn on_relay_delivery(&mut self, delivery: RelayDelivery) {
        let from = normalize_identity(&delivery.from);

        let claimed = [delivery.payload_hash.as_str(), delivery.server_hash.as_str()];
        match verify_payload_hash(&delivery.payload, &claimed) {
            Ok(()) => {}
            Err(CryptoError::Tampered { computed, .. }) => {
                tracing::warn!("Tampered message from {}: hash mismatch", from);
                self.emit(MeshEvent::Tampered {
                    from,
                    payload_hash: delivery.payload_hash,
                    server_hash: delivery.server_hash,
                    computed,
                });
                return;
            }
            Err(e) => {
                tracing::warn!("Unreadable relay message from {}: {}", from, e);
                self.emit(MeshEvent::Error {
                    message: e.to_string(),
                    from: Some(from),
                });
                return;
            }
        }

        let decrypted = self
            .crypto
            .decrypt_as(&self.user_id, &delivery.payload)
            .await
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| CryptoError::MalformedPacket("content is not UTF-8".to_string()))
            });
        match decrypted {
            Ok(text) => self.emit(MeshEvent::MessageReceived {
                from,
                text,
                kind: MessageKind::Personal,
                group_id: None,
                proof: Proof {
                    ciphertext: delivery.payload.ciphertext,
                    iv: delivery.payload.iv,
                },
                received_at: Utc::now(),
            }),
            Err(e) => {
                tracing::warn!("Decryption of relayed message from {} failed: {}", from, e);
                self.emit(MeshEvent::Error {
                    message: e.to_string(),
                    from: Some(from),
                });
            }
        }
    }

    /// Start a group: invite every member and connect to each
    pub(super) async fn create_group(&mut self, members: Vec<String>) -> MeshResult<String> {
        let mut listed = vec![self.user_id.clone()];
        for member in members.iter().map(|m| normalize_identity(m)) {
            if !member.is_empty() && !listed.contains(&member) {
                listed.push(member);
            }
        }
        if listed.len() < 2 {
            return Err(MeshError::Config("a group needs at least one other member".to_string()));
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Creating group {} with {} members", group_id, listed.len());

        let others: Vec<String> = listed.iter().filter(|m| **m != self.user_id).cloned().collect();
        for member in &others {
            self.signal(
                member,
                SignalPayload::GroupInvite {
                    group_id: group_id.clone(),
                    members: listed.clone(),
                },
            )
            .await;
        }
        for member in &others {
            self.connect_to(member).await;
        }
        Ok(group_id)
    }
}
