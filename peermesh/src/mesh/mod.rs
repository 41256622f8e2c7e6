//! Peer mesh
//!
//! `spawn_mesh` starts one controller task per local identity and returns a
//! cloneable [`MeshHandle`] for commands plus the stream of [`MeshEvent`]s for
//! the UI layer.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let relay = LoopbackRelay::new();
//! let network = LoopbackNetwork::new();
//! let (signaling, signal_events) = relay.connect().await;
//!
//! let (alice, mut events) = spawn_mesh("alice", MeshRuntime {
//!     config: MeshConfig::default(),
//!     signaling: Arc::new(signaling),
//!     signal_events,
//!     transport: Arc::new(network.clone()),
//!     key_store: Arc::new(MemoryKeyStore::new()),
//! }).await?;
//!
//! alice.send_message("bob", "hello").await?;
//! ```

mod controller;
mod dispatcher;
mod heartbeat;
mod peer;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::MeshConfig;
use crate::crypto::{CryptoService, KeyStore};
use crate::error::{MeshError, MeshResult};
use crate::models::{normalize_identity, MeshEvent, MeshSnapshot, Proof};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::transport::TransportFactory;

use controller::MeshController;

pub use peer::PeerConnection;

const COMMAND_BUFFER: usize = 64;

/// Requests from a [`MeshHandle`] to the controller task
pub(crate) enum Command {
    ConnectTo {
        target: String,
        reply: oneshot::Sender<()>,
    },
    Send {
        target: String,
        content: String,
        is_group: bool,
        members: Vec<String>,
        reply: oneshot::Sender<MeshResult<Option<Proof>>>,
    },
    CreateGroup {
        members: Vec<String>,
        reply: oneshot::Sender<MeshResult<String>>,
    },
    SendViaRelay {
        target: String,
        content: String,
        reply: oneshot::Sender<MeshResult<String>>,
    },
    CheckConnections {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<MeshSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Collaborators a mesh node runs on
pub struct MeshRuntime {
    pub config: MeshConfig,
    pub signaling: Arc<dyn SignalingClient>,
    /// Inbound side of `signaling`
    pub signal_events: mpsc::UnboundedReceiver<SignalingEvent>,
    pub transport: Arc<dyn TransportFactory>,
    pub key_store: Arc<dyn KeyStore>,
}

/// Start the mesh for `user_id`
///
/// Ensures the identity's key pair exists, registers it with the relay and
/// spawns the controller task.
pub async fn spawn_mesh(
    user_id: &str,
    runtime: MeshRuntime,
) -> MeshResult<(MeshHandle, mpsc::UnboundedReceiver<MeshEvent>)> {
    runtime.config.validate()?;
    let user_id = normalize_identity(user_id);
    if user_id.is_empty() {
        return Err(MeshError::Config("user id must not be empty".to_string()));
    }

    let crypto = Arc::new(CryptoService::new(runtime.key_store));
    let public_key = crypto.ensure_keypair(&user_id).await?;

    tokio::time::timeout(
        runtime.config.lookup_timeout(),
        runtime.signaling.register(&user_id, &public_key),
    )
    .await
    .map_err(|_| MeshError::Signaling("timed out registering with relay".to_string()))??;
    tracing::info!("Registered {} with relay", user_id);

    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let controller = MeshController::new(
        user_id.clone(),
        public_key,
        runtime.config,
        crypto.clone(),
        runtime.signaling,
        runtime.transport,
        event_tx,
        transport_tx,
    );
    tokio::spawn(controller.run(command_rx, runtime.signal_events, transport_rx));

    Ok((
        MeshHandle {
            user_id,
            commands: command_tx,
            crypto,
        },
        event_rx,
    ))
}

/// Cloneable handle to a running mesh controller
#[derive(Clone)]
pub struct MeshHandle {
    user_id: String,
    commands: mpsc::Sender<Command>,
    crypto: Arc<CryptoService>,
}

impl MeshHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| MeshError::Closed)?;
        rx.await.map_err(|_| MeshError::Closed)
    }

    /// Track `target` and start negotiating with it
    pub async fn connect_to(&self, target: &str) -> MeshResult<()> {
        let target = normalize_identity(target);
        self.request(|reply| Command::ConnectTo { target, reply }).await
    }

    /// Send a personal message; returns the proof if it went out immediately
    pub async fn send_message(&self, target: &str, content: &str) -> MeshResult<Option<Proof>> {
        let target = normalize_identity(target);
        let content = content.to_string();
        self.request(|reply| Command::Send {
            target,
            content,
            is_group: false,
            members: Vec::new(),
            reply,
        })
        .await?
    }

    /// Fan a message out to every member of a group
    pub async fn send_group_message(
        &self,
        group_id: &str,
        members: &[String],
        content: &str,
    ) -> MeshResult<Option<Proof>> {
        let members = members.iter().map(|m| normalize_identity(m)).collect();
        let target = group_id.to_string();
        let content = content.to_string();
        self.request(|reply| Command::Send {
            target,
            content,
            is_group: true,
            members,
            reply,
        })
        .await?
    }

    /// Create a group, invite its members and return the new group id
    pub async fn create_group(&self, members: &[String]) -> MeshResult<String> {
        let members = members.to_vec();
        self.request(|reply| Command::CreateGroup { members, reply }).await?
    }

    /// Send through the relay instead of a peer channel; returns the payload hash
    pub async fn send_via_relay(&self, target: &str, content: &str) -> MeshResult<String> {
        let target = normalize_identity(target);
        let content = content.to_string();
        self.request(|reply| Command::SendViaRelay { target, content, reply })
            .await?
    }

    /// Run a heartbeat pass now
    pub async fn check_connections(&self) -> MeshResult<()> {
        self.request(|reply| Command::CheckConnections { reply }).await
    }

    pub async fn snapshot(&self) -> MeshResult<MeshSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Fingerprint of this identity's public key
    pub async fn fingerprint(&self) -> MeshResult<String> {
        self.crypto
            .fingerprint(&self.user_id)
            .await
            .ok_or_else(|| crate::crypto::CryptoError::KeyNotFound(self.user_id.clone()).into())
    }

    /// Stop the heartbeat and close every connection
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
