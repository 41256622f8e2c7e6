//! PeerMesh demo
//!
//! Brings up two identities, connects them and exchanges one message. By
//! default everything runs in-process; with `--relay` both identities talk to
//! a real signaling relay instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use peermesh::crypto::{KeyStore, MemoryKeyStore, SqliteKeyStore};
use peermesh::signaling::{LoopbackRelay, SignalingClient, SignalingEvent, WsSignalingClient};
use peermesh::transport::LoopbackNetwork;
use peermesh::{spawn_mesh, MeshConfig, MeshEvent, MeshRuntime};

#[derive(Parser)]
#[command(name = "peermesh-demo")]
#[command(about = "Exchange an end-to-end encrypted message between two mesh nodes")]
struct Cli {
    /// JSON config file (defaults apply to missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the WebSocket relay from the config instead of the in-process one
    #[arg(long)]
    relay: bool,

    /// Override the relay URL
    #[arg(long)]
    relay_url: Option<String>,

    /// SQLite key store URL (e.g. sqlite:keys.db?mode=rwc); in-memory if absent
    #[arg(long)]
    key_db: Option<String>,

    /// Sender identity
    #[arg(long, default_value = "alice")]
    from: String,

    /// Recipient identity
    #[arg(long, default_value = "bob")]
    to: String,

    /// Message to send
    #[arg(short, long, default_value = "hello over the mesh")]
    message: String,

    /// Seconds to wait for delivery
    #[arg(long, default_value_t = 15)]
    wait: u64,
}

type Signaling = (Arc<dyn SignalingClient>, mpsc::UnboundedReceiver<SignalingEvent>);

async fn open_signaling(cli: &Cli, config: &MeshConfig, relay: &LoopbackRelay) -> Result<Signaling> {
    if cli.relay {
        let (client, events) = WsSignalingClient::connect(&config.relay_url, config.lookup_timeout())
            .await
            .with_context(|| format!("connecting to relay {}", config.relay_url))?;
        Ok((Arc::new(client), events))
    } else {
        let (client, events) = relay.connect().await;
        Ok((Arc::new(client), events))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    peermesh::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MeshConfig::from_file(path).context("loading config")?,
        None => MeshConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(url) = &cli.relay_url {
        config.relay_url = url.clone();
    }
    config.validate()?;

    let key_store: Arc<dyn KeyStore> = match &cli.key_db {
        Some(url) => Arc::new(SqliteKeyStore::connect(url).await.context("opening key store")?),
        None => Arc::new(MemoryKeyStore::new()),
    };

    let relay = LoopbackRelay::new();
    let network = LoopbackNetwork::new();

    let mut nodes = Vec::new();
    for id in [&cli.from, &cli.to] {
        let (signaling, signal_events) = open_signaling(&cli, &config, &relay).await?;
        let node = spawn_mesh(
            id,
            MeshRuntime {
                config: config.clone(),
                signaling,
                signal_events,
                transport: Arc::new(network.clone()),
                key_store: key_store.clone(),
            },
        )
        .await
        .with_context(|| format!("starting node {}", id))?;
        tracing::info!("{} fingerprint: {}", id, node.0.fingerprint().await?);
        nodes.push(node);
    }

    let (receiver, mut receiver_events) = nodes.pop().context("receiver node missing")?;
    let (sender, _sender_events) = nodes.pop().context("sender node missing")?;

    sender.send_message(receiver.user_id(), &cli.message).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(cli.wait));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = receiver_events.recv() => match event {
                Some(MeshEvent::MessageReceived { from, text, proof, .. }) => {
                    println!("{} -> {}: {}", from, receiver.user_id(), text);
                    println!("ciphertext: {}", proof.ciphertext);
                    break;
                }
                Some(MeshEvent::Error { message, .. }) => bail!("receiver reported: {}", message),
                Some(other) => tracing::debug!("event: {:?}", other),
                None => bail!("receiver stopped"),
            },
            _ = &mut deadline => bail!("no message within {}s", cli.wait),
        }
    }

    sender.shutdown().await?;
    receiver.shutdown().await?;
    Ok(())
}
