//! PeerMesh - Core library
//!
//! Direct peer channels negotiated through a signaling relay that never sees
//! plaintext. Every message is encrypted with a fresh symmetric key wrapped
//! for the recipient's long-term public key.
//!
//! The relay, the transport primitive and key persistence are injected
//! capabilities ([`signaling::SignalingClient`], [`transport::TransportFactory`],
//! [`crypto::KeyStore`]); in-process implementations of each are included.

pub mod config;
pub mod crypto;
pub mod error;
pub mod mesh;
pub mod models;
pub mod signaling;
pub mod transport;

pub use config::{GlarePolicy, MeshConfig};
pub use error::{MeshError, MeshResult};
pub use mesh::{spawn_mesh, MeshHandle, MeshRuntime};
pub use models::{MeshEvent, MeshSnapshot, Proof};

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `peermesh=info`)
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peermesh=info".into()),
        )
        .try_init();
}
