//! Heartbeat supervisor
//!
//! On every tick each tracked contact either has a healthy connection, gets a
//! first one, or has its stuck/failed connection replaced. Healthy connections
//! with messages still queued get another flush.

use super::controller::MeshController;

enum Action {
    Connect,
    Recycle(String),
    Flush,
}

impl MeshController {
    pub(super) async fn check_connections(&mut self) {
        let grace = self.config.stuck_grace();
        let targets: Vec<String> = self.tracked.iter().cloned().collect();

        for target in targets {
            let queued = self.pending.get(&target).map(|q| !q.is_empty()).unwrap_or(false);
            let action = match self.peers.get(&target) {
                None => Action::Connect,
                Some(peer) if peer.needs_recycle(grace) => Action::Recycle(format!(
                    "state {}, {}, channel {:?}, age {:?}",
                    peer.connection_state(),
                    peer.signaling_state(),
                    peer.channel_state(),
                    peer.age()
                )),
                Some(peer) if queued && peer.is_channel_open() => Action::Flush,
                Some(_) => continue,
            };

            match action {
                Action::Connect => {
                    tracing::info!("Heartbeat: connecting to {}", target);
                    self.connect_to(&target).await;
                }
                Action::Recycle(reason) => {
                    tracing::info!("Heartbeat: reconnecting to {} ({})", target, reason);
                    self.teardown(&target).await;
                    self.connect_to(&target).await;
                }
                Action::Flush => {
                    tracing::info!("Heartbeat: retrying queued messages for {}", target);
                    self.flush_pending(&target).await;
                }
            }
        }
    }
}
