use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, time};

use crate::{
    p2p::{state::ConnState, state::SessionState, PeerCommand, PeerHandle},
    stats::PeerStats,
    torrent::TorrentContext,
};

pub type SwarmTx = mpsc::UnboundedSender<SwarmCommand>;
type SwarmRx = mpsc::UnboundedReceiver<SwarmCommand>;

// How many outbound dials are attempted at once, and how long that batch is
// given to settle before topping back up (SPEC_FULL.md 4.3).
const DIAL_BATCH_SIZE: usize = 10;
const DIAL_BATCH_SETTLE: Duration = Duration::from_secs(8);

// Everything a peer session needs to tell the torrent that owns it.
pub enum SwarmCommand {
    PeerState { address: SocketAddr, state: SessionState },
    PieceCompleted(usize),
    Inbound(TcpStream, SocketAddr),
}

// Owns every peer session for a single torrent: dials outbound addresses in
// bounded batches, accepts inbound sockets handed down from the engine's
// shared listener once their info-hash has been matched, and relays
// `Have`/state updates between sessions.
pub struct Swarm {
    ctx: Arc<TorrentContext>,
    swarm_rx: SwarmRx,
    peers: HashMap<SocketAddr, PeerHandle>,
    min_max_peers: (u32, u32),
}

impl Swarm {
    // Creates the swarm's command channel ahead of `TorrentContext` existing,
    // since every peer session (spawned with a clone of that context) needs
    // the sending half to report back to this swarm.
    pub fn channel() -> (SwarmTx, SwarmRx) {
        mpsc::unbounded_channel()
    }

    pub fn new(ctx: Arc<TorrentContext>, min_max_peers: (u32, u32), swarm_rx: SwarmRx) -> Self {
        Self { ctx, swarm_rx, peers: HashMap::new(), min_max_peers }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_states(&self) -> Vec<(SocketAddr, SessionState)> {
        self.peers.iter().map(|(addr, handle)| (*addr, handle.state)).collect()
    }

    // Dials outbound candidates in batches of `DIAL_BATCH_SIZE`, each given
    // `DIAL_BATCH_SETTLE` to connect (each session also self-enforces its own
    // per-connect timeout), stopping once `max` sessions are held or the
    // candidate list is exhausted.
    pub async fn dial(&mut self, available: &mut Vec<SocketAddr>) {
        let max = self.min_max_peers.1 as usize;
        while self.peers.len() < max && !available.is_empty() {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            let take = available.len().min(DIAL_BATCH_SIZE).min(max - self.peers.len());
            for addr in available.drain(..take) {
                if self.peers.contains_key(&addr) {
                    continue;
                }
                let handle = PeerHandle::start_session(addr, self.ctx.clone(), None);
                self.peers.insert(addr, handle);
            }
            time::sleep(DIAL_BATCH_SETTLE).await;
            self.reap_dead();
            self.publish_snapshot();
            if self.peers.len() as u32 >= self.min_max_peers.0 {
                break;
            }
        }
    }

    // Drops handles whose session task has already finished - failed
    // connect, handshake rejection, or a clean disconnect.
    fn reap_dead(&mut self) {
        self.peers.retain(|_, handle| !handle.session_handle.is_finished());
    }

    pub async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.swarm_rx.try_recv() {
            self.handle_command(cmd).await;
        }
    }

    pub async fn recv(&mut self) -> Option<SwarmCommand> {
        self.swarm_rx.recv().await
    }

    pub async fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::PeerState { address, state } => {
                if state.conn_state == ConnState::Disconnected {
                    self.peers.remove(&address);
                } else if let Some(handle) = self.peers.get_mut(&address) {
                    handle.state = state;
                }
            }
            SwarmCommand::PieceCompleted(idx) => {
                for handle in self.peers.values() {
                    handle.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
                }
            }
            SwarmCommand::Inbound(stream, addr) => {
                if self.peers.len() < self.min_max_peers.1 as usize && !self.peers.contains_key(&addr) {
                    let handle = PeerHandle::start_session(addr, self.ctx.clone(), Some(stream));
                    self.peers.insert(addr, handle);
                }
            }
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = self.peers.iter()
            .map(|(addr, handle)| PeerStats { address: *addr, state: handle.state })
            .collect();
        *self.ctx.peer_snapshot.lock().unwrap() = snapshot;
    }

    pub async fn shutdown(&mut self) {
        for (_, handle) in self.peers.drain() {
            handle.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        self.publish_snapshot();
    }
}
