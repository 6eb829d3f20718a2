use std::{collections::HashMap, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
    time,
};

use crate::{
    config::EngineConfig,
    config::TorrentConfig,
    magnet::{MagnetError, MagnetLink},
    metainfo::{MetaInfo, MetaInfoError},
    stats::PeerStats,
    swarm::SwarmCommand,
    torrent::{Torrent, TorrentContext, TorrentControl, TorrentError, TorrentState},
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed metadata: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("malformed magnet uri: {0}")]
    Magnet(#[from] MagnetError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torrent {0} is already active")]
    AlreadyActive(String),

    #[error("torrent {0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentHandle(pub [u8; 20]);

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Added(TorrentHandle),
    Removed(TorrentHandle),
    Updated(TorrentHandle, TorrentState),
}

// A snapshot of one managed torrent, as returned by `Engine::list`.
#[derive(Debug, Clone)]
pub struct TorrentView {
    pub handle: TorrentHandle,
    pub state: TorrentState,
    pub pieces_verified: usize,
    pub pieces_total: usize,
    pub peers: Vec<PeerStats>,
}

enum ActiveTorrent {
    // A magnet-only entry with nothing to download yet: the descriptor's
    // pieces/files are unknown until `add_from_file_bytes`/
    // `add_from_descriptor` supplies them for the same info-hash
    // (SPEC_FULL.md 3, §9 BEP-9 resolution).
    Pending { trackers: Vec<String> },
    Running {
        ctx: Arc<TorrentContext>,
        control_tx: mpsc::UnboundedSender<TorrentControl>,
        swarm_tx: crate::swarm::SwarmTx,
        save_root: std::path::PathBuf,
        run_handle: tokio::task::JoinHandle<()>,
    },
}

// Registry and lifecycle owner for every torrent this process manages, plus
// the single shared inbound TCP listener every torrent's swarm feeds off of
// (SPEC_FULL.md 4.1).
pub struct Engine {
    config: EngineConfig,
    listen_port: u16,
    torrents: Arc<Mutex<HashMap<[u8; 20], ActiveTorrent>>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    pub async fn new(config: EngineConfig) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let torrents: Arc<Mutex<HashMap<[u8; 20], ActiveTorrent>>> = Arc::new(Mutex::new(HashMap::new()));

        let listener = bind_in_range(config.listen_port_range.clone()).await;
        let listen_port = listener.as_ref().map(|(_, port)| *port).unwrap_or(0);

        if let Some((listener, _)) = listener {
            let torrents = torrents.clone();
            tokio::spawn(accept_loop(listener, torrents));
        } else {
            tracing::warn!("no free inbound port in range, operating with inbound disabled");
        }

        Ok((
            Self { config, listen_port, torrents, events_tx },
            events_rx,
        ))
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.config.peer_id
    }

    pub async fn add_from_file_bytes(&self, bytes: &[u8], torrent_config: TorrentConfig) -> Result<TorrentHandle> {
        let metainfo = MetaInfo::from_bytes(bytes)?;
        self.add_metainfo(metainfo, torrent_config).await
    }

    pub async fn add_from_descriptor(&self, metainfo: MetaInfo, torrent_config: TorrentConfig) -> Result<TorrentHandle> {
        self.add_metainfo(metainfo, torrent_config).await
    }

    pub fn parse_magnet(&self, uri: &str) -> Result<MagnetLink> {
        Ok(MagnetLink::parse(uri)?)
    }

    // Registers a magnet-only placeholder: no pieces/files are known yet, so
    // no `Torrent` actually runs. The entry upgrades in place into a running
    // torrent the moment `add_from_file_bytes`/`add_from_descriptor` is
    // called with a descriptor whose info-hash matches (SPEC_FULL.md §9).
    pub async fn add_from_magnet(&self, uri: &str, _torrent_config: TorrentConfig) -> Result<TorrentHandle> {
        let link = self.parse_magnet(uri)?;
        let handle = TorrentHandle(link.info_hash);
        let mut torrents = self.torrents.lock().await;
        torrents.entry(link.info_hash).or_insert(ActiveTorrent::Pending { trackers: link.trackers });
        self.events_tx.send(EngineEvent::Added(handle)).ok();
        Ok(handle)
    }

    async fn add_metainfo(&self, metainfo: MetaInfo, mut torrent_config: TorrentConfig) -> Result<TorrentHandle> {
        let info_hash = metainfo.info_hash();
        let mut torrents = self.torrents.lock().await;
        match torrents.get(&info_hash) {
            Some(ActiveTorrent::Running { .. }) => {
                return Err(EngineError::AlreadyActive(hex::encode(info_hash)));
            }
            Some(ActiveTorrent::Pending { trackers }) => {
                // Fold the magnet's trackers in alongside whatever the
                // descriptor itself carries, then fall through to start it.
                torrent_config.extra_trackers = trackers.clone();
            }
            None => {}
        }

        let save_root = torrent_config.save_root.clone();
        let (torrent, control_tx, swarm_tx, ctx, info_hash) = Torrent::new(
            &metainfo,
            torrent_config,
            self.config.peer_id,
            self.listen_port,
            &self.config.fallback_trackers,
            self.config.tracker_fallback_threshold,
        )?;

        let events_tx = self.events_tx.clone();
        let handle = TorrentHandle(info_hash);
        let torrents_registry = self.torrents.clone();
        let run_handle = tokio::spawn(async move {
            if let Err(e) = torrent.run().await {
                tracing::error!("torrent {} stopped: {}", hex::encode(info_hash), e);
                events_tx.send(EngineEvent::Updated(handle, TorrentState::Error)).ok();
            }
            torrents_registry.lock().await.remove(&info_hash);
        });

        torrents.insert(info_hash, ActiveTorrent::Running { ctx, control_tx, swarm_tx, save_root, run_handle });
        self.events_tx.send(EngineEvent::Added(handle)).ok();
        Ok(handle)
    }

    pub async fn pause(&self, handle: TorrentHandle) -> Result<()> {
        self.send_control(handle, TorrentControl::Pause).await
    }

    pub async fn resume(&self, handle: TorrentHandle) -> Result<()> {
        self.send_control(handle, TorrentControl::Resume).await
    }

    pub async fn stop(&self, handle: TorrentHandle) -> Result<()> {
        self.send_control(handle, TorrentControl::Shutdown).await
    }

    async fn send_control(&self, handle: TorrentHandle, cmd: TorrentControl) -> Result<()> {
        let torrents = self.torrents.lock().await;
        match torrents.get(&handle.0) {
            Some(ActiveTorrent::Running { control_tx, .. }) => {
                control_tx.send(cmd).ok();
                Ok(())
            }
            // A pending (magnet-only) entry has nothing running to control.
            Some(ActiveTorrent::Pending { .. }) => Ok(()),
            None => Err(EngineError::NotFound(hex::encode(handle.0))),
        }
    }

    pub async fn remove(&self, handle: TorrentHandle, delete_data: bool) -> Result<()> {
        let entry = {
            let mut torrents = self.torrents.lock().await;
            torrents.remove(&handle.0)
        };
        let Some(entry) = entry else {
            return Err(EngineError::NotFound(hex::encode(handle.0)));
        };

        if let ActiveTorrent::Running { control_tx, run_handle, save_root, .. } = entry {
            control_tx.send(TorrentControl::Shutdown).ok();
            run_handle.abort();

            if delete_data {
                if let Err(e) = std::fs::remove_dir_all(&save_root) {
                    tracing::warn!("failed to delete save directory {:?}: {}", save_root, e);
                }
            }
        }

        self.events_tx.send(EngineEvent::Removed(handle)).ok();
        Ok(())
    }

    pub async fn list(&self) -> Vec<TorrentView> {
        let torrents = self.torrents.lock().await;
        let mut views = Vec::with_capacity(torrents.len());
        for (hash, entry) in torrents.iter() {
            let handle = TorrentHandle(*hash);
            views.push(match entry {
                ActiveTorrent::Pending { .. } => TorrentView {
                    handle,
                    state: TorrentState::Stopped,
                    pieces_verified: 0,
                    pieces_total: 0,
                    peers: Vec::new(),
                },
                ActiveTorrent::Running { ctx, .. } => {
                    let (verified, total, _) = ctx.scheduler.progress().await;
                    TorrentView {
                        handle,
                        state: *ctx.shared_state.lock().unwrap(),
                        pieces_verified: verified,
                        pieces_total: total,
                        peers: ctx.peer_snapshot.lock().unwrap().clone(),
                    }
                }
            });
        }
        views
    }
}

async fn bind_in_range(range: std::ops::RangeInclusive<u16>) -> Option<(TcpListener, u16)> {
    for port in range {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                tracing::info!("listening for inbound peers on port {}", port);
                return Some((listener, port));
            }
            Err(e) => tracing::trace!("port {} unavailable: {}", port, e),
        }
    }
    None
}

// Accepts inbound peer connections, peeks the handshake to learn the
// requested info-hash without consuming it from the stream, and routes the
// still-untouched socket to the matching torrent's swarm. Connections for an
// unknown info-hash are dropped.
async fn accept_loop(listener: TcpListener, torrents: Arc<Mutex<HashMap<[u8; 20], ActiveTorrent>>>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("accept error: {}", e);
                continue;
            }
        };

        let torrents = torrents.clone();
        tokio::spawn(async move {
            let info_hash = match time::timeout(std::time::Duration::from_secs(10), peek_info_hash(&stream)).await {
                Ok(Ok(hash)) => hash,
                _ => return,
            };

            let swarm_tx = {
                let torrents = torrents.lock().await;
                match torrents.get(&info_hash) {
                    Some(ActiveTorrent::Running { swarm_tx, .. }) => Some(swarm_tx.clone()),
                    _ => None,
                }
            };

            match swarm_tx {
                Some(tx) => {
                    tx.send(SwarmCommand::Inbound(stream, addr)).ok();
                }
                None => tracing::debug!("inbound connection for unknown info-hash from {}", addr),
            }
        });
    }
}

async fn peek_info_hash(stream: &TcpStream) -> std::io::Result<[u8; 20]> {
    let mut buf = [0u8; 68];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n >= 68 {
            break;
        }
        time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[28..48]);
    Ok(info_hash)
}
