use std::{path::PathBuf, time::Duration};

use rand::Rng;

// First byte of the peer id convention is a dash, followed by a two letter
// client tag and a four digit version, then another dash: `-XX0001-`
// followed by twelve random printable characters.
const CLIENT_TAG: &[u8; 8] = b"-RS0001-";
const PRINTABLE: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

// Generates a fresh 20-byte peer id. Called once per `Engine`; every
// torrent and every tracker announce made by that engine reuses the same
// id, per SPEC_FULL.md 4.1.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_TAG);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = PRINTABLE[rng.gen_range(0..PRINTABLE.len())];
    }
    id
}

// Per-torrent knobs; read once when a torrent is added, then carried
// unchanged for its lifetime.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    // Root directory under which this torrent's files/directory are created.
    pub save_root: PathBuf,

    // Min/max number of peer sessions the swarm tries to maintain.
    pub min_max_peers: (u32, u32),

    // Interval between re-announces while steady-state downloading.
    pub reannounce_interval: Duration,

    // Trackers carried over from a magnet URI this descriptor's info-hash
    // was previously registered under (SPEC_FULL.md §9, BEP-9 resolution).
    // Folded into the tracker set alongside whatever the descriptor itself
    // lists, ahead of the engine's built-in fallback list.
    pub extra_trackers: Vec<String>,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            save_root: PathBuf::from("downloads"),
            min_max_peers: (5, 100),
            reannounce_interval: Duration::from_secs(120),
            extra_trackers: Vec::new(),
        }
    }
}

// Engine-wide configuration, shared by every torrent the engine manages.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // This engine's 20-byte peer id, sent in every handshake and announce.
    pub peer_id: [u8; 20],

    // Inbound TCP port range to probe, e.g. 6881..=6999.
    pub listen_port_range: std::ops::RangeInclusive<u16>,

    // A torrent whose descriptor carries fewer trackers than this gets the
    // built-in fallback list appended (SPEC_FULL.md 9, open question).
    pub tracker_fallback_threshold: usize,

    // Built-in public tracker fallback list.
    pub fallback_trackers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            listen_port_range: 6881..=6999,
            tracker_fallback_threshold: 5,
            fallback_trackers: vec![
                "udp://tracker.opentrackr.org:1337/announce".to_string(),
                "udp://open.tracker.cl:1337/announce".to_string(),
                "udp://tracker.openbittorrent.com:6969/announce".to_string(),
                "udp://exodus.desync.com:6969/announce".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_the_expected_tag_and_length() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_TAG);
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn peer_id_is_randomised_per_call() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
