#![allow(dead_code)]

mod block;
mod config;
mod de;
mod engine;
mod fs;
mod magnet;
mod metainfo;
mod p2p;
mod scheduler;
mod stats;
mod store;
mod swarm;
mod torrent;
mod tracker;

const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use config::{EngineConfig, TorrentConfig};
pub use engine::{Engine, EngineError, EngineEvent, TorrentHandle};
pub use magnet::{MagnetError, MagnetLink};
pub use metainfo::MetaInfo;
pub use torrent::TorrentState;
