use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use crate::{block::BlockInfo, Bitfield};

pub mod pieces;
pub mod partial_piece;

use pieces::PiecePicker;
use partial_piece::PartialPiece;

// A block left `Requested` longer than this is assumed lost and freed for
// another peer to pick up (SPEC_FULL.md 4.4).
const BLOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Crossing this many consecutive hash failures triggers an emergency
// re-announce (SPEC_FULL.md 4.4 failure accounting).
const FAILURE_EMERGENCY_THRESHOLD: u32 = 10;

// Crossing this many is treated as systemic: the torrent gives up.
const FAILURE_HARD_CEILING: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEscalation {
    Normal,
    EmergencyReannounce,
    Fatal,
}

// Owns piece/block bookkeeping for a single torrent: which pieces exist,
// which are done, which are in flight, and what's been assembled for each
// in-progress piece so far. Hash verification lives here rather than in the
// disk layer, since a failed hash has to feed straight back into "this
// piece's blocks are free again" - the scheduler's own state.
#[derive(Debug)]
pub struct PieceScheduler {
    pub piece_picker: RwLock<PiecePicker>,
    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,
    piece_hashes: Vec<[u8; 20]>,
    num_pieces: u32,
    piece_len: usize,
    last_piece_len: usize,
    consecutive_failures: AtomicU32,
}

pub enum VerifyOutcome {
    Valid { idx: usize, data: Vec<u8> },
    Invalid { idx: usize },
}

impl PieceScheduler {
    pub fn new(piece_hashes: Vec<[u8; 20]>, piece_len: usize, last_piece_len: usize) -> Self {
        let num_pieces = piece_hashes.len() as u32;
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            piece_hashes,
            num_pieces,
            piece_len,
            last_piece_len,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    // Where the torrent's failure counter currently sits against the two
    // named thresholds; polled periodically by the download loop rather than
    // pushed, since crossing a threshold isn't itself an event worth a
    // channel message.
    pub fn failure_escalation(&self) -> FailureEscalation {
        match self.consecutive_failures.load(Ordering::SeqCst) {
            n if n >= FAILURE_HARD_CEILING => FailureEscalation::Fatal,
            n if n >= FAILURE_EMERGENCY_THRESHOLD => FailureEscalation::EmergencyReannounce,
            _ => FailureEscalation::Normal,
        }
    }

    fn piece_len_for(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub async fn is_complete(&self) -> bool {
        self.piece_picker.read().await.all()
    }

    // (pieces verified, total pieces, is_complete) for progress reporting.
    pub async fn progress(&self) -> (usize, usize, bool) {
        let picker = self.piece_picker.read().await;
        (picker.own_bitfield().count_ones(), self.num_pieces as usize, picker.all())
    }

    // Requests up to `target_queue_len` outstanding blocks from `bf`'s
    // owner, drawing first from already-started pieces and only then
    // starting new ones.
    pub async fn pick_blocks(
        &self,
        current_requests: &HashSet<BlockInfo>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockInfo> {
        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return requests;
        }

        for partial_piece in self.partial_pieces.write().await.values_mut() {
            // Reclaim anything abandoned by a peer that never answered,
            // regardless of which torrent-wide caller happens to trigger it.
            partial_piece.write().await.free_timed_out(BLOCK_REQUEST_TIMEOUT);

            if remaining == 0 {
                break;
            }
            if !bf[partial_piece.read().await.idx] {
                continue;
            }
            remaining -= partial_piece
                .write()
                .await
                .pick_next_blocks(remaining, &mut requests, current_requests);
        }

        while remaining != 0 {
            let Some(idx) = self.piece_picker.write().await.pick_new_piece(bf) else {
                break;
            };
            tracing::trace!("picked piece {}", idx);
            let mut partial_piece = PartialPiece::new(idx, self.piece_len_for(idx));
            remaining -= partial_piece.pick_next_blocks(remaining, &mut requests, current_requests);
            self.partial_pieces.write().await.insert(idx, partial_piece.into());
        }

        requests
    }

    // Records a received block's bytes, and if that completes the piece,
    // verifies it against its expected hash. Returns `None` if the piece is
    // still incomplete, a duplicate, or unknown (should not happen).
    pub async fn receive_block(&self, block: BlockInfo, data: &[u8]) -> Option<VerifyOutcome> {
        let partial_pieces = self.partial_pieces.read().await;
        let partial_piece = partial_pieces.get(&block.piece_idx)?;
        let mut guard = partial_piece.write().await;
        let is_duplicate = guard.received_block(&block, data);
        if is_duplicate || !guard.is_complete() {
            return None;
        }

        let hash = self.piece_hashes.get(block.piece_idx)?;
        if guard.verify(hash) {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            Some(VerifyOutcome::Valid { idx: block.piece_idx, data: guard.data.clone() })
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!("piece {} failed hash verification ({} consecutive)", block.piece_idx, failures);
            guard.free_all_blocks();
            guard.data.iter_mut().for_each(|b| *b = 0);
            Some(VerifyOutcome::Invalid { idx: block.piece_idx })
        }
    }

    // Called once a verified piece has actually been written to disk.
    pub async fn mark_written(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.received_piece(idx);
    }

    // Called when a piece fails verification: its blocks are already freed
    // by `receive_block`, but the piece must be made pickable again.
    pub async fn release_failed_piece(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.release_piece(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use sha1::{Digest, Sha1};

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[tokio::test]
    async fn test_pick_blocks() {
        let hashes: Vec<[u8; 20]> = (0..1028).map(|_| [0u8; 20]).collect();
        let scheduler = PieceScheduler::new(hashes, 32_768, 32_768);
        let bf = BitVec::repeat(true, 1028);
        scheduler.piece_picker.write().await.bitfield_update(&bf);
        let requests_1 = scheduler.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);
        let requests_2 = scheduler.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_2.len(), 4);
    }

    #[tokio::test]
    async fn completed_piece_with_correct_hash_verifies() {
        let piece_len = crate::BLOCK_SIZE * 2;
        let data = vec![7u8; piece_len];
        let hashes = vec![hash_of(&data)];
        let scheduler = PieceScheduler::new(hashes, piece_len, piece_len);
        let bf = BitVec::repeat(true, 1);
        scheduler.piece_picker.write().await.bitfield_update(&bf);

        let requests = scheduler.pick_blocks(&HashSet::new(), 2, &bf).await;
        assert_eq!(requests.len(), 2);

        let mut outcome = None;
        for req in &requests {
            let chunk = &data[req.offset..req.offset + req.len];
            outcome = scheduler.receive_block(*req, chunk).await;
        }
        match outcome {
            Some(VerifyOutcome::Valid { idx, data: got }) => {
                assert_eq!(idx, 0);
                assert_eq!(got, data);
            }
            _ => panic!("expected a valid piece"),
        }
    }

    #[tokio::test]
    async fn completed_piece_with_wrong_hash_is_rejected_and_blocks_freed() {
        let piece_len = crate::BLOCK_SIZE;
        let data = vec![1u8; piece_len];
        let hashes = vec![[0xffu8; 20]];
        let scheduler = PieceScheduler::new(hashes, piece_len, piece_len);
        let bf = BitVec::repeat(true, 1);
        scheduler.piece_picker.write().await.bitfield_update(&bf);

        let requests = scheduler.pick_blocks(&HashSet::new(), 1, &bf).await;
        let outcome = scheduler.receive_block(requests[0], &data).await;
        assert!(matches!(outcome, Some(VerifyOutcome::Invalid { idx: 0 })));

        let partial_pieces = scheduler.partial_pieces.read().await;
        let partial = partial_pieces.get(&0).unwrap().read().await;
        assert!(partial.blocks_states.iter().all(|b| *b == partial_piece::BlockState::Free));
    }

    #[tokio::test]
    async fn repeated_hash_failures_escalate_and_then_reset_on_success() {
        let piece_len = crate::BLOCK_SIZE;
        let bad_data = vec![1u8; piece_len];
        let hashes = vec![[0xffu8; 20]; 1];
        let scheduler = PieceScheduler::new(hashes, piece_len, piece_len);
        let bf = BitVec::repeat(true, 1);
        scheduler.piece_picker.write().await.bitfield_update(&bf);

        for _ in 0..FAILURE_EMERGENCY_THRESHOLD {
            let requests = scheduler.pick_blocks(&HashSet::new(), 1, &bf).await;
            scheduler.receive_block(requests[0], &bad_data).await;
            scheduler.release_failed_piece(requests[0].piece_idx).await;
        }
        assert_eq!(scheduler.failure_escalation(), FailureEscalation::EmergencyReannounce);

        let good_data = vec![2u8; piece_len];
        let good_hash = hash_of(&good_data);
        let scheduler = PieceScheduler::new(vec![good_hash], piece_len, piece_len);
        scheduler.piece_picker.write().await.bitfield_update(&bf);
        scheduler.consecutive_failures.store(FAILURE_EMERGENCY_THRESHOLD, Ordering::SeqCst);
        let requests = scheduler.pick_blocks(&HashSet::new(), 1, &bf).await;
        scheduler.receive_block(requests[0], &good_data).await;
        assert_eq!(scheduler.failure_escalation(), FailureEscalation::Normal);
    }
}
