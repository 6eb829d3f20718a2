use std::collections::HashSet;
use std::time::{Duration, Instant};
use crate::block::{block_len, num_blocks, BlockInfo};
use crate::BLOCK_SIZE;

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {
    // Block has not been requested.
    #[default]
    Free,
    // Block has been requested from the peer holding it, at the given
    // instant - swept back to `Free` after the 30s request timeout
    // (SPEC_FULL.md 4.4) so a stalled peer doesn't stall the whole piece.
    Requested(Instant),
    // Block has been received and handed to disk.
    Received,
}

#[derive(Debug)]
pub struct PartialPiece {
    // Piece index.
    pub idx: usize,
    // Length of piece.
    pub len: usize,
    // State of all blocks within this piece.
    pub blocks_states: Vec<BlockState>,
    // Accumulated bytes, assembled in place as blocks arrive.
    pub data: Vec<u8>,
}

impl PartialPiece {
    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            blocks_states: vec![BlockState::default(); num_blocks(len) as usize],
            data: vec![0; len],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks_states.iter().all(|b| *b == BlockState::Received)
    }

    pub fn free_block(&mut self, block: &BlockInfo) {
        assert!(block.piece_idx == self.idx);
        self.blocks_states[block.idx_in_piece()] = BlockState::Free;
    }

    // Frees every in-flight block, e.g. after failed hash verification -
    // the whole piece has to be re-requested from scratch.
    pub fn free_all_blocks(&mut self) {
        self.blocks_states.iter_mut().for_each(|b| *b = BlockState::Free);
    }

    // Returns whether the block is a duplicate (already received). On first
    // receipt the block's bytes are copied into the assembly buffer.
    pub fn received_block(&mut self, block: &BlockInfo, data: &[u8]) -> bool {
        let block_state = &mut self.blocks_states[block.idx_in_piece()];
        match *block_state {
            // A block can arrive after its own request timed out and was
            // handed to another peer - accept it late rather than treat it
            // as an error (SPEC_FULL.md 4.4 doesn't require rejecting this).
            BlockState::Free | BlockState::Requested(_) => {
                *block_state = BlockState::Received;
                self.data[block.offset..block.offset + data.len()].copy_from_slice(data);
                false
            }
            BlockState::Received => true,
        }
    }

    // Reverts any block that's been sitting in `Requested` for longer than
    // `timeout` back to `Free`, so another peer can pick it up.
    pub fn free_timed_out(&mut self, timeout: Duration) {
        for block in self.blocks_states.iter_mut() {
            if let BlockState::Requested(t) = block {
                if t.elapsed() >= timeout {
                    *block = BlockState::Free;
                }
            }
        }
    }

    // Verifies the assembled piece against its expected SHA1 digest.
    pub fn verify(&self, expected: &[u8; 20]) -> bool {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == expected
    }

    // Picks open blocks sequentially within a partially downloaded piece.
    // End-game duplicate requesting is not implemented: once every block of
    // every in-progress piece is outstanding, the scheduler simply waits.
    pub fn pick_next_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        _prev: &HashSet<BlockInfo>,
    ) -> usize {
        let mut num_picked = 0;
        for (i, block) in self.blocks_states.iter_mut().enumerate() {
            if num_picked == num {
                break;
            }
            if *block == BlockState::Free {
                buf.push(BlockInfo {
                    piece_idx: self.idx,
                    offset: i * BLOCK_SIZE,
                    len: block_len(self.len, i),
                });
                *block = BlockState::Requested(Instant::now());
                num_picked += 1;
            }
        }
        num_picked
    }
}
