use crate::Bitfield;

// A better strategy is to download pieces in rarest first order. The client
// determines this by keeping a running frequency count from every peer
// bitfield and have message seen, then preferring the pieces that appear
// least often. Ties are broken by lowest index.

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of peers that have this piece.
    frequency: usize,
    // Is the piece partially downloaded.
    is_partial: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        !self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
    }

    // Frees a piece whose hash failed verification so it can be picked again.
    pub fn release_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].is_partial = false;
    }

    // Returns true if the peer has at least one piece we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf.iter().enumerate().filter(|(_, b)| **b).for_each(|(i, _)| {
            self.pieces[i].frequency += 1;
            if !self.have[i] {
                interested = true;
            }
        });
        interested
    }

    // Picks the rarest eligible piece the given peer has that we neither
    // have nor have already started downloading, breaking ties by lowest
    // index (SPEC_FULL.md 4.4).
    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {
        let mut best_freq = usize::MAX;
        let mut best_idx = None;

        for idx in 0..self.have.len() {
            if self.have[idx] || self.pieces[idx].is_partial || !bf[idx] {
                continue;
            }
            let freq = self.pieces[idx].frequency;
            if freq == 0 {
                continue;
            }
            if freq < best_freq {
                best_freq = freq;
                best_idx = Some(idx);
            }
        }

        let idx = best_idx?;
        self.pieces[idx].is_partial = true;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    fn full(n: usize) -> Bitfield {
        BitVec::repeat(true, n)
    }

    fn only(n: usize, idx: usize) -> Bitfield {
        let mut bf = BitVec::repeat(false, n);
        bf.set(idx, true);
        bf
    }

    #[test]
    fn prefers_the_rarest_piece() {
        let mut picker = PiecePicker::new(3);
        let common = full(3);
        let rare = only(3, 1);
        // Piece 0/2 seen by two peers, piece 1 by one.
        picker.bitfield_update(&common);
        picker.bitfield_update(&common);
        picker.bitfield_update(&rare);

        let picked = picker.pick_new_piece(&common);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn does_not_repick_a_piece_already_in_progress() {
        let mut picker = PiecePicker::new(2);
        let bf = full(2);
        picker.bitfield_update(&bf);
        let first = picker.pick_new_piece(&bf);
        assert!(first.is_some());
        let second = picker.pick_new_piece(&bf);
        assert_ne!(first, second);
    }

    #[test]
    fn releasing_a_piece_makes_it_pickable_again() {
        let mut picker = PiecePicker::new(1);
        let bf = only(1, 0);
        picker.bitfield_update(&bf);
        let first = picker.pick_new_piece(&bf);
        assert_eq!(first, Some(0));
        assert_eq!(picker.pick_new_piece(&bf), None);
        picker.release_piece(0);
        assert_eq!(picker.pick_new_piece(&bf), Some(0));
    }
}
