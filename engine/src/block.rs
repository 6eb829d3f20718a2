use crate::{store::StoreInfo, BLOCK_SIZE};

// Request-side bound on how large a single block may be; a peer asking for
// more than this is either confused or hostile.
pub const MAX_REQUEST_LEN: usize = BLOCK_SIZE * 2;

// Identity of a single block request: which piece, what byte offset within
// it, and how long. Used as the key for in-flight-request bookkeeping.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {
    pub piece_idx: usize,
    pub offset: usize,
    pub len: usize,
}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // Rejects a peer's request that couldn't possibly correspond to a real
    // block of this torrent: out of range piece/offset, zero or oversized
    // length, or a length that would run past the end of the piece.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        if self.piece_idx >= info.num_pieces as usize {
            return false;
        }
        if self.len == 0 || self.len > MAX_REQUEST_LEN {
            return false;
        }
        let piece_len = info.piece_length(self.piece_idx);
        self.offset < piece_len && self.offset + self.len <= piece_len
    }
}

// Owned block payload, as received over the wire or about to be sent over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub piece_idx: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo { piece_idx: self.piece_idx, offset: self.offset, len: self.data.len() }
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        for i in 0..12 {
            assert_eq!(num_blocks(BLOCK_SIZE * i), i as u32);
        }
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn block_info_reports_its_index_within_the_piece() {
        let b = BlockInfo { piece_idx: 3, offset: BLOCK_SIZE * 2, len: BLOCK_SIZE };
        assert_eq!(b.idx_in_piece(), 2);
    }
}
