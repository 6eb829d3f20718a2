use core::panic;
use std::{path::PathBuf, ops::Range};
use serde_derive::{Deserialize, Serialize};
use crate::metainfo::{MetaInfo, MetaInfoError};

// File information deserialised from metainfo.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "File")]
pub struct FileInfo {

    // A list containing one or more string elements that together represent the path and filename
    #[serde(deserialize_with = "crate::de::path_deserialize")]
    pub path: PathBuf,
    
    // Length of the file in bytes (integer)
    pub length: usize,
    
    // Offset in bytes from start of torrent when viewed as single array.
    #[serde(skip)]
    pub offset: usize,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file
    #[serde(default)]
    pub md5sum: Option<String>,

}

impl FileInfo {
    // Byte index range for whole torrent.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }

    pub fn last_byte(&self) -> usize {
        self.offset + self.length
    }
}

// Contains general information on torrage storage.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, will be < piece_length.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: u32,

    // File contained in torrent.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    // Fails with `MalformedMetadata` rather than panicking or underflowing
    // when the torrent's declared file lengths don't actually tile
    // `[0, total_len)` at the declared piece length - `MetaInfo::from_bytes`
    // already rejects this shape, but this check stands on its own so a
    // `StoreInfo` can never be built inconsistent with the data it describes.
    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Result<Self, MetaInfoError> {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();

        if piece_len == 0 || num_pieces == 0 {
            return Err(MetaInfoError::MalformedMetadata("zero piece length or piece count".into()));
        }
        let expected_pieces = (total_len as usize + piece_len - 1) / piece_len;
        if expected_pieces != num_pieces as usize {
            return Err(MetaInfoError::MalformedMetadata(format!(
                "{num_pieces} pieces declared but total length {total_len} at piece length {piece_len} implies {expected_pieces}"
            )));
        }
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;

        let files = metainfo.files();
        let files_total: usize = files.iter().map(|f| f.length).sum();
        if files_total as u64 != total_len {
            return Err(MetaInfoError::MalformedMetadata(format!(
                "file lengths sum to {files_total} but total length is {total_len}"
            )));
        }

        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(crate::metainfo::sanitise_path_component(metainfo.name()))
        } else {
            output_dir
        };

        Ok(Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        })
    }

    // Returns length of piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_byte_offset(&self, piece_idx: usize) -> usize {
        piece_idx * self.piece_len
    }

    // Returns the indexes of the first and last file that a piece intersects.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!(piece_idx < self.num_pieces as usize, "piece index out of bounds");

        // If only one file, there are no intersections to compute.
        if self.files.len() == 1 {
            return 0..1;
        }

        let offset = piece_idx * self.piece_len;
        let last_byte = offset + self.piece_length(piece_idx) - 1;

        let start_file = match self.files
            .iter()
            .enumerate()
            .find(|(_, f)| f.byte_range().contains(&offset))
        {
            Some((idx, _)) => idx,
            None => panic!("piece byte offset exceeds file length"),
        };

        let end_file = match self.files[start_file..]
            .iter()
            .enumerate()
            .find(|(_, f)| f.byte_range().contains(&last_byte))
        {
            Some((idx, _)) => start_file + idx,
            None => panic!("piece last byte exceeds torrent length"),
        };

        start_file..(end_file + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(offset: usize, length: usize) -> FileInfo {
        FileInfo { path: PathBuf::from(format!("f{offset}")), length, offset, md5sum: None }
    }

    fn store(piece_len: usize, files: Vec<FileInfo>) -> StoreInfo {
        let total_len: u64 = files.iter().map(|f| f.length as u64).sum();
        let num_pieces = ((total_len as usize + piece_len - 1) / piece_len) as u32;
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        StoreInfo {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir: PathBuf::from("out"),
        }
    }

    #[test]
    fn piece_entirely_within_one_file() {
        let s = store(10, vec![file(0, 100)]);
        assert_eq!(s.piece_file_intersections(0), 0..1);
    }

    #[test]
    fn piece_straddling_a_file_boundary() {
        // Files of length 15 and 15, piece length 10: piece 1 covers bytes
        // [10, 20), which spans both files (file 0 is [0,15), file 1 is [15,30)).
        let s = store(10, vec![file(0, 15), file(15, 15)]);
        assert_eq!(s.piece_file_intersections(1), 0..2);
    }

    #[test]
    fn piece_exactly_aligned_to_file_boundary_stays_in_one_file() {
        let s = store(10, vec![file(0, 10), file(10, 10)]);
        assert_eq!(s.piece_file_intersections(0), 0..1);
        assert_eq!(s.piece_file_intersections(1), 1..2);
    }

    #[test]
    fn new_builds_from_consistent_metainfo() {
        let single_file: &[u8] = b"d8:announce18:http://tracker/ann4:infod6:lengthi10e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let metainfo = MetaInfo::from_bytes(single_file).unwrap();
        let info = StoreInfo::new(&metainfo, PathBuf::from("out")).unwrap();
        assert_eq!(info.total_len, 10);
        assert_eq!(info.num_pieces, 1);
        assert_eq!(info.files.len(), 1);
    }
}