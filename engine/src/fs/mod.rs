use std::{
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    sync::{Arc, Mutex, RwLock},
};

use crate::store::{FileInfo, StoreInfo};

pub mod file;

use file::TorrentFile;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("piece {0} out of range")]
    InvalidPiece(usize),
}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::Sync(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;

// Maps the flat torrent byte stream onto one or many underlying files and
// serves piece-aligned reads/writes (SPEC_FULL.md 4.5). Kept as a plain
// async-method struct rather than the teacher's channel-driven actor: once
// `PieceScheduler` hands over a fully assembled, hash-verified piece there
// is no more per-block bookkeeping left to own, so the actor boilerplate
// the teacher used for `fs/mod.rs` no longer earns its keep.
pub struct DiskLayout {
    info: StoreInfo,
    files: Vec<RwLock<TorrentFile>>,
    // Serialises writes per torrent; a single critical section suffices for
    // correctness per SPEC_FULL.md 4.5 (pipelining is an optimisation).
    write_lock: tokio::sync::Mutex<()>,
    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,
}

impl DiskLayout {
    // Creates the save root and opens/creates every underlying file,
    // creating any missing parent directories along the way.
    pub fn new(info: StoreInfo) -> Result<Self> {
        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created save root: {:?}", info.output_dir);
        }

        let mut files = Vec::with_capacity(info.files.len());
        for file in &info.files {
            let path = info.output_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            files.push(RwLock::new(TorrentFile::new(&info.output_dir, file.clone())?));
        }

        Ok(Self {
            info,
            files,
            write_lock: tokio::sync::Mutex::new(()),
            // Unwrap is safe: the constant is non-zero.
            read_cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(500).unwrap())),
        })
    }

    // Writes a fully assembled, hash-verified piece to every file it
    // overlaps. Each covered file gets exactly the intersecting byte range
    // (SPEC_FULL.md 4.5 multi-file straddle invariant).
    pub async fn write_piece(&self, piece_idx: usize, data: Arc<Vec<u8>>) -> Result<()> {
        if piece_idx as u32 >= self.info.num_pieces {
            return Err(DiskError::InvalidPiece(piece_idx));
        }
        let _guard = self.write_lock.lock().await;

        let piece_offset = self.info.piece_byte_offset(piece_idx);
        let file_range = self.info.piece_file_intersections(piece_idx);
        let files = &self.files[file_range];

        tokio::task::block_in_place(|| write_piece_sync(files, piece_offset, &data))?;

        self.read_cache.lock()?.put(piece_idx, data);
        Ok(())
    }

    // Reads a piece back from disk, serving from the small LRU cache when
    // possible. Used for the seeding/upload path.
    pub async fn read_piece(&self, piece_idx: usize) -> Result<Arc<Vec<u8>>> {
        if piece_idx as u32 >= self.info.num_pieces {
            return Err(DiskError::InvalidPiece(piece_idx));
        }
        if let Some(cached) = self.read_cache.lock()?.get(&piece_idx) {
            return Ok(Arc::clone(cached));
        }

        let piece_offset = self.info.piece_byte_offset(piece_idx);
        let piece_len = self.info.piece_length(piece_idx);
        let file_range = self.info.piece_file_intersections(piece_idx);
        let files = &self.files[file_range];

        let data = tokio::task::block_in_place(|| read_piece_sync(files, piece_offset, piece_len))?;
        let data = Arc::new(data);
        self.read_cache.lock()?.put(piece_idx, Arc::clone(&data));
        Ok(data)
    }

    // Diagnostic precheck for a restarted torrent: does every underlying
    // file already exist with exactly its expected length? Never modifies
    // anything; a mismatch just means the verify-by-hash download path
    // runs as normal (SPEC_FULL.md 9 - resume is out of scope).
    pub fn verify_sizes(&self) -> bool {
        self.files.iter().all(|f| {
            let f = f.read().expect("file lock poisoned");
            match f.handle.metadata() {
                Ok(meta) => meta.len() == f.info.length as u64,
                Err(_) => false,
            }
        })
    }
}

fn write_piece_sync(files: &[RwLock<TorrentFile>], piece_offset: usize, data: &[u8]) -> Result<()> {
    let piece_end = piece_offset + data.len();
    for file in files {
        let mut f = file.write()?;
        let byte_range = f.info.byte_range();
        let start = piece_offset.max(byte_range.start);
        let end = piece_end.min(byte_range.end);
        if start >= end {
            continue;
        }
        let in_piece_offset = start - piece_offset;
        let in_file_offset = start - byte_range.start;
        let len = end - start;

        f.handle.seek(SeekFrom::Start(in_file_offset as u64))?;
        f.handle.write_all(&data[in_piece_offset..in_piece_offset + len])?;
        f.handle.flush()?;
    }
    Ok(())
}

fn read_piece_sync(files: &[RwLock<TorrentFile>], piece_offset: usize, piece_len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; piece_len];
    let piece_end = piece_offset + piece_len;
    for file in files {
        let mut f = file.write()?;
        let byte_range = f.info.byte_range();
        let start = piece_offset.max(byte_range.start);
        let end = piece_end.min(byte_range.end);
        if start >= end {
            continue;
        }
        let in_piece_offset = start - piece_offset;
        let in_file_offset = start - byte_range.start;
        let len = end - start;

        f.handle.seek(SeekFrom::Start(in_file_offset as u64))?;
        f.handle.read_exact(&mut buf[in_piece_offset..in_piece_offset + len])?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn store(piece_len: usize, files: Vec<(&str, usize)>) -> (StoreInfo, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut offset = 0usize;
        let infos: Vec<FileInfo> = files
            .into_iter()
            .map(|(name, length)| {
                let f = FileInfo { path: PathBuf::from(name), length, offset, md5sum: None };
                offset += length;
                f
            })
            .collect();
        let total_len = offset as u64;
        let num_pieces = ((total_len as usize + piece_len - 1) / piece_len) as u32;
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        (
            StoreInfo {
                total_len,
                piece_len,
                last_piece_len,
                num_pieces,
                files: infos,
                output_dir: dir.path().to_path_buf(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn writes_and_reads_back_a_single_file_piece() {
        let (info, _dir) = store(10, vec![("a.bin", 30)]);
        let disk = DiskLayout::new(info).unwrap();
        let data = Arc::new(vec![7u8; 10]);
        disk.write_piece(1, data.clone()).await.unwrap();
        let read_back = disk.read_piece(1).await.unwrap();
        assert_eq!(*read_back, *data);
    }

    #[tokio::test]
    async fn piece_straddling_two_files_writes_disjoint_ranges() {
        // Files of length 15 and 15, piece length 10: piece 1 = bytes [10, 20).
        let (info, dir) = store(10, vec![("a.bin", 15), ("b.bin", 15)]);
        let output_dir = info.output_dir.clone();
        let disk = DiskLayout::new(info).unwrap();
        let data: Vec<u8> = (0..10).collect();
        disk.write_piece(1, Arc::new(data.clone())).await.unwrap();

        let a = std::fs::read(output_dir.join("a.bin")).unwrap();
        let b = std::fs::read(output_dir.join("b.bin")).unwrap();
        assert_eq!(&a[10..15], &data[0..5]);
        assert_eq!(&b[0..5], &data[5..10]);
        drop(dir);
    }

    #[tokio::test]
    async fn verify_sizes_reports_false_until_every_file_reaches_its_length() {
        let (info, _dir) = store(10, vec![("a.bin", 30)]);
        let disk = DiskLayout::new(info).unwrap();
        assert!(!disk.verify_sizes());
        disk.write_piece(0, Arc::new(vec![0u8; 10])).await.unwrap();
        disk.write_piece(1, Arc::new(vec![0u8; 10])).await.unwrap();
        assert!(!disk.verify_sizes());
        disk.write_piece(2, Arc::new(vec![0u8; 10])).await.unwrap();
        assert!(disk.verify_sizes());
    }
}
