use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use crate::{store::FileInfo, tracker::Tracker};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // #[serde(deserialize_with = "crate::de::path_deserialize")]
    pub path: Vec<String>,

    pub length: u64,

    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // File namepub .
    pub name: String,
    
    // String consisting of the concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file.
    #[serde(default)]
    pub md5sum: Option<String>,
    
    // Length of the file in bytes (integer).
    #[serde(default)]
    pub length: Option<u64>,

    // A list of dictionaries, one for each file.
    #[serde(default)]
    pub files: Option<Vec<File>>,
    
    // If it is set to "1", the client MUST publish its presence to get other peers ONLY 
    // via the trackers explicitly described in the metainfo file. If this field is set to 
    // "0" or is not present, the client may obtain peer from other means, e.g. PEX peer exchange, dht.
    #[serde(default)]
    pub private: Option<u8>,

    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,

}

// Computes the SHA1 hash of the `info` dictionary directly from the
// original file bytes, rather than re-serializing the deserialized `Info`
// struct. A re-serialization round-trip is not guaranteed to reproduce the
// original byte sequence (key order, non-canonical integers, unknown keys
// would all be dropped or reordered), which would silently compute the
// wrong info-hash and make the client unable to find peers for a torrent
// it can otherwise parse fine.
fn raw_info_hash(file_bytes: &[u8]) -> Result<[u8; 20], MetaInfoError> {
    use sha1::Digest;
    let range = bencode::find_dict_value_range(file_bytes, b"info")?;
    let mut hasher = sha1::Sha1::new();
    hasher.update(&file_bytes[range]);
    Ok(hasher.finalize().into())
}

// Rejects metadata that bencode-parses fine but is internally inconsistent:
// neither/both of `length`/`files` present, a zero-length or escaping file
// entry, or a `pieces` count that doesn't actually tile the declared total
// length at the declared piece length. Left unchecked, this class of defect
// reaches `StoreInfo`/`DiskLayout` as a panic deep in the download path
// instead of a load-time error.
fn validate_info(info: &Info) -> Result<(), MetaInfoError> {
    if info.piece_length == 0 {
        return Err(MetaInfoError::MalformedMetadata("piece length is zero".into()));
    }

    let total_len = match (&info.length, &info.files) {
        (Some(_), Some(_)) => {
            return Err(MetaInfoError::MalformedMetadata(
                "info dict has both `length` and `files`".into(),
            ))
        }
        (None, None) => {
            return Err(MetaInfoError::MalformedMetadata(
                "info dict has neither `length` nor `files`".into(),
            ))
        }
        (Some(len), None) => {
            if *len == 0 {
                return Err(MetaInfoError::FileNoSize);
            }
            *len
        }
        (None, Some(files)) => {
            if files.is_empty() {
                return Err(MetaInfoError::MalformedMetadata("`files` list is empty".into()));
            }
            let mut total = 0u64;
            for f in files {
                if f.length == 0 {
                    return Err(MetaInfoError::FileNoSize);
                }
                if f.path.is_empty() || f.path.iter().any(|c| c.is_empty()) {
                    return Err(MetaInfoError::FileEmptyPath);
                }
                if f.path.iter().any(|c| c == ".." || c.starts_with('/')) {
                    return Err(MetaInfoError::FileAbsolutePath);
                }
                total += f.length;
            }
            total
        }
    };

    let num_pieces = info.pieces.len() as u64 / 20;
    let expected_pieces = total_len.div_ceil(info.piece_length as u64);
    if num_pieces != expected_pieces {
        return Err(MetaInfoError::MalformedMetadata(format!(
            "pieces field has {num_pieces} hashes but total length {total_len} at piece length {} implies {expected_pieces}",
            info.piece_length
        )));
    }

    Ok(())
}

#[allow(dead_code)]
#[derive(Deserialize, Clone)]
pub struct MetaInfo {
    
    // The announce URL of the tracker (string). Optional per BEP-3 once
    // `announce-list` (or a pure-magnet descriptor) supplies trackers
    // instead (SPEC_FULL.md 6).
    #[serde(default)]
    #[serde(deserialize_with = "crate::de::optional_url_deserialize")]
    pub announce: Option<url::Url>,
    
    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,
    
    // sha1 hash of info dict
    #[serde(skip)] 
    pub info_hash: [u8; 20],
    
    // (optional) the string encoding format used to generate the pieces part of the info 
    // dictionary in the .torrent metafile (string).
    #[serde(default)]
    pub encoding: Option<String>,
    
    // (optional) this is an extention to the official specification, offering backwards-compatibility.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,
    
    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    
    // (optional) free-form textual comments of the author (string).
    #[serde(rename = "comment")]
    pub comment: Option<String>,
    
    // (optional) name and version of the program used to create the .torrent (string).
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
    
}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        Self::from_bytes(&std::fs::read(path)?)
    }

    // Parses metainfo directly from a byte buffer, without going through a
    // filesystem path. Used both by `new` and by metadata received over the
    // wire via a magnet link (ut_metadata is out of scope, but this keeps
    // the parsing entry point reusable for that).
    pub fn from_bytes(file_bytes: &[u8]) -> Result<MetaInfo, MetaInfoError> {
        let mut metainfo: MetaInfo = bencode::decode_bytes(file_bytes)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        validate_info(&metainfo.info)?;

        metainfo.info_hash = raw_info_hash(file_bytes)?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20, in new.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }
    
    pub fn single_file_len(&self) -> Option<u64> { self.info.length }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length as u64).sum()
        } else {
            self.info.length.unwrap_or(0) as u64
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }
    
    pub fn name(&self) -> &str { &self.info.name }

    pub fn trackers(&self) -> Vec<Vec<Tracker>> {
        let is_private = self.info.private == Some(1);
        // If announce_list is present, we use that.
        if let Some(announce_list) = self.announce_list.clone() {
            let mut trackers = Vec::new();
            for mut tier in announce_list {
                let mut tier_trackers = Vec::new();
                // Randomly shuffle the trackers in the tier.
                tier.shuffle(&mut rand::thread_rng());
                for url in tier {
                    tier_trackers.push(Tracker::new(url, is_private));
                }
                trackers.push(tier_trackers);
            }
            trackers
        // Otherwise fall back to the single announce key, if any - a
        // pure-magnet-derived descriptor may carry neither.
        } else if let Some(announce) = &self.announce {
            vec![vec![Tracker::new(announce.clone(), is_private)]]
        } else {
            Vec::new()
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let path: std::path::PathBuf = f.path.iter().map(|c| sanitise_path_component(c)).collect();
                let file_info = FileInfo {
                    path,
                    length: f.length as usize,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: sanitise_path_component(&self.info.name).into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
                md5sum: None,
            }]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(&self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        if self.is_multi_file() {
            let size = self.info.files.as_ref().unwrap().iter()
                .map(|f| f.length)
                .sum::<u64>();
            format_size(size)
        } else {
            format_size(self.info.length.unwrap_or(0))
        }
    }
}

// Replaces every character invalid on the host filesystem with `_`
// (SPEC_FULL.md 6). Conservative across Windows and POSIX rather than
// per-platform, since a `.torrent` downloaded on one OS should still lay
// out the same way if moved to the other.
pub(crate) fn sanitise_path_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect()
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    if size > 1024.0 {
        size /= 1024.0;
        unit = "KiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "MiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "GiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "TiB";
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(url::Url::as_str))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            // Change urls to strings for printing.
            .field("announce_list", &self.announce_list.as_ref().map(|v| 
                v.iter().map(|v| 
                    v.iter().map(|v| 
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(&self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::Digest;

    const SINGLE_FILE: &[u8] = b"d8:announce18:http://tracker/ann4:infod6:lengthi10e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

    const MULTI_FILE: &[u8] = b"d8:announce18:http://tracker/ann4:infod5:filesld6:lengthi4e4:pathl5:a.txteed6:lengthi6e4:pathl5:b.txteee4:name6:bundle12:piece lengthi16384e6:pieces20:bbbbbbbbbbbbbbbbbbbbee";

    #[test]
    fn parses_single_file_metainfo_and_hashes_the_raw_info_bytes() {
        let metainfo = MetaInfo::from_bytes(SINGLE_FILE).unwrap();
        assert_eq!(metainfo.num_pieces(), 1);
        assert_eq!(metainfo.info.piece_length, 16_384);
        assert_eq!(metainfo.total_len(), 10);
        assert!(!metainfo.is_multi_file());

        let info_bytes = b"d6:lengthi10e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let mut hasher = sha1::Sha1::new();
        hasher.update(info_bytes);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
    }

    #[test]
    fn parses_multi_file_metainfo() {
        let metainfo = MetaInfo::from_bytes(MULTI_FILE).unwrap();
        assert!(metainfo.is_multi_file());
        assert_eq!(metainfo.total_len(), 10);
        let files = metainfo.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].offset, 4);
    }

    #[test]
    fn sanitises_path_components_with_characters_invalid_on_some_filesystems() {
        assert_eq!(sanitise_path_component("a:b*c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitise_path_component("normal.txt"), "normal.txt");
    }

    #[test]
    fn rejects_a_pieces_field_not_a_multiple_of_20() {
        let bad = b"d8:announce18:http://tracker/ann4:infod6:lengthi10e4:name5:a.txt12:piece lengthi16384e6:pieces3:abcee";
        assert!(matches!(MetaInfo::from_bytes(bad), Err(MetaInfoError::InvalidPiecesLength)));
    }

    #[test]
    fn parses_a_descriptor_with_no_top_level_announce_key() {
        // Only announce-list, no announce - legal per BEP-3/12, and the
        // only tracker source a pure-magnet-resolved descriptor may carry.
        let no_announce: &[u8] = b"d13:announce-listll18:http://tracker/annee4:infod6:lengthi10e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let metainfo = MetaInfo::from_bytes(no_announce).unwrap();
        assert!(metainfo.announce.is_none());
        let tiers = metainfo.trackers();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].len(), 1);
    }

    #[test]
    fn rejects_an_info_dict_with_neither_length_nor_files() {
        let no_size: &[u8] = b"d8:announce18:http://tracker/ann4:infod4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(MetaInfo::from_bytes(no_size), Err(MetaInfoError::MalformedMetadata(_))));
    }

    #[test]
    fn rejects_a_pieces_count_inconsistent_with_total_length() {
        // total length 10 at piece length 5 implies 2 pieces, but only one hash is given.
        let bad = b"d8:announce18:http://tracker/ann4:infod6:lengthi10e4:name5:a.txt12:piece lengthi5e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(MetaInfo::from_bytes(bad), Err(MetaInfoError::MalformedMetadata(_))));
    }
}
