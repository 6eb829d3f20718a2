use std::{fs, path};
use crate::store::FileInfo;
use super::Result;

#[derive(Debug)]
pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: fs::File,
}

impl TorrentFile {

    pub fn new(dir: &path::Path, info: FileInfo) -> Result<Self> {

        let path = dir.join(&info.path);
        tracing::info!("creating file: {:?}", &path);
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            info,
            handle,
        })
    }
}
