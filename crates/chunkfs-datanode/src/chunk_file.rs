//! Local chunk files: one file per chunk under `<data_dir>/chunks`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::Result;

const CHUNK_DIR: &str = "chunks";

#[derive(Debug, Clone)]
pub struct ChunkFileStore {
    root: PathBuf,
}

impl ChunkFileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(CHUNK_DIR),
        }
    }

    pub fn chunk_path(&self, chunk_id: u64) -> PathBuf {
        self.root.join(chunk_id.to_string())
    }

    /// Opens `chunk_id` for writing, creating it and the chunk directory
    /// when missing. Existing bytes are kept.
    pub async fn open(&self, chunk_id: u64) -> Result<ChunkFile> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.chunk_path(chunk_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        Ok(ChunkFile { path, file })
    }
}

pub struct ChunkFile {
    path: PathBuf,
    file: File,
}

impl ChunkFile {
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
