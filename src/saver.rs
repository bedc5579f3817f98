// src/saver.rs

use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
}

/// Writes assembled payloads into a download directory.
#[derive(Debug, Clone)]
pub struct FileSaver {
    dir: PathBuf,
}

impl FileSaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Final location of `filename`. Rejects names that would escape the
    /// download directory.
    pub fn destination(&self, filename: &str) -> Result<PathBuf, SaveError> {
        let relative = Path::new(filename);
        let is_plain = !filename.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(SaveError::InvalidFileName(filename.to_string()));
        }
        Ok(self.dir.join(relative))
    }

    /// Writes the chunks, in order, to `<filename>.odm-part` and renames it
    /// into place once everything is flushed.
    pub async fn save(&self, filename: &str, chunks: &[Bytes]) -> Result<PathBuf, SaveError> {
        let destination = self.destination(filename)?;
        let temporary = temporary_path(&destination);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&temporary).await?;
        for chunk in chunks {
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temporary, &destination).await?;
        Ok(destination)
    }
}

/// e.g. for "/path/to/file.zip", returns "/path/to/file.zip.odm-part"
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".odm-part");
    PathBuf::from(name)
}
