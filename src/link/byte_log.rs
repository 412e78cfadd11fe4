//! # Diagnostic Byte Log
//!
//! Append-only capture of every byte received from the logger.
//!
//! The log is an observer only: it is never read back, and failing to open
//! or write it never changes what the protocol sees.

use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Best-effort raw byte sink
#[derive(Debug)]
pub struct ByteLog {
    path: PathBuf,
    file: Option<File>,
}

impl ByteLog {
    /// Open (or create) the log for appending
    ///
    /// Never fails; on error the log is returned inactive.
    pub async fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => {
                debug!("Byte log open at {}", path.display());
                Some(file)
            }
            Err(e) => {
                warn!("Byte log disabled, cannot open {}: {}", path.display(), e);
                None
            }
        };

        Self { path, file }
    }

    /// A log that records nothing
    pub fn disabled() -> Self {
        Self { path: PathBuf::new(), file: None }
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append bytes, write-through
    ///
    /// The first write error disables the log for the rest of its life.
    pub async fn record(&mut self, bytes: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let result = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("Byte log disabled after write error on {}: {}", self.path.display(), e);
            self.file = None;
        }
    }
}
