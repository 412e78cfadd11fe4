//! # Bulk Download
//!
//! Retrieves every file stored on the logger after a `P` command.
//!
//! The stream is a sequence of blocks, ended by an empty filename line:
//!
//! ```text
//! <filename>
//! <telemetry line>
//! ...
//! <empty line>       end of this file
//! <filename>
//! ...
//! <empty line>       empty filename: end of the download
//! ```
//!
//! There is no rollback: files completed before a fault stay on disk, and
//! the file being written when the fault hit is left partial.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::error::{LoggerLinkError, Result};
use crate::link::channel::{LineSink, LineSource};
use crate::protocol::command::{send_command, Command};
use crate::protocol::decoder::decode_telemetry_line;
use crate::protocol::types::CSV_HEADER;

/// Destination for downloaded files
#[async_trait]
pub trait Persist: Send {
    type Output: AsyncWrite + Unpin + Send;

    /// Open a fresh output for `filename`, replacing any previous content
    async fn create(&mut self, filename: &str) -> Result<Self::Output>;
}

/// Writes each downloaded file into one directory
#[derive(Debug, Clone)]
pub struct DirectoryPersist {
    root: PathBuf,
}

impl DirectoryPersist {
    /// Use `root`, creating it if it does not exist
    ///
    /// # Errors
    ///
    /// Returns `Io` if `root` exists but is not a directory, or cannot be
    /// created.
    pub async fn prepare<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        match tokio::fs::metadata(&root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(LoggerLinkError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", root.display()),
                )));
            }
            Ok(_) => {}
            Err(_) => tokio::fs::create_dir_all(&root).await?,
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Persist for DirectoryPersist {
    type Output = BufWriter<File>;

    async fn create(&mut self, filename: &str) -> Result<Self::Output> {
        let file = File::create(self.root.join(filename)).await?;
        Ok(BufWriter::new(file))
    }
}

/// Reject names that would escape the download directory
fn validate_filename(filename: &str) -> Result<()> {
    if filename == "." || filename == ".." || filename.contains(['/', '\\', '\0']) {
        return Err(LoggerLinkError::ProtocolDecode(
            format!("unsafe download filename: {:?}", filename)
        ));
    }
    Ok(())
}

/// Run a complete download session
///
/// Sends `P`, then persists each announced file as CSV with the fixed
/// header row and one decoded row per telemetry line.
///
/// # Returns
///
/// * `Result<usize>` - Number of files fully written
///
/// # Errors
///
/// - `ChannelFault` if the link fails at any point; the count is not returned
/// - `ProtocolDecode` on a malformed data line or unsafe filename
/// - `Io` if a file cannot be written
pub async fn download<L, P>(link: &mut L, persist: &mut P) -> Result<usize>
where
    L: LineSource + LineSink + ?Sized,
    P: Persist + ?Sized,
{
    send_command(link, &Command::Download).await?;

    let mut saved = 0;
    loop {
        let filename = link.read_line().await?;
        if filename.is_empty() {
            info!("Download complete: {} file(s) saved", saved);
            return Ok(saved);
        }
        validate_filename(&filename)?;

        let mut output = persist.create(&filename).await?;
        let copied = copy_rows(link, &mut output).await;
        // Keep whatever arrived, even when the block was cut short
        let flushed = output.flush().await;
        let rows = copied?;
        flushed?;

        saved += 1;
        debug!("Saved {} ({} rows)", filename, rows);
    }
}

async fn copy_rows<L, W>(link: &mut L, output: &mut W) -> Result<usize>
where
    L: LineSource + ?Sized,
    W: AsyncWrite + Unpin + Send,
{
    output.write_all(CSV_HEADER.as_bytes()).await?;
    output.write_all(b"\n").await?;

    let mut rows = 0;
    loop {
        let line = link.read_line().await?;
        if line.is_empty() {
            return Ok(rows);
        }
        let record = decode_telemetry_line(&line)?;
        let mut row = record.to_csv_row();
        row.push('\n');
        output.write_all(row.as_bytes()).await?;
        rows += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::channel::mocks::ScriptedLink;

    const R1: &str = "100,21.5,40.2,08:06:55,4807.038N,01131.000W,138.3,1,8";
    const R2: &str = "600,21.6,40.0,08:06:56,4807.038N,01131.000W,138.1,0,0";

    fn read(dir: &Path, name: &str) -> String {
        std::fs::read_to_string(dir.join(name)).unwrap()
    }

    #[tokio::test]
    async fn test_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
        let mut link = ScriptedLink::new(vec!["f1", R1, R2, "", "f2", "", ""]);

        let saved = download(&mut link, &mut persist).await.unwrap();

        assert_eq!(saved, 2);
        assert_eq!(link.written(), vec![b"P".to_vec()]);
        assert_eq!(link.remaining(), 0);

        let f1 = read(dir.path(), "f1");
        let lines: Vec<&str> = f1.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        let cells: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(&cells[..4], &["100", "21.5", "40.2", "08:06:55"]);
        assert!((cells[4].parse::<f64>().unwrap() - 48.1173).abs() < 1e-4);
        assert!((cells[5].parse::<f64>().unwrap() + 11.5167).abs() < 1e-4);
        assert_eq!(&cells[6..], &["138.3", "GPS", "8"]);
        assert!(lines[2].ends_with(",No Fix,0"));

        assert_eq!(read(dir.path(), "f2"), format!("{}\n", CSV_HEADER));
    }

    #[tokio::test]
    async fn test_empty_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
        let mut link = ScriptedLink::new(vec!["", "leftover"]);

        assert_eq!(download(&mut link, &mut persist).await.unwrap(), 0);
        // Nothing is read past the terminating empty filename
        assert_eq!(link.remaining(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fault_mid_file_keeps_completed_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
        // The script ends inside f2, as a read timeout would
        let mut link = ScriptedLink::new(vec!["f1", R1, "", "f2", R2]);

        let result = download(&mut link, &mut persist).await;
        assert!(matches!(result, Err(LoggerLinkError::ChannelFault(_))));

        assert_eq!(read(dir.path(), "f1").lines().count(), 2);
        // The partial file is left behind with what arrived
        assert_eq!(read(dir.path(), "f2").lines().count(), 2);
    }

    #[tokio::test]
    async fn test_write_fault_sends_nothing_else() {
        let dir = tempfile::tempdir().unwrap();
        let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
        let mut link = ScriptedLink::new(vec!["f1"]);
        link.fail_writes();

        let result = download(&mut link, &mut persist).await;
        assert!(matches!(result, Err(LoggerLinkError::ChannelFault(_))));
        assert_eq!(link.remaining(), 1);
    }

    #[tokio::test]
    async fn test_malformed_row_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
        let mut link = ScriptedLink::new(vec!["f1", R1, "1,2,3", "", ""]);

        let result = download(&mut link, &mut persist).await;
        assert!(matches!(result, Err(LoggerLinkError::ProtocolDecode(_))));
        assert_eq!(read(dir.path(), "f1").lines().count(), 2);
    }

    #[tokio::test]
    async fn test_unsafe_filenames_rejected() {
        for name in ["../escape", "a/b", "..", "c:\\x"] {
            let dir = tempfile::tempdir().unwrap();
            let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
            let mut link = ScriptedLink::new(vec![name, "", ""]);

            let result = download(&mut link, &mut persist).await;
            assert!(
                matches!(result, Err(LoggerLinkError::ProtocolDecode(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_prepare_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b");
        let persist = DirectoryPersist::prepare(&target).await.unwrap();
        assert!(target.is_dir());
        assert_eq!(persist.root(), target.as_path());
    }

    #[tokio::test]
    async fn test_prepare_refuses_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = DirectoryPersist::prepare(file.path()).await;
        assert!(matches!(result, Err(LoggerLinkError::Io(_))));
    }

    #[tokio::test]
    async fn test_existing_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f1"), "stale content that is longer\n").unwrap();
        let mut persist = DirectoryPersist::prepare(dir.path()).await.unwrap();
        let mut link = ScriptedLink::new(vec!["f1", "", ""]);

        download(&mut link, &mut persist).await.unwrap();
        assert_eq!(read(dir.path(), "f1"), format!("{}\n", CSV_HEADER));
    }
}
