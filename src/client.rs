//! # Logger Client
//!
//! Commands, status requests and downloads over the managed connection.
//!
//! Every operation takes one snapshot of the published connection, holds
//! its channel for the whole exchange, and hands the connection back to
//! the manager for teardown when the exchange faults.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::download::{self, DirectoryPersist, Persist};
use crate::error::{LoggerLinkError, Result};
use crate::link::transport::Connector;
use crate::link::{Connection, ConnectionManager};
use crate::protocol::command::{send_command, Command};
use crate::protocol::decoder::decode_status;
use crate::protocol::types::StatusUpdate;

/// Supervising-side handle to the data logger
pub struct LoggerClient<C: Connector> {
    manager: ConnectionManager<C>,
}

impl<C: Connector> Clone for LoggerClient<C> {
    fn clone(&self) -> Self {
        Self { manager: self.manager.clone() }
    }
}

impl<C: Connector> LoggerClient<C> {
    pub fn new(manager: ConnectionManager<C>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Send one command
    ///
    /// # Errors
    ///
    /// - `NoConnection` if no connection is held (no I/O is attempted)
    /// - `ChannelFault` on timeout or short write; the connection is released
    pub async fn send(&self, command: &Command) -> Result<()> {
        let conn = self.manager.connection()?;
        let result = async {
            let mut channel = conn.lock().await?;
            send_command(&mut *channel, command).await
        }
        .await;
        self.settle(&conn, result)
    }

    /// Request and decode one status update, waiting for the channel
    pub async fn status(&self) -> Result<StatusUpdate> {
        let conn = self.manager.connection()?;
        let result = async {
            let mut channel = conn.lock().await?;
            send_command(&mut *channel, &Command::Status).await?;
            decode_status(&mut *channel).await
        }
        .await;
        self.settle(&conn, result)
    }

    /// Request one status update only if the channel is free right now
    ///
    /// # Errors
    ///
    /// Returns `ChannelBusy` (without releasing anything) when another
    /// operation, such as a download, holds the channel.
    pub async fn try_status(&self) -> Result<StatusUpdate> {
        let conn = self.manager.connection()?;
        let result = async {
            let mut channel = conn.try_lock()?;
            send_command(&mut *channel, &Command::Status).await?;
            decode_status(&mut *channel).await
        }
        .await;
        self.settle(&conn, result)
    }

    /// `T<name>\n`: start logging to `name` (trimmed)
    pub async fn start_logging(&self, name: &str) -> Result<()> {
        let command = Command::start_logging(name)?;
        self.send(&command).await
    }

    /// `S`: stop the active logging session
    pub async fn stop_logging(&self) -> Result<()> {
        self.send(&Command::StopLogging).await
    }

    /// `F`: erase all files on the logger
    pub async fn format_storage(&self) -> Result<()> {
        self.send(&Command::Format).await
    }

    /// Download every stored file through `persist`
    ///
    /// Holds the channel for the whole session, so no status poll can
    /// interleave with the stream.
    pub async fn download_with<P: Persist>(&self, persist: &mut P) -> Result<usize> {
        let conn = self.manager.connection()?;
        let result = async {
            let mut channel = conn.lock().await?;
            download::download(&mut *channel, persist).await
        }
        .await;
        self.settle(&conn, result)
    }

    /// Download every stored file into `dir`, creating it if needed
    pub async fn download_to<P: AsRef<Path>>(&self, dir: P) -> Result<usize> {
        let mut persist = DirectoryPersist::prepare(dir).await?;
        let saved = self.download_with(&mut persist).await?;
        info!("{} file(s) downloaded to {}", saved, persist.root().display());
        Ok(saved)
    }

    fn settle<T>(&self, conn: &Arc<Connection>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.tears_down_link() {
                warn!("Dropping connection {} after error: {}", conn.id(), e);
                self.manager.release(conn);
            }
        }
        result
    }
}
