//! # Status Poller
//!
//! Requests a status update on a fixed cadence and republishes the latest
//! good one to observers.
//!
//! A failed tick publishes nothing, so observers keep the last good
//! [`StatusUpdate`] while the link is down. Ticks never wait for a
//! reconnect or for a download holding the channel.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::LoggerClient;
use crate::error::{LoggerLinkError, Result};
use crate::link::transport::Connector;
use crate::protocol::types::StatusUpdate;

/// Reference poll period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Periodic status poller
pub struct StatusPoller<C: Connector> {
    client: LoggerClient<C>,
    period: Duration,
    latest: watch::Sender<Option<StatusUpdate>>,
}

impl<C: Connector> StatusPoller<C> {
    pub fn new(client: LoggerClient<C>, period: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self { client, period, latest }
    }

    /// Observe published status updates
    ///
    /// Holds `None` until the first successful poll.
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusUpdate>> {
        self.latest.subscribe()
    }

    /// Last published update
    pub fn latest(&self) -> Option<StatusUpdate> {
        self.latest.borrow().clone()
    }

    /// Run a single poll and publish its result on success
    ///
    /// A tick that finds no connection asks the manager to start connecting
    /// again, so a reconnect policy that gave up is re-armed every period.
    ///
    /// # Errors
    ///
    /// Returns the tick's error; the published update is left unchanged.
    pub async fn tick(&self) -> Result<StatusUpdate> {
        let update = match self.client.try_status().await {
            Ok(update) => update,
            Err(LoggerLinkError::NoConnection) => {
                self.client.manager().ensure_connecting();
                return Err(LoggerLinkError::NoConnection);
            }
            Err(e) => return Err(e),
        };
        self.latest.send_replace(Some(update.clone()));
        Ok(update)
    }

    /// Poll until `shutdown` completes
    pub async fn run<F: Future<Output = ()>>(self, shutdown: F) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Polling logger status every {:?}", self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(update) => debug!(
                            "Status: taking_data={} files={} corrupted={}",
                            update.taking_data,
                            update.manifest.len(),
                            update.corrupted_file_count
                        ),
                        Err(LoggerLinkError::NoConnection) => debug!("Status poll skipped: not connected"),
                        Err(LoggerLinkError::ChannelBusy) => debug!("Status poll skipped: channel busy"),
                        Err(e) if e.is_link_fault() => info!("Status poll lost the link: {}", e),
                        Err(e) => warn!("Status poll failed: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Status poller stopping");
                    break;
                }
            }
        }
    }
}
