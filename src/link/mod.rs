//! # Logger Link Module
//!
//! Owns the one live connection to the data logger.
//!
//! This module handles:
//! - Connecting to the logger with a configurable reconnect policy
//! - Publishing the connection to consumers as a single atomic swap
//! - Tearing a faulted connection down and reconnecting in the background
//! - Line framing and the diagnostic byte log (see [`channel`], [`byte_log`])

pub mod byte_log;
pub mod channel;
pub mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{Config, ReconnectConfig};
use crate::error::{LoggerLinkError, Result};
use byte_log::ByteLog;
use channel::LineChannel;
use transport::{Connector, TcpConnector, Transport};

/// Line channel over the boxed logger stream
pub type LoggerChannel = LineChannel<Box<dyn Transport>>;

/// How hard to try when (re)connecting
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: (config.max_attempts > 0).then_some(config.max_attempts),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl ReconnectPolicy {
    /// Retry forever with no pause between attempts
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay)
    }
}

/// Everything the manager needs besides the connector
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub io_timeout: Duration,
    pub policy: ReconnectPolicy,
    pub always_reconnect: bool,
    pub byte_log_path: Option<PathBuf>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(3),
            policy: ReconnectPolicy::default(),
            always_reconnect: true,
            byte_log_path: None,
        }
    }
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            io_timeout: config.link.io_timeout(),
            policy: ReconnectPolicy::from(&config.reconnect),
            always_reconnect: config.reconnect.always_reconnect,
            byte_log_path: config
                .diagnostics
                .byte_log_enabled
                .then(|| PathBuf::from(&config.diagnostics.byte_log_path)),
        }
    }
}

/// One established connection
///
/// The channel sits behind an async mutex: whoever holds the guard is the
/// only reader/writer of the stream for the duration of an operation.
pub struct Connection {
    id: u64,
    peer: String,
    closed: Arc<AtomicBool>,
    channel: Mutex<LoggerChannel>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for exclusive use of the channel
    ///
    /// # Errors
    ///
    /// Returns `ChannelFault` if the connection was closed meanwhile.
    pub async fn lock(&self) -> Result<MutexGuard<'_, LoggerChannel>> {
        let guard = self.channel.lock().await;
        self.check_open()?;
        Ok(guard)
    }

    /// Take the channel only if nobody else holds it
    ///
    /// # Errors
    ///
    /// Returns `ChannelBusy` if another operation holds the channel.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, LoggerChannel>> {
        let guard = self.channel.try_lock().map_err(|_| LoggerLinkError::ChannelBusy)?;
        self.check_open()?;
        Ok(guard)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(LoggerLinkError::ChannelFault("connection closed".to_string()));
        }
        Ok(())
    }

    // An operation holding the channel sees the shared flag on its next
    // read or write; the stream itself drops with the connection.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut channel) = self.channel.try_lock() {
            channel.close();
        }
    }
}

/// Lifecycle of the logger connection
#[derive(Debug, Clone, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected(Arc<Connection>),
}

impl LinkState {
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Self::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

struct Inner<C> {
    connector: C,
    settings: ManagerSettings,
    state: watch::Sender<LinkState>,
    connect_lock: Mutex<()>,
    next_id: AtomicU64,
}

/// Connection manager for the data logger
///
/// Cheap to clone; clones share the same connection.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl ConnectionManager<TcpConnector> {
    /// Manager for the TCP endpoint named in the configuration
    pub fn from_config(config: &Config) -> Self {
        let connector = TcpConnector::new(
            config.link.host.clone(),
            config.link.port,
            config.link.connect_timeout(),
        );
        Self::new(connector, ManagerSettings::from(config))
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ManagerSettings) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                state,
                connect_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn peer(&self) -> String {
        self.inner.connector.peer()
    }

    /// Current state, cloned out of the publish cell
    pub fn state(&self) -> LinkState {
        self.inner.state.borrow().clone()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the published connection, if any
    pub fn snapshot(&self) -> Option<Arc<Connection>> {
        self.inner.state.borrow().connection().cloned()
    }

    /// The published connection
    ///
    /// # Errors
    ///
    /// Returns `NoConnection` without attempting any I/O when none is held.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.snapshot().ok_or(LoggerLinkError::NoConnection)
    }

    /// Connect, retrying per the reconnect policy
    ///
    /// Returns the already published connection if there is one. Concurrent
    /// callers are serialized, so only one connection is ever live.
    ///
    /// # Errors
    ///
    /// Returns `ReconnectExhausted` when a bounded policy runs out of
    /// attempts. An unbounded policy never returns an error.
    pub async fn acquire(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.snapshot() {
            return Ok(conn);
        }

        let _connecting = self.inner.connect_lock.lock().await;
        if let Some(conn) = self.snapshot() {
            return Ok(conn);
        }

        self.inner.state.send_replace(LinkState::Connecting);
        let mut guard = ConnectingGuard { state: &self.inner.state, armed: true };

        let policy = &self.inner.settings.policy;
        let peer = self.peer();
        let mut attempts: u32 = 0;
        let mut delay = policy.initial_delay;

        loop {
            attempts = attempts.saturating_add(1);
            match self.inner.connector.connect().await {
                Ok(transport) => {
                    let conn = self.build_connection(transport, &peer).await;
                    guard.armed = false;
                    self.inner.state.send_replace(LinkState::Connected(Arc::clone(&conn)));
                    info!("Connected to data logger at {} (attempt {})", peer, attempts);
                    return Ok(conn);
                }
                Err(e) => {
                    debug!("Connection attempt {} to {} failed: {}", attempts, peer, e);
                    if policy.exhausted(attempts) {
                        warn!("Giving up on {} after {} attempts", peer, attempts);
                        return Err(LoggerLinkError::ReconnectExhausted { peer, attempts });
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                    delay = policy.next_delay(delay);
                }
            }
        }
    }

    // Fully builds the connection before anyone can see it
    async fn build_connection(&self, transport: Box<dyn Transport>, peer: &str) -> Arc<Connection> {
        let closed = Arc::new(AtomicBool::new(false));
        let mut channel = LineChannel::new(transport, self.inner.settings.io_timeout)
            .with_close_signal(Arc::clone(&closed));
        if let Some(path) = &self.inner.settings.byte_log_path {
            channel = channel.with_byte_log(ByteLog::open(path).await);
        }

        Arc::new(Connection {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            peer: peer.to_string(),
            closed,
            channel: Mutex::new(channel),
        })
    }

    /// Start connecting in the background
    ///
    /// Does nothing outside a tokio runtime.
    pub fn connect_in_background(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; not reconnecting to {}", self.peer());
            return;
        };
        let manager = self.clone();
        handle.spawn(async move {
            if let Err(e) = manager.acquire().await {
                warn!("Background connect failed: {}", e);
            }
        });
    }

    /// Start a background connect if the link is down and reconnecting is on
    ///
    /// Lets periodic callers recover after a bounded policy gave up.
    /// Does nothing while connected or while an attempt is running.
    pub fn ensure_connecting(&self) {
        if self.inner.settings.always_reconnect
            && matches!(*self.inner.state.borrow(), LinkState::Disconnected)
        {
            self.connect_in_background();
        }
    }

    /// Close a connection and forget it
    ///
    /// Only the currently published connection is unpublished; releasing a
    /// stale handle just closes it. With `always_reconnect`, a new
    /// connection attempt starts in the background.
    pub fn release(&self, conn: &Arc<Connection>) {
        let unpublished = self.inner.state.send_if_modified(|state| match state {
            LinkState::Connected(current) if Arc::ptr_eq(current, conn) => {
                *state = LinkState::Disconnected;
                true
            }
            _ => false,
        });
        conn.close();

        if unpublished {
            info!("Disconnected from data logger at {} (connection {})", conn.peer(), conn.id());
            if self.inner.settings.always_reconnect {
                self.connect_in_background();
            }
        }
    }

    /// Close the published connection without reconnecting
    pub fn shutdown(&self) {
        let previous = self.inner.state.send_replace(LinkState::Disconnected);
        if let LinkState::Connected(conn) = previous {
            conn.close();
            info!("Closed connection to data logger at {}", conn.peer());
        }
    }
}

// Resets Connecting to Disconnected if acquire() fails or is cancelled
struct ConnectingGuard<'a> {
    state: &'a watch::Sender<LinkState>,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_if_modified(|state| {
                if matches!(state, LinkState::Connecting) {
                    *state = LinkState::Disconnected;
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::channel::{LineSink, LineSource};
    use super::transport::MockConnector;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn settings(policy: ReconnectPolicy, always_reconnect: bool) -> ManagerSettings {
        ManagerSettings {
            io_timeout: Duration::from_secs(3),
            policy,
            always_reconnect,
            byte_log_path: None,
        }
    }

    fn bounded(attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: Some(attempts),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
        }
    }

    fn refused() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
    }

    /// Connector whose peers are kept so tests can talk to the client side
    fn duplex_connector(peers: Arc<std::sync::Mutex<Vec<DuplexStream>>>) -> MockConnector {
        let mut connector = MockConnector::new();
        connector.expect_peer().returning(|| "logger:123".to_string());
        connector.expect_connect().returning(move || {
            let (client, server) = tokio::io::duplex(1024);
            peers.lock().unwrap().push(server);
            Ok(Box::new(client) as Box<dyn Transport>)
        });
        connector
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(5));

        let config = ReconnectConfig { max_attempts: 3, ..ReconnectConfig::default() };
        assert_eq!(ReconnectPolicy::from(&config).max_attempts, Some(3));
    }

    #[test]
    fn test_policy_backoff_is_capped() {
        let policy = bounded(10);
        let mut delay = policy.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(delay.as_millis());
            delay = policy.next_delay(delay);
        }
        assert_eq!(seen, vec![10, 20, 40, 40]);
    }

    #[test]
    fn test_policy_exhaustion() {
        assert!(!ReconnectPolicy::immediate().exhausted(u32::MAX));
        assert!(!bounded(3).exhausted(2));
        assert!(bounded(3).exhausted(3));
    }

    #[tokio::test]
    async fn test_no_connection_before_acquire() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(connector, settings(bounded(1), false));
        assert!(matches!(manager.connection(), Err(LoggerLinkError::NoConnection)));
        assert!(matches!(manager.state(), LinkState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_never_yield_a_connection() {
        let mut connector = MockConnector::new();
        connector.expect_peer().returning(|| "logger:123".to_string());
        connector.expect_connect().times(3).returning(|| Err(refused()));

        let manager = ConnectionManager::new(connector, settings(bounded(3), false));
        match manager.acquire().await {
            Err(LoggerLinkError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected ReconnectExhausted, got: {:?}", other),
        }
        assert!(manager.snapshot().is_none());
        assert!(matches!(manager.state(), LinkState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut connector = MockConnector::new();
        connector.expect_peer().returning(|| "logger:123".to_string());
        connector.expect_connect().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                Err(refused())
            } else {
                let (client, _server) = tokio::io::duplex(64);
                Ok(Box::new(client) as Box<dyn Transport>)
            }
        });

        let manager = ConnectionManager::new(connector, settings(ReconnectPolicy::immediate(), false));
        let conn = manager.acquire().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(Arc::ptr_eq(&conn, &manager.connection().unwrap()));
        assert!(manager.state().is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_yields_one_connection() {
        let mut connector = MockConnector::new();
        connector.expect_peer().returning(|| "logger:123".to_string());
        connector.expect_connect().times(1).returning(|| {
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client) as Box<dyn Transport>)
        });

        let manager = ConnectionManager::new(connector, settings(ReconnectPolicy::immediate(), false));
        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn test_release_closes_and_unpublishes() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), false),
        );

        let conn = manager.acquire().await.unwrap();
        manager.release(&conn);

        assert!(conn.is_closed());
        assert!(matches!(conn.lock().await, Err(LoggerLinkError::ChannelFault(_))));
        assert!(matches!(manager.connection(), Err(LoggerLinkError::NoConnection)));
    }

    #[tokio::test]
    async fn test_release_of_stale_handle_keeps_current() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), false),
        );

        let old = manager.acquire().await.unwrap();
        manager.release(&old);
        let current = manager.acquire().await.unwrap();
        assert_ne!(old.id(), current.id());

        manager.release(&old);
        assert!(Arc::ptr_eq(&manager.connection().unwrap(), &current));
    }

    #[tokio::test]
    async fn test_release_reconnects_in_background() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), true),
        );
        let mut states = manager.subscribe();

        let first = manager.acquire().await.unwrap();
        manager.release(&first);

        let second = loop {
            if let Some(conn) = states.borrow_and_update().connection().cloned() {
                break conn;
            }
            states.changed().await.unwrap();
        };
        assert_ne!(first.id(), second.id());
        assert_eq!(peers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_connecting_respects_settings() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), false),
        );
        manager.ensure_connecting();
        tokio::task::yield_now().await;
        assert!(peers.lock().unwrap().is_empty());
        assert!(matches!(manager.state(), LinkState::Disconnected));
    }

    #[tokio::test]
    async fn test_connection_channel_round_trip() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), false),
        );
        let conn = manager.acquire().await.unwrap();
        let mut server = peers.lock().unwrap().pop().unwrap();

        server.write_all(b"hello\r\n").await.unwrap();
        let mut channel = conn.lock().await.unwrap();
        assert_eq!(channel.read_line().await.unwrap(), "hello");
        channel.write_all(b"U").await.unwrap();
    }

    #[tokio::test]
    async fn test_try_lock_reports_busy() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), false),
        );
        let conn = manager.acquire().await.unwrap();

        let held = conn.lock().await.unwrap();
        assert!(matches!(conn.try_lock(), Err(LoggerLinkError::ChannelBusy)));
        drop(held);
        assert!(conn.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), true),
        );
        let conn = manager.acquire().await.unwrap();
        manager.shutdown();

        assert!(conn.is_closed());
        assert!(manager.snapshot().is_none());
        // Shutdown never triggers a reconnect
        tokio::task::yield_now().await;
        assert_eq!(peers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_an_operation_holding_the_channel() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            duplex_connector(Arc::clone(&peers)),
            settings(ReconnectPolicy::immediate(), false),
        );
        let conn = manager.acquire().await.unwrap();
        let mut server = peers.lock().unwrap().pop().unwrap();
        server.write_all(b"f1\nrow\nrow\n").await.unwrap();

        let mut channel = conn.lock().await.unwrap();
        assert_eq!(channel.read_line().await.unwrap(), "f1");

        manager.shutdown();
        assert!(matches!(channel.read_line().await, Err(LoggerLinkError::ChannelFault(_))));
        assert!(matches!(channel.write_all(b"U").await, Err(LoggerLinkError::ChannelFault(_))));
    }

    #[tokio::test]
    async fn test_byte_log_attached_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut settings = settings(ReconnectPolicy::immediate(), false);
        settings.byte_log_path = Some(path.clone());

        let manager = ConnectionManager::new(duplex_connector(Arc::clone(&peers)), settings);
        let conn = manager.acquire().await.unwrap();
        let mut server = peers.lock().unwrap().pop().unwrap();

        server.write_all(b"/T0\n").await.unwrap();
        conn.lock().await.unwrap().read_line().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"/T0\n");
    }
}
