//! # Line Channel
//!
//! LF-delimited text lines over a byte stream, with bounded waits.

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::byte_log::ByteLog;
use crate::error::{LoggerLinkError, Result};

/// Longest line accepted before the stream is declared desynchronized
pub const MAX_LINE_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 512;

/// Source of decoded protocol lines
#[async_trait]
pub trait LineSource: Send {
    /// Read the next line, without its terminator
    ///
    /// An empty string is a valid line (a bare LF).
    async fn read_line(&mut self) -> Result<String>;
}

/// Sink for raw command bytes
#[async_trait]
pub trait LineSink: Send {
    /// Write the whole payload in one write; anything less is a fault
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
}

fn fault(msg: impl Into<String>) -> LoggerLinkError {
    LoggerLinkError::ChannelFault(msg.into())
}

/// Line framing over an async byte stream
///
/// CR bytes are dropped wherever they appear; LF ends a line. Every
/// received chunk is copied to the optional [`ByteLog`] before it is
/// interpreted.
///
/// A shared close signal lets the owner of the connection stop a channel
/// that another task is using: the next read or write after the signal
/// is raised fails, even if complete lines are still buffered.
pub struct LineChannel<T> {
    io: Option<T>,
    buf: BytesMut,
    io_timeout: Duration,
    byte_log: Option<ByteLog>,
    closed: Arc<AtomicBool>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> std::fmt::Debug for LineChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("open", &self.is_open())
            .field("buffered", &self.buf.len())
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineChannel<T> {
    pub fn new(io: T, io_timeout: Duration) -> Self {
        Self {
            io: Some(io),
            buf: BytesMut::with_capacity(READ_CHUNK),
            io_timeout,
            byte_log: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a close signal with the channel's owner
    pub fn with_close_signal(mut self, closed: Arc<AtomicBool>) -> Self {
        self.closed = closed;
        self
    }

    /// Attach a diagnostic byte log
    pub fn with_byte_log(mut self, byte_log: ByteLog) -> Self {
        self.byte_log = Some(byte_log);
        self
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some() && !self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(fault("channel closed"))
        }
    }

    /// Drop the underlying stream immediately
    ///
    /// Later reads and writes fail with a channel fault.
    pub fn close(&mut self) {
        self.io = None;
        self.buf.clear();
    }

    fn take_line(&mut self) -> Option<Result<String>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw = self.buf.split_to(pos + 1);
        let content: Vec<u8> = raw[..pos].iter().copied().filter(|&b| b != b'\r').collect();
        Some(String::from_utf8(content).map_err(|e| {
            LoggerLinkError::ProtocolDecode(format!("line is not valid UTF-8: {}", e))
        }))
    }

    async fn fill(&mut self) -> Result<()> {
        let io = self.io.as_mut().ok_or_else(|| fault("channel closed"))?;
        self.buf.reserve(READ_CHUNK);
        let start = self.buf.len();

        let n = timeout(self.io_timeout, io.read_buf(&mut self.buf))
            .await
            .map_err(|_| fault(format!("read timed out after {:?}", self.io_timeout)))?
            .map_err(|e| fault(format!("read failed: {}", e)))?;

        if n == 0 {
            return Err(fault("peer closed connection"));
        }

        if let Some(log) = self.byte_log.as_mut() {
            log.record(&self.buf[start..]).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineSource for LineChannel<T> {
    async fn read_line(&mut self) -> Result<String> {
        loop {
            self.ensure_open()?;
            if let Some(line) = self.take_line() {
                return line;
            }
            if self.buf.len() > MAX_LINE_LEN {
                self.buf.clear();
                return Err(LoggerLinkError::ProtocolDecode(
                    format!("line exceeds {} bytes without a terminator", MAX_LINE_LEN)
                ));
            }
            self.fill().await?;
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineSink for LineChannel<T> {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let io_timeout = self.io_timeout;
        let io = self.io.as_mut().ok_or_else(|| fault("channel closed"))?;

        let sent = timeout(io_timeout, async {
            let sent = io.write(bytes).await?;
            io.flush().await?;
            Ok::<_, std::io::Error>(sent)
        })
        .await
        .map_err(|_| fault(format!("write timed out after {:?}", io_timeout)))?
        .map_err(|e| fault(format!("write failed: {}", e)))?;

        if sent != bytes.len() {
            return Err(fault(format!("short write: {} of {} bytes accepted", sent, bytes.len())));
        }
        Ok(())
    }
}
