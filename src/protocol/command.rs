//! # Command Encoder
//!
//! Encodes control commands into the bytes the logger expects.
//!
//! Commands carry no framing, checksum or acknowledgement: a single ASCII
//! control byte, optionally followed by a UTF-8 payload and LF.

use super::types::*;
use crate::error::{LoggerLinkError, Result};
use crate::link::channel::LineSink;
use tracing::debug;

/// A control command for the data logger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `U` - request a status update
    Status,
    /// `S` - stop the active logging session
    StopLogging,
    /// `T<name>\n` - start logging to `name`
    StartLogging(String),
    /// `F` - format on-device storage
    Format,
    /// `P` - begin the bulk file download
    Download,
}

impl Command {
    /// Build a start-logging command from a user-supplied file name
    ///
    /// Surrounding whitespace is trimmed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCommand` if the trimmed name is empty or contains a
    /// line break.
    pub fn start_logging(name: &str) -> Result<Self> {
        let name = name.trim();
        validate_log_name(name)?;
        Ok(Self::StartLogging(name.to_string()))
    }

    /// The leading control byte
    pub fn control_byte(&self) -> u8 {
        match self {
            Self::Status => CMD_STATUS,
            Self::StopLogging => CMD_STOP_LOGGING,
            Self::StartLogging(_) => CMD_START_LOGGING,
            Self::Format => CMD_FORMAT,
            Self::Download => CMD_DOWNLOAD,
        }
    }
}

fn validate_log_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LoggerLinkError::InvalidCommand("log file name is empty".to_string()));
    }
    if name.contains(['\n', '\r']) {
        return Err(LoggerLinkError::InvalidCommand(
            format!("log file name contains a line break: {:?}", name)
        ));
    }
    Ok(())
}

/// Encode a command into its wire bytes
///
/// # Examples
///
/// ```
/// use logger_link::protocol::command::{encode_command, Command};
///
/// assert_eq!(encode_command(&Command::Status).unwrap(), b"U");
/// let start = Command::start_logging(" run-1 ").unwrap();
/// assert_eq!(encode_command(&start).unwrap(), b"Trun-1\n");
/// ```
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    match command {
        Command::StartLogging(name) => {
            validate_log_name(name)?;
            let mut bytes = Vec::with_capacity(name.len() + 2);
            bytes.push(CMD_START_LOGGING);
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(LINE_TERMINATOR);
            Ok(bytes)
        }
        other => Ok(vec![other.control_byte()]),
    }
}

/// Encode a command and write it to the link in one write
///
/// A short write is reported by the sink as a channel fault.
pub async fn send_command<S: LineSink + ?Sized>(sink: &mut S, command: &Command) -> Result<()> {
    let bytes = encode_command(command)?;
    sink.write_all(&bytes).await?;
    debug!("Sent command {:?} ({} bytes)", command.control_byte() as char, bytes.len());
    Ok(())
}
