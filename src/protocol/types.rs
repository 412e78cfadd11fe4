//! # Logger Protocol Constants and Types
//!
//! Core definitions shared by the status and download grammars.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LoggerLinkError, Result};

/// Request a status update
pub const CMD_STATUS: u8 = b'U';

/// Stop the active logging session
pub const CMD_STOP_LOGGING: u8 = b'S';

/// Start logging to a named file (followed by the name and LF)
pub const CMD_START_LOGGING: u8 = b'T';

/// Format (erase) on-device storage
pub const CMD_FORMAT: u8 = b'F';

/// Begin the bulk file download
pub const CMD_DOWNLOAD: u8 = b'P';

/// Line terminator
pub const LINE_TERMINATOR: u8 = b'\n';

/// Prefix of the status sentinel line
pub const SENTINEL_PREFIX: char = '/';

/// Sentinel flag character meaning "taking data"
pub const SENTINEL_TAKING_DATA: char = 'T';

/// Number of comma-separated cells in a telemetry line
pub const TELEMETRY_CELL_COUNT: usize = 9;

/// Header row of every persisted download file
pub const CSV_HEADER: &str = "boardtime,temp,humidity,timestamp,lat,lon,altitude,fixtype,satellites";

/// GPS fix quality reported by the logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FixType {
    #[serde(rename = "No Fix")]
    NoFix,
    #[serde(rename = "GPS")]
    Gps,
    #[serde(rename = "DGPS")]
    Dgps,
}

impl FixType {
    /// Map the device's integer code (0, 1, 2) to a fix type
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NoFix),
            1 => Some(Self::Gps),
            2 => Some(Self::Dgps),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::NoFix => 0,
            Self::Gps => 1,
            Self::Dgps => 2,
        }
    }

    /// Display string, as written into persisted CSV files
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoFix => "No Fix",
            Self::Gps => "GPS",
            Self::Dgps => "DGPS",
        }
    }
}

impl fmt::Display for FixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixType {
    type Err = LoggerLinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "No Fix" => Ok(Self::NoFix),
            "GPS" => Ok(Self::Gps),
            "DGPS" => Ok(Self::Dgps),
            other => Err(LoggerLinkError::ProtocolDecode(format!("unknown fix type: {:?}", other))),
        }
    }
}

/// One decoded telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Milliseconds since device boot
    pub boardtime: u64,

    /// Temperature in °C
    pub temperature: f64,

    /// Relative humidity in %
    pub humidity: f64,

    /// Wall-clock time of day, "HH:MM:SS", as sent by the device
    pub timestamp: String,

    /// Signed decimal degrees (south negative)
    pub latitude: f64,

    /// Signed decimal degrees (west negative)
    pub longitude: f64,

    /// Altitude in meters
    pub altitude: f64,

    /// GPS fix quality
    pub fix_type: FixType,

    /// Satellites in view
    pub satellites: u32,
}

// Whole numbers keep their fractional part ("21.0", not "21")
fn csv_float(value: f64) -> String {
    format!("{:?}", value)
}

impl TelemetryRecord {
    /// Render as one CSV row matching [`CSV_HEADER`] (no terminator)
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.boardtime,
            csv_float(self.temperature),
            csv_float(self.humidity),
            self.timestamp,
            csv_float(self.latitude),
            csv_float(self.longitude),
            csv_float(self.altitude),
            self.fix_type,
            self.satellites,
        )
    }
}

/// A file stored on the logger, as listed in a status update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub duration_seconds: u64,
}

impl ManifestEntry {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.duration_seconds / 3600;
        let minutes = (self.duration_seconds / 60) % 60;
        let seconds = self.duration_seconds % 60;
        write!(f, "{} - {}:{:02}:{:02}", self.filename, hours, minutes, seconds)
    }
}

/// One complete answer to a status request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub taking_data: bool,
    pub corrupted_file_count: u32,
    pub telemetry: TelemetryRecord,
    /// Device report order
    pub manifest: Vec<ManifestEntry>,
}
