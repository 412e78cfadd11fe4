//! # Logger Line Decoder
//!
//! Decodes telemetry lines and status updates.
//!
//! A status answer is one telemetry line, any number of (filename, duration)
//! line pairs, and a sentinel line starting with `/`:
//!
//! ```text
//! 100,21.5,40.2,08:06:55,4807.038N,01131.000W,138.3,1,8
//! fileA
//! 64
//! /T0
//! ```

use super::types::*;
use crate::error::{LoggerLinkError, Result};
use crate::link::channel::LineSource;

fn decode_error(msg: String) -> LoggerLinkError {
    LoggerLinkError::ProtocolDecode(msg)
}

/// Parse a packed NMEA-style coordinate such as `4807.038N`
///
/// The trailing letter is the hemisphere; the number is `DDDMM.MMMM`
/// (whole degrees times 100 plus decimal minutes). South and west are
/// negative.
///
/// Any other letter, such as the placeholder sent before a first fix,
/// leaves the value positive.
///
/// # Errors
///
/// Returns `ProtocolDecode` if the cell is empty or the number does not
/// parse.
pub fn parse_coordinate(cell: &str) -> Result<f64> {
    let cell = cell.trim();
    let mut chars = cell.chars();
    let hemisphere = chars
        .next_back()
        .ok_or_else(|| decode_error("empty coordinate".to_string()))?;
    let negative = matches!(hemisphere, 'S' | 'W');

    let packed: f64 = chars
        .as_str()
        .parse()
        .map_err(|_| decode_error(format!("invalid coordinate: {:?}", cell)))?;
    if !packed.is_finite() {
        return Err(decode_error(format!("invalid coordinate: {:?}", cell)));
    }

    let degrees = (packed / 100.0).trunc();
    let minutes = packed - degrees * 100.0;
    let value = degrees + minutes / 60.0;

    Ok(if negative { -value } else { value })
}

fn parse_cell<T: std::str::FromStr>(cell: &str, name: &str) -> Result<T> {
    cell.trim()
        .parse()
        .map_err(|_| decode_error(format!("invalid {}: {:?}", name, cell)))
}

/// Decode one comma-separated telemetry line
///
/// Cells, in order: boardtime, temp, humidity, timestamp, lat, lon,
/// altitude, fixtype (0-2), satellites.
///
/// # Errors
///
/// Returns `ProtocolDecode` on a wrong cell count, a non-numeric cell, an
/// unknown fixtype code or an unparsable coordinate. Nothing is returned
/// on failure, so no partially decoded record can leak.
///
/// # Examples
///
/// ```
/// use logger_link::protocol::decoder::decode_telemetry_line;
///
/// let record = decode_telemetry_line("100,21.5,40.2,08:06:55,4807.038N,01131.000W,138.3,1,8")?;
/// assert_eq!(record.satellites, 8);
/// # Ok::<(), logger_link::error::LoggerLinkError>(())
/// ```
pub fn decode_telemetry_line(line: &str) -> Result<TelemetryRecord> {
    let cells: Vec<&str> = line.split(',').collect();
    if cells.len() != TELEMETRY_CELL_COUNT {
        return Err(decode_error(format!(
            "expected {} cells in telemetry line, got {}: {:?}",
            TELEMETRY_CELL_COUNT,
            cells.len(),
            line
        )));
    }

    let code: u8 = parse_cell(cells[7], "fixtype")?;
    let fix_type = FixType::from_code(code)
        .ok_or_else(|| decode_error(format!("unknown fixtype code {}", code)))?;

    Ok(TelemetryRecord {
        boardtime: parse_cell(cells[0], "boardtime")?,
        temperature: parse_cell(cells[1], "temperature")?,
        humidity: parse_cell(cells[2], "humidity")?,
        timestamp: cells[3].to_string(),
        latitude: parse_coordinate(cells[4])?,
        longitude: parse_coordinate(cells[5])?,
        altitude: parse_cell(cells[6], "altitude")?,
        fix_type,
        satellites: parse_cell(cells[8], "satellites")?,
    })
}

/// A line of the manifest section, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    /// `/<flag><count>` - end of the status answer
    Sentinel { taking_data: bool, corrupted_file_count: u32 },
    /// Anything else names a stored file; its duration follows
    Filename(String),
}

/// Classify a line read where a manifest entry or the sentinel may appear
pub fn classify_status_line(line: &str) -> Result<StatusLine> {
    if let Some(rest) = line.strip_prefix(SENTINEL_PREFIX) {
        let mut chars = rest.chars();
        let flag = chars
            .next()
            .ok_or_else(|| decode_error("sentinel line has no taking-data flag".to_string()))?;
        let corrupted_file_count = parse_cell(chars.as_str(), "corrupted file count")?;
        return Ok(StatusLine::Sentinel {
            taking_data: flag == SENTINEL_TAKING_DATA,
            corrupted_file_count,
        });
    }

    if line.is_empty() {
        return Err(decode_error("empty line where a filename or sentinel was expected".to_string()));
    }

    Ok(StatusLine::Filename(line.to_string()))
}

#[derive(Debug)]
enum DecodeState {
    ExpectTelemetry,
    ExpectEntryOrSentinel(TelemetryRecord),
    ExpectDuration(TelemetryRecord, String),
    Done,
}

/// Incremental status decoder
///
/// Feed one line at a time. The decoded manifest is held privately until
/// the sentinel arrives; callers only ever see a complete [`StatusUpdate`].
#[derive(Debug)]
pub struct StatusDecoder {
    state: DecodeState,
    manifest: Vec<ManifestEntry>,
}

impl Default for StatusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ExpectTelemetry,
            manifest: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecodeState::Done)
    }

    /// Feed the next line
    ///
    /// Returns `Ok(Some(update))` once the sentinel line completes the
    /// answer, `Ok(None)` while more lines are needed.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolDecode` on a grammar violation. The decoder is then
    /// finished and must be discarded.
    pub fn feed(&mut self, line: &str) -> Result<Option<StatusUpdate>> {
        let state = std::mem::replace(&mut self.state, DecodeState::Done);
        match state {
            DecodeState::ExpectTelemetry => {
                let telemetry = decode_telemetry_line(line)?;
                self.state = DecodeState::ExpectEntryOrSentinel(telemetry);
                Ok(None)
            }
            DecodeState::ExpectEntryOrSentinel(telemetry) => match classify_status_line(line)? {
                StatusLine::Sentinel { taking_data, corrupted_file_count } => Ok(Some(StatusUpdate {
                    taking_data,
                    corrupted_file_count,
                    telemetry,
                    manifest: std::mem::take(&mut self.manifest),
                })),
                StatusLine::Filename(filename) => {
                    self.state = DecodeState::ExpectDuration(telemetry, filename);
                    Ok(None)
                }
            },
            DecodeState::ExpectDuration(telemetry, filename) => {
                let duration_seconds = parse_cell(line, "duration")?;
                self.manifest.push(ManifestEntry { filename, duration_seconds });
                self.state = DecodeState::ExpectEntryOrSentinel(telemetry);
                Ok(None)
            }
            DecodeState::Done => Err(decode_error("status answer already complete".to_string())),
        }
    }
}

/// Read and decode one complete status answer from a line source
///
/// # Errors
///
/// - `ChannelFault` if the source fails mid-answer
/// - `ProtocolDecode` on any grammar violation
pub async fn decode_status<S: LineSource + ?Sized>(source: &mut S) -> Result<StatusUpdate> {
    let mut decoder = StatusDecoder::new();
    loop {
        let line = source.read_line().await?;
        if let Some(update) = decoder.feed(&line)? {
            return Ok(update);
        }
    }
}
