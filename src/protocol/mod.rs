//! # Logger Protocol
//!
//! Wire format of the data logger's line protocol.
//!
//! - Single-byte commands, with `T` followed by a newline-terminated name
//! - Status responses: one telemetry line, the file manifest, then a sentinel
//! - Download stream: filename blocks of telemetry lines

pub mod command;
pub mod decoder;
pub mod types;

pub use command::{encode_command, send_command, Command};
pub use decoder::{decode_status, decode_telemetry_line, StatusDecoder};
pub use types::{FixType, ManifestEntry, StatusUpdate, TelemetryRecord};
