//! # Logger Link Library
//!
//! Monitor and control a WiFi field data logger over its TCP line protocol.
//!
//! This library provides the connection manager, command sender, status
//! decoder, bulk download and status poller used by the `logger-link` tool.

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod link;
pub mod poller;
pub mod protocol;
