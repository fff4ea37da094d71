//! Nerdcam - live camera relay
//!
//! This library crate exposes the relay engine and HTTP server for
//! integration testing.

pub mod config;
pub mod events;
pub mod server;
pub mod streaming;
