//! Core types, config, errors, and session state model for Voice Relay.

pub mod config;
pub mod error;
pub mod session;
