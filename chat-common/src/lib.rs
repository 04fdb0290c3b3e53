//! Chat Common - Shared types, configuration and wire formats for the local model chat services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types and handling utilities
//! - Logging setup
//! - Relay request types and the streaming data format shared by relay and client

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod wire;

pub use config::{
    Config, NetworkConfig, ObservabilityConfig, OllamaConfig, RelayConfig, StoreBackendKind,
    StoreConfig,
};
pub use error::{Error, Result};
pub use wire::{
    DataStreamDecoder, FinishInfo, LineBuffer, RelayData, RelayMessage, RelayRequest, StreamPart,
    Usage,
};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
}
