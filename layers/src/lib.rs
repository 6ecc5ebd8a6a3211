//! Protocol Stack Layers Library
//!
//! This crate implements the NR slot engine, the half-duplex receiver, a
//! reference scheduler and the discrete-event simulation that wires them
//! together.

pub mod phy;
pub mod mac;
pub mod sim;

use common::{ConfigError, ProtocolViolation};
use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(usize),
}
