//! Common Utilities and Types Library
//!
//! This crate provides the identifiers, slot addressing, event queue and
//! error types shared by the slot engine and the receiver.

pub mod error;
pub mod event;
pub mod sfn;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use error::{ConfigError, ProtocolViolation};
pub use event::{EventId, EventQueue};
pub use sfn::SlotAddress;
pub use types::*;
pub use utils::*;
