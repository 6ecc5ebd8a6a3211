//! PHY Collaborator Interfaces Library
//!
//! This crate defines what the slot engine exchanges with its collaborators:
//! the scheduler SAPs, channel access managers, error models and the message
//! types that flow between them.

pub mod channel_access;
pub mod error_model;
pub mod message_types;
pub mod sap;

pub use channel_access::{AccessResponse, AlwaysOnAccessManager, BackoffAccessManager, ChannelAccessManager};
pub use error_model::{ErrorModel, ErrorModelOutput, FixedTblerErrorModel, SinrThresholdErrorModel};
pub use message_types::*;
pub use sap::{PhySapProvider, PhySapUser};
