//! Medium Access Control (MAC) Layer
//!
//! Scheduler side of the PHY-MAC SAP. Only a round-robin reference scheduler
//! is provided; anything implementing [`interfaces::PhySapUser`] can take its
//! place in front of the slot engine.

pub mod scheduler;

pub use scheduler::{RoundRobinScheduler, SchedulerConfig, SchedulerStats};
