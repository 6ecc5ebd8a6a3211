//! Shared Error Types
//!
//! Configuration errors are raised before a cell starts; protocol violations
//! abort a running simulation because they indicate a broken timing invariant.

use thiserror::Error;

/// Errors detected while validating or compiling a configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid numerology {0} (valid values are 0-5)")]
    InvalidNumerology(u8),

    #[error("Numerology mismatch: {0} vs {1}")]
    NumerologyMismatch(u8, u8),

    #[error("Invalid slot address {frame}/{subframe}/{slot} for numerology {numerology}")]
    InvalidSlotAddress {
        frame: u32,
        subframe: u8,
        slot: u8,
        numerology: u8,
    },

    #[error("Pattern type '{0}' not valid. Valid values are: DL UL F S")]
    InvalidPatternToken(String),

    #[error("Slot pattern is empty")]
    EmptyPattern,

    #[error("No slot eligible for {kind} found for position {position} within {steps} steps")]
    NoEligibleSlot {
        kind: &'static str,
        position: usize,
        steps: usize,
    },

    #[error("{name} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Logic defects detected while the simulation runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Half-duplex violation: cannot receive {incoming} while in state {state}")]
    HalfDuplex { state: String, incoming: &'static str },

    #[error("Cannot start a transmission while in state {0}")]
    TransmitWhileBusy(String),

    #[error("RNTI {rnti} scheduled in slot {slot} symbol {sym_start} without queued payload")]
    MissingPayload { rnti: u16, slot: String, sym_start: u8 },

    #[error("Channel access requested while in state {0}")]
    DuplicateAccessRequest(String),

    #[error(
        "Concurrent reception mismatch: window started at {window_start_ns} ns for {window_ns} ns, \
         signal at {signal_start_ns} ns for {signal_ns} ns"
    )]
    RxWindowMismatch {
        window_start_ns: u128,
        window_ns: u128,
        signal_start_ns: u128,
        signal_ns: u128,
    },

    #[error("UE with RNTI {0} is not attached")]
    UnknownUe(u16),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unexpected {event} in state {state}")]
    UnexpectedEvent { event: &'static str, state: String },
}
