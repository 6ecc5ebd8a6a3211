//! Common Types for the NR Slot Core
//!
//! Identifiers, numerology and slot classification shared by every crate

use crate::error::ConfigError;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub u16);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
    /// 480 kHz
    Scs480 = 480,
}

/// Air-interface numerology (mu), fixing subcarrier spacing and slot length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Numerology(u8);

impl Numerology {
    /// Highest supported numerology
    pub const MAX: u8 = 5;

    /// Create a numerology with validation
    pub fn new(value: u8) -> Result<Self, ConfigError> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(ConfigError::InvalidNumerology(value))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Slots in one 1 ms subframe (2^mu)
    pub fn slots_per_subframe(&self) -> u32 {
        1 << self.0
    }

    /// Slots in one 10 ms frame
    pub fn slots_per_frame(&self) -> u32 {
        10 * self.slots_per_subframe()
    }

    /// Nominal slot duration (1 ms / 2^mu)
    pub fn slot_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000 >> self.0)
    }

    pub fn subcarrier_spacing(&self) -> SubcarrierSpacing {
        // 15 kHz * 2^mu always maps onto a declared variant for mu <= 5
        SubcarrierSpacing::from_u32(15 << self.0).unwrap_or(SubcarrierSpacing::Scs15)
    }

    pub fn scs_khz(&self) -> u32 {
        15 << self.0
    }
}

impl TryFrom<u8> for Numerology {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Numerology> for u8 {
    fn from(n: Numerology) -> Self {
        n.0
    }
}

impl fmt::Display for Numerology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a slot inside a periodic pattern.
///
/// The declaration order matters: slots up to `Flexible` can host a DCI,
/// slots from `Flexible` onwards can carry uplink feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotType {
    /// Downlink only
    Dl,
    /// Special (DL, guard, short UL)
    Special,
    /// Flexible (either direction)
    Flexible,
    /// Uplink only
    Ul,
}

impl SlotType {
    /// Whether a slot of this type can transmit a DCI
    pub fn can_host_dci(&self) -> bool {
        *self <= SlotType::Flexible
    }

    /// Whether a slot of this type can carry HARQ feedback
    pub fn can_host_feedback(&self) -> bool {
        *self >= SlotType::Flexible
    }

    pub fn has_dl(&self) -> bool {
        matches!(self, SlotType::Dl | SlotType::Special | SlotType::Flexible)
    }

    pub fn has_ul(&self) -> bool {
        matches!(self, SlotType::Ul | SlotType::Flexible)
    }
}

impl FromStr for SlotType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "DL" => Ok(SlotType::Dl),
            "UL" => Ok(SlotType::Ul),
            "S" => Ok(SlotType::Special),
            "F" => Ok(SlotType::Flexible),
            other => Err(ConfigError::InvalidPatternToken(other.to_string())),
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            SlotType::Dl => "DL",
            SlotType::Ul => "UL",
            SlotType::Special => "S",
            SlotType::Flexible => "F",
        };
        f.write_str(token)
    }
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Downlink
    Dl,
    /// Uplink
    Ul,
}

/// Role of the device that emitted a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    /// gNB
    BaseStation,
    /// UE
    Terminal,
}
