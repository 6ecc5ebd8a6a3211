//! Slot Addressing
//!
//! A [`SlotAddress`] names one slot by frame, subframe and slot number under a
//! fixed numerology. Addresses can be flattened into a monotonic counter,
//! advanced with carry, and packed into 64-bit keys.

use crate::error::ConfigError;
use crate::types::{Numerology, Rnti};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Frame / subframe / slot triple under a numerology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotAddress {
    frame: u32,
    subframe: u8,
    slot: u8,
    numerology: Numerology,
}

impl SlotAddress {
    /// Subframes in one frame
    pub const SUBFRAMES_PER_FRAME: u8 = 10;

    /// Create a validated slot address
    pub fn new(frame: u32, subframe: u8, slot: u8, numerology: u8) -> Result<Self, ConfigError> {
        let numerology = Numerology::new(numerology)?;
        if subframe >= Self::SUBFRAMES_PER_FRAME
            || u32::from(slot) >= numerology.slots_per_subframe()
        {
            return Err(ConfigError::InvalidSlotAddress {
                frame,
                subframe,
                slot,
                numerology: numerology.value(),
            });
        }
        Ok(Self {
            frame,
            subframe,
            slot,
            numerology,
        })
    }

    /// Build an address from a flat slot counter
    pub fn from_normalized(normalized: u64, numerology: Numerology) -> Self {
        let sps = u64::from(numerology.slots_per_subframe());
        let slot = (normalized % sps) as u8;
        let subframes = normalized / sps;
        Self {
            frame: (subframes / 10) as u32,
            subframe: (subframes % 10) as u8,
            slot,
            numerology,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn subframe(&self) -> u8 {
        self.subframe
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn numerology(&self) -> Numerology {
        self.numerology
    }

    pub fn slots_per_subframe(&self) -> u32 {
        self.numerology.slots_per_subframe()
    }

    /// Flat monotonic slot counter
    pub fn normalize(&self) -> u64 {
        let sps = u64::from(self.slots_per_subframe());
        u64::from(self.slot)
            + u64::from(self.subframe) * sps
            + u64::from(self.frame) * u64::from(Self::SUBFRAMES_PER_FRAME) * sps
    }

    /// Advance by `slots`, carrying into subframe and frame
    #[must_use]
    pub fn add(mut self, slots: u64) -> Self {
        let sps = u64::from(self.slots_per_subframe());
        let total_slots = u64::from(self.slot) + slots;
        self.slot = (total_slots % sps) as u8;

        let total_subframes = u64::from(self.subframe) + total_slots / sps;
        self.subframe = (total_subframes % 10) as u8;
        self.frame = self.frame.wrapping_add((total_subframes / 10) as u32);
        self
    }

    /// Ordering that refuses to compare addresses of different numerology
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, ConfigError> {
        if self.numerology != other.numerology {
            return Err(ConfigError::NumerologyMismatch(
                self.numerology.value(),
                other.numerology.value(),
            ));
        }
        Ok((self.frame, self.subframe, self.slot).cmp(&(other.frame, other.subframe, other.slot)))
    }

    /// Packed 64-bit key
    pub fn encode(&self) -> u64 {
        (u64::from(self.frame) << 32)
            | (u64::from(self.subframe) << 24)
            | (u64::from(self.slot) << 8)
            | (u64::from(self.numerology.value()) << 5)
    }

    /// Packed key that also carries a start symbol and a user id.
    ///
    /// The frame number is truncated to 16 bits to make room for the RNTI.
    pub fn encode_with_sym_start_rnti(&self, sym_start: u8, rnti: Rnti) -> u64 {
        (u64::from(rnti.value()) << 48)
            | (u64::from(self.frame & 0xFFFF) << 32)
            | (u64::from(self.subframe) << 24)
            | (u64::from(self.slot) << 8)
            | (u64::from(self.numerology.value()) << 5)
            | u64::from(sym_start & 0x1F)
    }

    /// Packed key for a (slot, start symbol) pair
    pub fn encode_with_sym_start(&self, sym_start: u8) -> u64 {
        self.encode_with_sym_start_rnti(sym_start, Rnti(0))
    }

    /// Inverse of [`SlotAddress::encode`]
    pub fn decode(key: u64) -> Result<Self, ConfigError> {
        Self::new(
            (key >> 32) as u32,
            ((key >> 24) & 0xFF) as u8,
            ((key >> 8) & 0xFF) as u8,
            ((key >> 5) & 0x07) as u8,
        )
    }
}

impl PartialOrd for SlotAddress {
    /// `None` when the numerologies differ
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_cmp(other).ok()
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.frame, self.subframe, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_validation() {
        assert!(SlotAddress::new(0, 9, 1, 1).is_ok());
        assert_eq!(
            SlotAddress::new(0, 0, 0, 6),
            Err(ConfigError::InvalidNumerology(6))
        );
        assert!(SlotAddress::new(0, 10, 0, 0).is_err());
        assert!(SlotAddress::new(0, 0, 2, 1).is_err());
    }

    #[test]
    fn test_add_zero_and_composition() {
        for mu in 0..=5u8 {
            let start = SlotAddress::new(3, 7, 0, mu).unwrap().add(5);
            assert_eq!(start.add(0).normalize(), start.normalize());

            for (a, b) in [(1u64, 1u64), (7, 13), (0, 320), (1023, 4099)] {
                assert_eq!(
                    start.add(a).add(b).normalize(),
                    start.normalize() + a + b,
                    "mu={mu} a={a} b={b}"
                );
            }
        }
    }

    #[test]
    fn test_add_carries() {
        let addr = SlotAddress::new(0, 9, 1, 1).unwrap().add(1);
        assert_eq!((addr.frame(), addr.subframe(), addr.slot()), (1, 0, 0));

        let addr = SlotAddress::new(4, 0, 0, 0).unwrap().add(25);
        assert_eq!((addr.frame(), addr.subframe(), addr.slot()), (6, 5, 0));
    }

    #[test]
    fn test_from_normalized_roundtrip() {
        let mu = Numerology::new(2).unwrap();
        let addr = SlotAddress::new(12, 3, 2, 2).unwrap();
        assert_eq!(SlotAddress::from_normalized(addr.normalize(), mu), addr);
    }

    #[test]
    fn test_ordering() {
        let a = SlotAddress::new(1, 2, 0, 1).unwrap();
        let b = a.add(1);
        assert!(a < b);
        assert_eq!(a.try_cmp(&a), Ok(Ordering::Equal));

        let other = SlotAddress::new(1, 2, 0, 0).unwrap();
        assert_eq!(a.try_cmp(&other), Err(ConfigError::NumerologyMismatch(1, 0)));
        assert_eq!(a.partial_cmp(&other), None);
    }

    #[test]
    fn test_encoding() {
        let addr = SlotAddress::new(513, 4, 3, 2).unwrap();
        assert_eq!(SlotAddress::decode(addr.encode()), Ok(addr));

        let key = addr.encode_with_sym_start_rnti(13, Rnti(7));
        assert_eq!(key & 0x1F, 13);
        assert_eq!(key >> 48, 7);
        assert_ne!(addr.encode_with_sym_start(1), addr.encode_with_sym_start(2));
        assert_ne!(addr.encode(), addr.add(1).encode());
    }
}
