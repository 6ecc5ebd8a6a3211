//! NR Frame Structure and Slot Timing
//!
//! Slot/symbol periods for a numerology, the periodic slot pattern, and the
//! compiler turning a pattern plus processing delays (n0, n1, n2, L1/L2
//! latency) into per-position lookup tables.

use common::utils::modulo;
use common::{ConfigError, Numerology, SlotAddress, SlotType};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Slot configuration based on numerology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConfig {
    pub numerology: Numerology,
    /// Number of OFDM symbols per slot
    pub symbols_per_slot: u8,
    pub symbol_period: Duration,
    /// Symbol period times symbols per slot
    pub slot_period: Duration,
}

impl SlotConfig {
    /// Create slot configuration from numerology
    pub fn from_numerology(numerology: Numerology, symbols_per_slot: u8) -> Result<Self, ConfigError> {
        if symbols_per_slot == 0 || symbols_per_slot > 14 {
            return Err(ConfigError::OutOfRange {
                name: "symbols_per_slot",
                value: u64::from(symbols_per_slot),
                min: 1,
                max: 14,
            });
        }

        let symbol_period = numerology.slot_duration() / u32::from(symbols_per_slot);
        Ok(Self {
            numerology,
            symbols_per_slot,
            symbol_period,
            slot_period: symbol_period * u32::from(symbols_per_slot),
        })
    }
}

/// Periodic sequence of slot types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPattern(Vec<SlotType>);

impl SlotPattern {
    pub fn new(slots: Vec<SlotType>) -> Result<Self, ConfigError> {
        if slots.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }
        Ok(Self(slots))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn slots(&self) -> &[SlotType] {
        &self.0
    }

    /// Position of `slot` inside the pattern
    pub fn position(&self, slot: &SlotAddress) -> usize {
        (slot.normalize() % self.0.len() as u64) as usize
    }

    /// Type of `slot`
    pub fn slot_type(&self, slot: &SlotAddress) -> SlotType {
        self.0[self.position(slot)]
    }

    pub fn has_ul_slot(&self) -> bool {
        self.0.contains(&SlotType::Ul)
    }

    pub fn has_dl_slot(&self) -> bool {
        self.0
            .iter()
            .any(|s| matches!(s, SlotType::Dl | SlotType::Special))
    }

    /// Time-duplexed when a flexible slot exists or uplink shares the carrier
    /// with downlink; all-DL and all-UL patterns are frequency-duplexed.
    pub fn is_tdd(&self) -> bool {
        self.0.contains(&SlotType::Flexible) || (self.has_ul_slot() && self.has_dl_slot())
    }
}

impl FromStr for SlotPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens: Vec<&str> = s.split('|').map(str::trim).collect();
        if tokens.last().is_some_and(|t| t.is_empty()) {
            tokens.pop();
        }
        let slots = tokens
            .into_iter()
            .map(SlotType::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(slots)
    }
}

impl fmt::Display for SlotPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for slot in &self.0 {
            write!(f, "{}|", slot)?;
        }
        Ok(())
    }
}

/// Processing delays expressed in slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingDelays {
    /// DL DCI to DL data
    pub n0: u32,
    /// DL data to HARQ feedback
    pub n1: u32,
    /// UL DCI to UL data
    pub n2: u32,
    /// Control generation to transmission
    pub l1l2_ctrl_latency: u32,
}

impl Default for ProcessingDelays {
    fn default() -> Self {
        Self {
            n0: 0,
            n1: 2,
            n2: 2,
            l1l2_ctrl_latency: 2,
        }
    }
}

impl ProcessingDelays {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("n0", self.n0, 0, 1)?;
        check_range("n1", self.n1, 0, 4)?;
        check_range("n2", self.n2, 0, 4)?;
        Ok(())
    }
}

fn check_range(name: &'static str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value: u64::from(value),
            min: u64::from(min),
            max: u64::from(max),
        });
    }
    Ok(())
}

/// Lookup tables compiled from a slot pattern.
///
/// All tables are indexed by pattern position and hold ascending, deduplicated
/// slot offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingMaps {
    /// DL DCIs to send in this position, as k0 values
    pub send_dl: Vec<Vec<u32>>,
    /// UL DCIs to send in this position, as k2 values
    pub send_ul: Vec<Vec<u32>>,
    /// DL slots to schedule from this position, as k0 + L1/L2 latency
    pub generate_dl: Vec<Vec<u32>>,
    /// UL slots to schedule from this position, as k2 + L1/L2 latency
    pub generate_ul: Vec<Vec<u32>>,
    /// k1 for data received in this position
    pub harq_feedback: Vec<Option<u32>>,
}

impl TimingMaps {
    /// Compile the tables for `pattern`
    pub fn compile(pattern: &SlotPattern, delays: ProcessingDelays) -> Result<Self, ConfigError> {
        delays.validate()?;

        let len = pattern.len();
        let tdd = pattern.is_tdd();
        // FDD bands search as if every slot could carry anything
        let generation: Vec<SlotType> = if tdd {
            pattern.slots().to_vec()
        } else {
            vec![SlotType::Flexible; len]
        };

        let mut maps = Self {
            send_dl: vec![Vec::new(); len],
            send_ul: vec![Vec::new(); len],
            generate_dl: vec![Vec::new(); len],
            generate_ul: vec![Vec::new(); len],
            harq_feedback: vec![None; len],
        };

        for pos in 0..len {
            let gen_type = generation[pos];
            if gen_type == SlotType::Ul {
                maps.add_dci(&generation, pos, delays.n2, delays.l1l2_ctrl_latency, false)?;
            } else if gen_type == SlotType::Dl || pattern.slots()[pos] == SlotType::Special {
                maps.add_dci(&generation, pos, delays.n0, delays.l1l2_ctrl_latency, true)?;
                maps.harq_feedback[pos] = Some(find_harq_slot(&generation, pos, delays.n1)?);
            } else if gen_type == SlotType::Flexible {
                maps.add_dci(&generation, pos, delays.n0, delays.l1l2_ctrl_latency, true)?;
                maps.add_dci(&generation, pos, delays.n2, delays.l1l2_ctrl_latency, false)?;
                maps.harq_feedback[pos] = Some(find_harq_slot(&generation, pos, delays.n1)?);
            }
        }

        if !tdd {
            if pattern.has_ul_slot() {
                maps.generate_dl.iter_mut().for_each(Vec::clear);
            } else {
                maps.generate_ul.iter_mut().for_each(Vec::clear);
            }
        }

        for list in maps
            .send_dl
            .iter_mut()
            .chain(maps.send_ul.iter_mut())
            .chain(maps.generate_dl.iter_mut())
            .chain(maps.generate_ul.iter_mut())
        {
            list.sort_unstable();
            list.dedup();
        }

        info!("Compiled timing tables for pattern {} (tdd={})", pattern, tdd);
        debug!("generate_dl={:?} generate_ul={:?}", maps.generate_dl, maps.generate_ul);
        debug!("send_dl={:?} send_ul={:?} k1={:?}", maps.send_dl, maps.send_ul, maps.harq_feedback);

        Ok(maps)
    }

    fn add_dci(
        &mut self,
        pattern: &[SlotType],
        pos: usize,
        n: u32,
        l1l2: u32,
        downlink: bool,
    ) -> Result<(), ConfigError> {
        let (dci_pos, k) = find_dci_slot(pattern, pos, n)?;
        let gen_pos = modulo(dci_pos as i64 - i64::from(l1l2), pattern.len());

        let (send, generate) = if downlink {
            (&mut self.send_dl, &mut self.generate_dl)
        } else {
            (&mut self.send_ul, &mut self.generate_ul)
        };
        send[dci_pos].push(k);
        generate[gen_pos].push(k + l1l2);
        Ok(())
    }

    /// Largest generation offset in any position
    pub fn max_generate_offset(&self) -> u32 {
        self.generate_dl
            .iter()
            .chain(self.generate_ul.iter())
            .flatten()
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// Walk backwards from `pos - n` to the nearest slot able to carry a DCI.
///
/// Returns the DCI position and the resulting k0/k2.
pub(crate) fn find_dci_slot(pattern: &[SlotType], pos: usize, n: u32) -> Result<(usize, u32), ConfigError> {
    let len = pattern.len();
    let max_steps = 2 * len;
    let mut k = n;
    for _ in 0..=max_steps {
        let index = modulo(pos as i64 - i64::from(k), len);
        if pattern[index].can_host_dci() {
            return Ok((index, k));
        }
        k += 1;
    }
    Err(ConfigError::NoEligibleSlot {
        kind: "DCI",
        position: pos,
        steps: max_steps,
    })
}

/// Walk forward from `pos + n1` to the nearest slot able to carry HARQ feedback
pub(crate) fn find_harq_slot(pattern: &[SlotType], pos: usize, n1: u32) -> Result<u32, ConfigError> {
    let len = pattern.len();
    let max_steps = 2 * len;
    let mut k1 = n1;
    for _ in 0..=max_steps {
        let index = modulo(pos as i64 + i64::from(k1), len);
        if pattern[index].can_host_feedback() {
            return Ok(k1);
        }
        k1 += 1;
    }
    Err(ConfigError::NoEligibleSlot {
        kind: "HARQ feedback",
        position: pos,
        steps: max_steps,
    })
}
