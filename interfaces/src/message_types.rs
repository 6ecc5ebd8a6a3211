//! Message Types for PHY-MAC Communication
//!
//! Defines the allocation descriptors, MAC PDUs and control messages exchanged
//! between the slot engine, the receiver and the scheduler

use bytes::Bytes;
use common::{CellId, Direction, Rnti, SlotAddress};
use serde::{Deserialize, Serialize};

/// Kind of a scheduled descriptor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DciType {
    /// Control region (PDCCH / PUCCH)
    Ctrl,
    /// Shared channel (PDSCH / PUSCH)
    Data,
}

/// One time/frequency allocation inside a slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DciInfo {
    /// Target user; zero for broadcast control
    pub rnti: Rnti,
    pub dci_type: DciType,
    pub direction: Direction,
    /// First OFDM symbol
    pub sym_start: u8,
    /// Number of OFDM symbols
    pub num_sym: u8,
    /// One flag per resource block group
    pub rbg_bitmask: Vec<bool>,
    /// Transport block size in bytes
    pub tb_size: u32,
    pub mcs: u8,
    pub harq_process: u8,
    /// Redundancy version
    pub rv: u8,
    /// New data indicator
    pub ndi: bool,
}

impl DciInfo {
    /// Full-bandwidth control descriptor
    pub fn ctrl(direction: Direction, sym_start: u8, num_sym: u8, num_rbgs: usize) -> Self {
        Self {
            rnti: Rnti(0),
            dci_type: DciType::Ctrl,
            direction,
            sym_start,
            num_sym,
            rbg_bitmask: vec![true; num_rbgs],
            tb_size: 0,
            mcs: 0,
            harq_process: 0,
            rv: 0,
            ndi: false,
        }
    }

    /// Data descriptor for a new transmission
    pub fn data(
        rnti: Rnti,
        direction: Direction,
        sym_start: u8,
        num_sym: u8,
        rbg_bitmask: Vec<bool>,
        tb_size: u32,
    ) -> Self {
        Self {
            rnti,
            dci_type: DciType::Data,
            direction,
            sym_start,
            num_sym,
            rbg_bitmask,
            tb_size,
            mcs: 0,
            harq_process: 0,
            rv: 0,
            ndi: true,
        }
    }

    pub fn is_data(&self) -> bool {
        self.dci_type == DciType::Data
    }

    pub fn is_ctrl(&self) -> bool {
        self.dci_type == DciType::Ctrl
    }

    /// Symbol right after the last one occupied
    pub fn sym_end(&self) -> u8 {
        self.sym_start + self.num_sym
    }

    /// Resource block indices covered by the RBG bitmask
    pub fn rb_assignment(&self, rbs_per_rbg: usize) -> Vec<usize> {
        self.rbg_bitmask
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .flat_map(|(rbg, _)| rbg * rbs_per_rbg..(rbg + 1) * rbs_per_rbg)
            .collect()
    }
}

/// Allocations of one slot, ordered by start symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotAllocation {
    pub slot: SlotAddress,
    pub allocations: Vec<DciInfo>,
}

impl SlotAllocation {
    pub fn new(slot: SlotAddress) -> Self {
        Self {
            slot,
            allocations: Vec::new(),
        }
    }

    /// Insert a descriptor keeping the list sorted by start symbol
    pub fn push(&mut self, dci: DciInfo) {
        let pos = self
            .allocations
            .partition_point(|a| a.sym_start <= dci.sym_start);
        self.allocations.insert(pos, dci);
    }

    /// Absorb the descriptors of another allocation for the same slot
    pub fn merge(&mut self, other: SlotAllocation) {
        for dci in other.allocations {
            self.push(dci);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn contains_data(&self) -> bool {
        self.allocations.iter().any(DciInfo::is_data)
    }

    pub fn contains_dl_ctrl(&self) -> bool {
        self.allocations
            .iter()
            .any(|a| a.is_ctrl() && a.direction == Direction::Dl)
    }

    /// End symbol of the last downlink data descriptor
    pub fn last_dl_data_symbol(&self) -> Option<u8> {
        self.allocations
            .iter()
            .filter(|a| a.is_data() && a.direction == Direction::Dl)
            .map(DciInfo::sym_end)
            .max()
    }
}

/// MAC PDU handed to the PHY for a (slot, symbol) burst
#[derive(Debug, Clone, PartialEq)]
pub struct MacPdu {
    pub rnti: Rnti,
    pub slot: SlotAddress,
    pub sym_start: u8,
    pub num_sym: u8,
    /// Logical channel id
    pub lcid: u8,
    pub harq_process: u8,
    pub payload: Bytes,
}

impl MacPdu {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// HARQ acknowledgement status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HarqStatus {
    Ack,
    Nack,
}

/// DL HARQ feedback sent by a terminal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DlHarqInfo {
    pub rnti: Rnti,
    pub harq_process: u8,
    pub num_retx: u8,
    pub status: HarqStatus,
}

/// UL HARQ feedback produced by the base station receiver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UlHarqInfo {
    pub rnti: Rnti,
    pub harq_process: u8,
    pub num_retx: u8,
    pub status: HarqStatus,
}

/// Wideband downlink channel quality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DlCqiInfo {
    pub rnti: Rnti,
    pub wideband_cqi: u8,
}

/// Buffer status report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BsrInfo {
    pub rnti: Rnti,
    pub buffer_bytes: u32,
}

/// Master information block
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MibInfo {
    pub system_frame: u32,
    pub scs_common_khz: u32,
}

/// System information block 1
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sib1Info {
    pub cell_id: CellId,
    /// Slot pattern in `DL|UL|S|F` grammar
    pub tdd_pattern: String,
}

/// Control messages carried in the control region.
///
/// Every consumer matches the variants exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Mib(MibInfo),
    Sib1(Sib1Info),
    /// DL grant; data follows `k0` slots later and feedback `k1` slots after that
    DlDci { dci: DciInfo, k0: u32, k1: u32 },
    /// UL grant; data is sent `k2` slots later
    UlDci { dci: DciInfo, k2: u32 },
    DlCqi(DlCqiInfo),
    Bsr(BsrInfo),
    RachPreamble { rap_id: u32 },
    DlHarqFeedback(DlHarqInfo),
}

impl ControlMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Mib(_) => "MIB",
            ControlMessage::Sib1(_) => "SIB1",
            ControlMessage::DlDci { .. } => "DL_DCI",
            ControlMessage::UlDci { .. } => "UL_DCI",
            ControlMessage::DlCqi(_) => "DL_CQI",
            ControlMessage::Bsr(_) => "BSR",
            ControlMessage::RachPreamble { .. } => "RACH_PREAMBLE",
            ControlMessage::DlHarqFeedback(_) => "DL_HARQ",
        }
    }

    /// User the message is addressed to or originates from
    pub fn rnti(&self) -> Option<Rnti> {
        match self {
            ControlMessage::Mib(_)
            | ControlMessage::Sib1(_)
            | ControlMessage::RachPreamble { .. } => None,
            ControlMessage::DlDci { dci, .. } | ControlMessage::UlDci { dci, .. } => Some(dci.rnti),
            ControlMessage::DlCqi(info) => Some(info.rnti),
            ControlMessage::Bsr(info) => Some(info.rnti),
            ControlMessage::DlHarqFeedback(info) => Some(info.rnti),
        }
    }
}

/// Per-RB uplink SINR measured at the end of a data reception
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UlCqiInfo {
    pub slot: SlotAddress,
    pub sym_start: u8,
    /// Linear SINR, one entry per resource block
    pub sinr_per_rb: Vec<f64>,
}

/// Trace of one received transport block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RxPacketTrace {
    pub slot: SlotAddress,
    pub sym_start: u8,
    pub num_sym: u8,
    pub rnti: Rnti,
    pub cell_id: CellId,
    pub direction: Direction,
    pub tb_size: u32,
    pub mcs: u8,
    pub rv: u8,
    pub sinr_avg: f64,
    pub sinr_min: f64,
    pub tbler: f64,
    pub corrupted: bool,
    pub rb_assigned_num: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> SlotAddress {
        SlotAddress::new(0, 0, 0, 1).unwrap()
    }

    #[test]
    fn test_rb_assignment() {
        let dci = DciInfo::data(
            Rnti(1),
            Direction::Dl,
            1,
            4,
            vec![true, false, true],
            100,
        );
        assert_eq!(dci.rb_assignment(2), vec![0, 1, 4, 5]);
        assert_eq!(dci.sym_end(), 5);
    }

    #[test]
    fn test_slot_allocation_order() {
        let mut alloc = SlotAllocation::new(slot());
        alloc.push(DciInfo::ctrl(Direction::Ul, 13, 1, 4));
        alloc.push(DciInfo::data(Rnti(1), Direction::Dl, 1, 6, vec![true; 4], 10));
        alloc.push(DciInfo::ctrl(Direction::Dl, 0, 1, 4));

        let starts: Vec<u8> = alloc.allocations.iter().map(|a| a.sym_start).collect();
        assert_eq!(starts, vec![0, 1, 13]);
        assert!(alloc.contains_data());
        assert!(alloc.contains_dl_ctrl());
        assert_eq!(alloc.last_dl_data_symbol(), Some(7));
    }

    #[test]
    fn test_merge() {
        let mut a = SlotAllocation::new(slot());
        a.push(DciInfo::ctrl(Direction::Dl, 0, 1, 4));
        let mut b = SlotAllocation::new(slot());
        b.push(DciInfo::ctrl(Direction::Ul, 13, 1, 4));
        a.merge(b);
        assert_eq!(a.allocations.len(), 2);
        assert!(!a.contains_data());
        assert_eq!(a.last_dl_data_symbol(), None);
    }

    #[test]
    fn test_control_message_identity() {
        let msg = ControlMessage::DlHarqFeedback(DlHarqInfo {
            rnti: Rnti(5),
            harq_process: 2,
            num_retx: 0,
            status: HarqStatus::Ack,
        });
        assert_eq!(msg.kind(), "DL_HARQ");
        assert_eq!(msg.rnti(), Some(Rnti(5)));
        assert_eq!(
            ControlMessage::Mib(MibInfo {
                system_frame: 0,
                scs_common_khz: 30
            })
            .rnti(),
            None
        );
    }
}
