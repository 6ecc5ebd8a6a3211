//! Round-Robin Reference Scheduler
//!
//! Minimal scheduler behind the PHY-MAC SAP. Every attached UE has a full DL
//! buffer; UL is granted against the last buffer status report. UEs sharing a
//! slot split the RBGs (OFDMA) on the same symbols. Failed transport blocks
//! are retransmitted with an increasing redundancy version until the
//! retransmission limit.

use bytes::Bytes;
use common::{linear_to_db, CellId, ConfigError, Direction, Rnti, SlotAddress, SlotType};
use interfaces::{
    ControlMessage, DciInfo, HarqStatus, MacPdu, PhySapProvider, PhySapUser, SlotAllocation,
    UlCqiInfo, UlHarqInfo,
};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cell_id: CellId,
    /// Resource block groups in the carrier
    pub num_rbgs: usize,
    pub symbols_per_slot: u8,
    /// DL control region at the start of the slot
    pub dl_ctrl_symbols: u8,
    /// UL control region at the end of the slot
    pub ul_ctrl_symbols: u8,
    /// Transport block size in bytes
    pub dl_tb_size: u32,
    pub ul_tb_size: u32,
    /// MCS used until the UE reports a CQI
    pub default_mcs: u8,
    /// HARQ processes per UE and direction
    pub harq_processes: u8,
    /// Redundancy version after which a failed block is dropped
    pub max_retx: u8,
    /// Keep the DL buffer of every UE full
    pub dl_full_buffer: bool,
    pub max_ues_per_slot: usize,
    /// Logical channel of the generated PDUs
    pub lcid: u8,
}

impl SchedulerConfig {
    pub fn new(cell_id: CellId, num_rbgs: usize, symbols_per_slot: u8) -> Self {
        Self {
            cell_id,
            num_rbgs,
            symbols_per_slot,
            dl_ctrl_symbols: 1,
            ul_ctrl_symbols: 1,
            dl_tb_size: 512,
            ul_tb_size: 256,
            default_mcs: 0,
            harq_processes: 16,
            max_retx: 3,
            dl_full_buffer: true,
            max_ues_per_slot: 4,
            lcid: 4,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_rbgs == 0 {
            return Err(ConfigError::InvalidParameter("num_rbgs must be positive".to_string()));
        }
        let ctrl = u16::from(self.dl_ctrl_symbols) + u16::from(self.ul_ctrl_symbols);
        if ctrl + 2 > u16::from(self.symbols_per_slot) {
            return Err(ConfigError::InvalidParameter(format!(
                "{} control symbols leave no room for data in a {}-symbol slot",
                ctrl, self.symbols_per_slot
            )));
        }
        if self.harq_processes == 0 || self.harq_processes > 16 {
            return Err(ConfigError::OutOfRange {
                name: "harq_processes",
                value: u64::from(self.harq_processes),
                min: 1,
                max: 16,
            });
        }
        if self.max_ues_per_slot == 0 {
            return Err(ConfigError::InvalidParameter(
                "max_ues_per_slot must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Data region (first symbol, symbols) of a slot type in one direction
    pub fn data_symbols(&self, slot_type: SlotType, direction: Direction) -> Option<(u8, u8)> {
        let total = self.symbols_per_slot;
        let dl_ctrl = self.dl_ctrl_symbols;
        let ul_ctrl = self.ul_ctrl_symbols;
        match (slot_type, direction) {
            (SlotType::Dl, Direction::Dl) => Some((dl_ctrl, total - dl_ctrl)),
            // Last symbols stay empty as the DL/UL guard
            (SlotType::Special, Direction::Dl) => Some((dl_ctrl, total - dl_ctrl - ul_ctrl)),
            (SlotType::Ul, Direction::Ul) => Some((0, total - ul_ctrl)),
            (SlotType::Flexible, direction) => {
                let data = total - dl_ctrl - ul_ctrl;
                let dl = data / 2;
                match direction {
                    Direction::Dl => Some((dl_ctrl, dl)),
                    Direction::Ul => Some((dl_ctrl + dl, data - dl)),
                }
            }
            _ => None,
        }
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dl_new_tx: u64,
    pub dl_retx: u64,
    pub ul_new_tx: u64,
    pub ul_retx: u64,
    pub dl_acks: u64,
    pub dl_nacks: u64,
    pub ul_acks: u64,
    pub ul_nacks: u64,
    /// Blocks abandoned after the last retransmission
    pub dropped_tbs: u64,
    pub rach_received: u64,
    pub ul_rx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum HarqProcess {
    Idle,
    WaitingFeedback(DciInfo),
    PendingRetx(DciInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedbackOutcome {
    Acked,
    Retransmit,
    Dropped,
    Unexpected,
}

#[derive(Debug, Clone)]
struct HarqEntity {
    processes: Vec<HarqProcess>,
}

impl HarqEntity {
    fn new(num_processes: u8) -> Self {
        Self {
            processes: vec![HarqProcess::Idle; usize::from(num_processes)],
        }
    }

    fn pending_retx(&self) -> Option<u8> {
        self.processes
            .iter()
            .position(|p| matches!(p, HarqProcess::PendingRetx(_)))
            .and_then(|id| u8::try_from(id).ok())
    }

    fn free(&self) -> Option<u8> {
        self.processes
            .iter()
            .position(|p| *p == HarqProcess::Idle)
            .and_then(|id| u8::try_from(id).ok())
    }

    fn take_retx(&mut self, id: u8) -> Option<DciInfo> {
        let slot = self.processes.get_mut(usize::from(id))?;
        match std::mem::replace(slot, HarqProcess::Idle) {
            HarqProcess::PendingRetx(dci) => Some(dci),
            other => {
                *slot = other;
                None
            }
        }
    }

    fn start(&mut self, id: u8, dci: DciInfo) {
        if let Some(slot) = self.processes.get_mut(usize::from(id)) {
            *slot = HarqProcess::WaitingFeedback(dci);
        }
    }

    fn feedback(&mut self, id: u8, status: HarqStatus, max_retx: u8) -> FeedbackOutcome {
        let Some(slot) = self.processes.get_mut(usize::from(id)) else {
            return FeedbackOutcome::Unexpected;
        };
        let rv = match slot {
            HarqProcess::WaitingFeedback(dci) => dci.rv,
            HarqProcess::Idle | HarqProcess::PendingRetx(_) => return FeedbackOutcome::Unexpected,
        };

        match std::mem::replace(slot, HarqProcess::Idle) {
            HarqProcess::WaitingFeedback(dci) if status == HarqStatus::Nack && rv < max_retx => {
                *slot = HarqProcess::PendingRetx(dci);
                FeedbackOutcome::Retransmit
            }
            _ if status == HarqStatus::Ack => FeedbackOutcome::Acked,
            _ => FeedbackOutcome::Dropped,
        }
    }
}

#[derive(Debug, Clone)]
struct UeContext {
    dl_harq: HarqEntity,
    ul_harq: HarqEntity,
    dl_cqi: Option<u8>,
    /// Bytes waiting in the UE according to its last BSR
    ul_buffer: u32,
}

/// Round-robin scheduler of one cell
pub struct RoundRobinScheduler {
    config: SchedulerConfig,
    ues: BTreeMap<Rnti, UeContext>,
    dl_order: VecDeque<Rnti>,
    ul_order: VecDeque<Rnti>,
    current_slot: Option<SlotAddress>,
    last_ul_sinr_db: Option<f64>,
    stats: Rc<RefCell<SchedulerStats>>,
}

impl RoundRobinScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "Round-robin scheduler for cell {}: {} RBGs, DL TB {} bytes, UL TB {} bytes",
            config.cell_id, config.num_rbgs, config.dl_tb_size, config.ul_tb_size
        );
        Ok(Self {
            config,
            ues: BTreeMap::new(),
            dl_order: VecDeque::new(),
            ul_order: VecDeque::new(),
            current_slot: None,
            last_ul_sinr_db: None,
            stats: Rc::new(RefCell::new(SchedulerStats::default())),
        })
    }

    /// Counters shared with whoever reports them
    pub fn stats_handle(&self) -> Rc<RefCell<SchedulerStats>> {
        Rc::clone(&self.stats)
    }

    pub fn num_ues(&self) -> usize {
        self.ues.len()
    }

    pub fn has_ue(&self, rnti: Rnti) -> bool {
        self.ues.contains_key(&rnti)
    }

    pub fn current_slot(&self) -> Option<SlotAddress> {
        self.current_slot
    }

    pub fn last_ul_sinr_db(&self) -> Option<f64> {
        self.last_ul_sinr_db
    }

    pub fn add_ue(&mut self, rnti: Rnti) -> bool {
        if self.ues.contains_key(&rnti) {
            return false;
        }
        self.ues.insert(
            rnti,
            UeContext {
                dl_harq: HarqEntity::new(self.config.harq_processes),
                ul_harq: HarqEntity::new(self.config.harq_processes),
                dl_cqi: None,
                ul_buffer: 0,
            },
        );
        self.dl_order.push_back(rnti);
        self.ul_order.push_back(rnti);
        info!("Scheduler of cell {} added UE {}", self.config.cell_id, rnti);
        true
    }

    pub fn remove_ue(&mut self, rnti: Rnti) -> bool {
        self.dl_order.retain(|r| *r != rnti);
        self.ul_order.retain(|r| *r != rnti);
        self.ues.remove(&rnti).is_some()
    }

    fn mcs_for(&self, ue: &UeContext) -> u8 {
        ue.dl_cqi
            .map(|cqi| cqi.saturating_sub(1))
            .unwrap_or(self.config.default_mcs)
    }

    /// Serve the eligible UEs at the head of `order`, then move them to the back
    fn round_robin(order: &mut VecDeque<Rnti>, max: usize, eligible: impl Fn(Rnti) -> bool) -> Vec<Rnti> {
        let picked: Vec<Rnti> = order.iter().copied().filter(|r| eligible(*r)).take(max).collect();
        order.retain(|r| !picked.contains(r));
        order.extend(picked.iter().copied());
        picked
    }

    /// Contiguous RBG masks, one per UE, remainder going to the first ones
    fn split_rbgs(&self, num_ues: usize) -> Vec<Vec<bool>> {
        let num_rbgs = self.config.num_rbgs;
        let users = num_ues.min(num_rbgs);
        if users == 0 {
            return Vec::new();
        }
        let share = num_rbgs / users;
        let extra = num_rbgs % users;

        let mut masks = Vec::with_capacity(users);
        let mut start = 0;
        for i in 0..users {
            let len = share + usize::from(i < extra);
            let mut mask = vec![false; num_rbgs];
            mask[start..start + len].iter_mut().for_each(|b| *b = true);
            masks.push(mask);
            start += len;
        }
        masks
    }

    fn schedule_dl(&mut self, alloc: &mut SlotAllocation, slot_type: SlotType, phy: &mut dyn PhySapProvider) {
        let Some((sym_start, num_sym)) = self.config.data_symbols(slot_type, Direction::Dl) else {
            return;
        };
        let full_buffer = self.config.dl_full_buffer;
        let ues = &self.ues;
        let picked = Self::round_robin(&mut self.dl_order, self.config.max_ues_per_slot, |rnti| {
            ues.get(&rnti).is_some_and(|ue| {
                ue.dl_harq.pending_retx().is_some() || (full_buffer && ue.dl_harq.free().is_some())
            })
        });
        let masks = self.split_rbgs(picked.len());

        for (rnti, mask) in picked.into_iter().zip(masks) {
            let Some(ue) = self.ues.get(&rnti) else {
                continue;
            };
            let mcs = self.mcs_for(ue);
            let Some(dci) = self.next_dci(rnti, Direction::Dl, sym_start, num_sym, mask, mcs) else {
                continue;
            };

            trace!(
                "DL RNTI {} in {} symbols {}+{} process {} rv {}",
                rnti,
                alloc.slot,
                sym_start,
                num_sym,
                dci.harq_process,
                dci.rv
            );
            phy.send_mac_pdu(MacPdu {
                rnti,
                slot: alloc.slot,
                sym_start,
                num_sym,
                lcid: self.config.lcid,
                harq_process: dci.harq_process,
                payload: Bytes::from(vec![rnti.value() as u8; dci.tb_size as usize]),
            });
            alloc.push(dci);
        }
    }

    fn schedule_ul(&mut self, alloc: &mut SlotAllocation, slot_type: SlotType) {
        let Some((sym_start, num_sym)) = self.config.data_symbols(slot_type, Direction::Ul) else {
            return;
        };
        let ues = &self.ues;
        let picked = Self::round_robin(&mut self.ul_order, self.config.max_ues_per_slot, |rnti| {
            ues.get(&rnti).is_some_and(|ue| {
                ue.ul_harq.pending_retx().is_some() || (ue.ul_buffer > 0 && ue.ul_harq.free().is_some())
            })
        });
        let masks = self.split_rbgs(picked.len());

        for (rnti, mask) in picked.into_iter().zip(masks) {
            let mcs = self.config.default_mcs;
            if let Some(dci) = self.next_dci(rnti, Direction::Ul, sym_start, num_sym, mask, mcs) {
                trace!(
                    "UL RNTI {} in {} symbols {}+{} process {} rv {}",
                    rnti,
                    alloc.slot,
                    sym_start,
                    num_sym,
                    dci.harq_process,
                    dci.rv
                );
                alloc.push(dci);
            }
        }
    }

    /// Retransmission if one is pending, otherwise new data on a free process
    fn next_dci(
        &mut self,
        rnti: Rnti,
        direction: Direction,
        sym_start: u8,
        num_sym: u8,
        rbg_bitmask: Vec<bool>,
        mcs: u8,
    ) -> Option<DciInfo> {
        let tb_size = match direction {
            Direction::Dl => self.config.dl_tb_size,
            Direction::Ul => self.config.ul_tb_size,
        };
        let ue = self.ues.get_mut(&rnti)?;
        let harq = match direction {
            Direction::Dl => &mut ue.dl_harq,
            Direction::Ul => &mut ue.ul_harq,
        };
        let mut stats = self.stats.borrow_mut();

        let dci = if let Some(id) = harq.pending_retx() {
            let previous = harq.take_retx(id)?;
            match direction {
                Direction::Dl => stats.dl_retx += 1,
                Direction::Ul => stats.ul_retx += 1,
            }
            DciInfo {
                sym_start,
                num_sym,
                rbg_bitmask,
                rv: previous.rv + 1,
                ndi: false,
                ..previous
            }
        } else {
            let id = harq.free()?;
            match direction {
                Direction::Dl => stats.dl_new_tx += 1,
                Direction::Ul => {
                    stats.ul_new_tx += 1;
                    ue.ul_buffer = ue.ul_buffer.saturating_sub(tb_size);
                }
            }
            let mut dci = DciInfo::data(rnti, direction, sym_start, num_sym, rbg_bitmask, tb_size);
            dci.mcs = mcs;
            dci.harq_process = id;
            dci
        };

        let harq = match direction {
            Direction::Dl => &mut ue.dl_harq,
            Direction::Ul => &mut ue.ul_harq,
        };
        harq.start(dci.harq_process, dci.clone());
        Some(dci)
    }

    fn harq_feedback(&mut self, direction: Direction, rnti: Rnti, process: u8, status: HarqStatus) {
        let max_retx = self.config.max_retx;
        let Some(ue) = self.ues.get_mut(&rnti) else {
            warn!("{:?} HARQ feedback for unknown UE {}", direction, rnti);
            return;
        };
        let harq = match direction {
            Direction::Dl => &mut ue.dl_harq,
            Direction::Ul => &mut ue.ul_harq,
        };

        let outcome = harq.feedback(process, status, max_retx);
        let mut stats = self.stats.borrow_mut();
        if outcome != FeedbackOutcome::Unexpected {
            match (direction, status) {
                (Direction::Dl, HarqStatus::Ack) => stats.dl_acks += 1,
                (Direction::Dl, HarqStatus::Nack) => stats.dl_nacks += 1,
                (Direction::Ul, HarqStatus::Ack) => stats.ul_acks += 1,
                (Direction::Ul, HarqStatus::Nack) => stats.ul_nacks += 1,
            }
        }
        match outcome {
            FeedbackOutcome::Acked => trace!("{:?} process {} of RNTI {} acked", direction, process, rnti),
            FeedbackOutcome::Retransmit => {
                debug!("{:?} process {} of RNTI {} queued for retransmission", direction, process, rnti)
            }
            FeedbackOutcome::Dropped => {
                stats.dropped_tbs += 1;
                info!("{:?} process {} of RNTI {} dropped after the last retransmission", direction, process, rnti);
            }
            FeedbackOutcome::Unexpected => {
                warn!("{:?} HARQ feedback for idle process {} of RNTI {}", direction, process, rnti)
            }
        }
    }
}

impl PhySapUser for RoundRobinScheduler {
    fn slot_dl_indication(&mut self, slot: SlotAddress, slot_type: SlotType, phy: &mut dyn PhySapProvider) {
        let mut alloc = SlotAllocation::new(slot);
        if slot_type.has_dl() {
            alloc.push(self.get_dl_ctrl_dci());
        }
        self.schedule_dl(&mut alloc, slot_type, phy);

        if !alloc.is_empty() {
            debug!("DL allocation for {} ({}): {} descriptors", slot, slot_type, alloc.allocations.len());
            phy.set_slot_alloc_info(alloc);
        }
    }

    fn slot_ul_indication(&mut self, slot: SlotAddress, slot_type: SlotType, phy: &mut dyn PhySapProvider) {
        let mut alloc = SlotAllocation::new(slot);
        if slot_type.has_ul() {
            alloc.push(self.get_ul_ctrl_dci());
        }
        self.schedule_ul(&mut alloc, slot_type);

        if !alloc.is_empty() {
            debug!("UL allocation for {} ({}): {} descriptors", slot, slot_type, alloc.allocations.len());
            phy.set_slot_alloc_info(alloc);
        }
    }

    fn set_current_slot(&mut self, slot: SlotAddress) {
        self.current_slot = Some(slot);
    }

    fn get_dl_ctrl_dci(&self) -> DciInfo {
        DciInfo::ctrl(Direction::Dl, 0, self.config.dl_ctrl_symbols, self.config.num_rbgs)
    }

    fn get_ul_ctrl_dci(&self) -> DciInfo {
        DciInfo::ctrl(
            Direction::Ul,
            self.config.symbols_per_slot - self.config.ul_ctrl_symbols,
            self.config.ul_ctrl_symbols,
            self.config.num_rbgs,
        )
    }

    fn receive_control_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::DlHarqFeedback(info) => {
                self.harq_feedback(Direction::Dl, info.rnti, info.harq_process, info.status);
            }
            ControlMessage::DlCqi(cqi) => match self.ues.get_mut(&cqi.rnti) {
                Some(ue) => {
                    trace!("DL CQI {} from RNTI {}", cqi.wideband_cqi, cqi.rnti);
                    ue.dl_cqi = Some(cqi.wideband_cqi);
                }
                None => warn!("DL CQI from unknown UE {}", cqi.rnti),
            },
            ControlMessage::Bsr(bsr) => match self.ues.get_mut(&bsr.rnti) {
                Some(ue) => {
                    trace!("BSR of {} bytes from RNTI {}", bsr.buffer_bytes, bsr.rnti);
                    ue.ul_buffer = bsr.buffer_bytes;
                }
                None => warn!("BSR from unknown UE {}", bsr.rnti),
            },
            ControlMessage::RachPreamble { rap_id } => self.receive_rach_preamble(rap_id),
            msg @ (ControlMessage::Mib(_)
            | ControlMessage::Sib1(_)
            | ControlMessage::DlDci { .. }
            | ControlMessage::UlDci { .. }) => {
                warn!("Scheduler of cell {} ignoring {}", self.config.cell_id, msg.kind());
            }
        }
    }

    fn receive_rach_preamble(&mut self, rap_id: u32) {
        self.stats.borrow_mut().rach_received += 1;
        match u16::try_from(rap_id) {
            Ok(value) => {
                if !self.add_ue(Rnti(value)) {
                    debug!("RACH preamble {} from an already known UE", rap_id);
                }
            }
            Err(_) => warn!("RACH preamble {} outside the RNTI range", rap_id),
        }
    }

    fn ul_cqi_report(&mut self, cqi: UlCqiInfo) {
        if cqi.sinr_per_rb.is_empty() {
            return;
        }
        let mean = cqi.sinr_per_rb.iter().sum::<f64>() / cqi.sinr_per_rb.len() as f64;
        let sinr_db = linear_to_db(mean);
        trace!("UL SINR {:.1} dB in {} symbol {}", sinr_db, cqi.slot, cqi.sym_start);
        self.last_ul_sinr_db = Some(sinr_db);
    }

    fn ul_harq_feedback(&mut self, info: UlHarqInfo) {
        self.harq_feedback(Direction::Ul, info.rnti, info.harq_process, info.status);
    }

    fn receive_phy_pdu(&mut self, pdu: MacPdu) {
        trace!("Received {} bytes from RNTI {} on LCID {}", pdu.size(), pdu.rnti, pdu.lcid);
        self.stats.borrow_mut().ul_rx_bytes += pdu.size() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::AllocationStore;
    use common::Numerology;
    use interfaces::{BsrInfo, DciType, DlHarqInfo};

    fn numerology() -> Numerology {
        Numerology::new(1).unwrap()
    }

    fn slot(n: u64) -> SlotAddress {
        SlotAddress::from_normalized(n, numerology())
    }

    fn scheduler(num_rbgs: usize) -> RoundRobinScheduler {
        RoundRobinScheduler::new(SchedulerConfig::new(CellId(1), num_rbgs, 14)).unwrap()
    }

    fn data_dcis(store: &AllocationStore, n: u64, direction: Direction) -> Vec<DciInfo> {
        store
            .peek(&slot(n))
            .map(|a| {
                a.allocations
                    .iter()
                    .filter(|d| d.dci_type == DciType::Data && d.direction == direction)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn dl_harq(rnti: Rnti, process: u8, status: HarqStatus) -> ControlMessage {
        ControlMessage::DlHarqFeedback(DlHarqInfo {
            rnti,
            harq_process: process,
            num_retx: 0,
            status,
        })
    }

    #[test]
    fn test_symbol_layout() {
        let config = SchedulerConfig::new(CellId(1), 4, 14);
        assert_eq!(config.data_symbols(SlotType::Dl, Direction::Dl), Some((1, 13)));
        assert_eq!(config.data_symbols(SlotType::Dl, Direction::Ul), None);
        assert_eq!(config.data_symbols(SlotType::Special, Direction::Dl), Some((1, 12)));
        assert_eq!(config.data_symbols(SlotType::Ul, Direction::Ul), Some((0, 13)));
        assert_eq!(config.data_symbols(SlotType::Flexible, Direction::Dl), Some((1, 6)));
        assert_eq!(config.data_symbols(SlotType::Flexible, Direction::Ul), Some((7, 6)));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SchedulerConfig::new(CellId(1), 4, 3);
        assert!(config.validate().is_err());
        config.symbols_per_slot = 14;
        assert!(config.validate().is_ok());
        config.harq_processes = 17;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { name: "harq_processes", .. })
        ));
    }

    #[test]
    fn test_control_descriptors() {
        let sched = scheduler(4);
        let dl = sched.get_dl_ctrl_dci();
        assert_eq!((dl.direction, dl.sym_start, dl.num_sym), (Direction::Dl, 0, 1));
        let ul = sched.get_ul_ctrl_dci();
        assert_eq!((ul.direction, ul.sym_start, ul.num_sym), (Direction::Ul, 13, 1));
        assert_eq!(ul.rbg_bitmask, vec![true; 4]);
    }

    #[test]
    fn test_dl_indication_allocates_data_and_payload() {
        let mut sched = scheduler(4);
        sched.add_ue(Rnti(1));
        let mut store = AllocationStore::new(numerology());

        sched.slot_dl_indication(slot(2), SlotType::Flexible, &mut store);

        let alloc = store.peek(&slot(2)).unwrap();
        assert!(alloc.contains_dl_ctrl());
        let data = data_dcis(&store, 2, Direction::Dl);
        assert_eq!(data.len(), 1);
        assert_eq!((data[0].sym_start, data[0].num_sym), (1, 6));
        assert_eq!(data[0].rbg_bitmask, vec![true; 4]);
        assert!(data[0].ndi);
        assert!(store.has_burst(&slot(2), 1));
    }

    #[test]
    fn test_rbgs_split_between_ues() {
        let mut sched = scheduler(5);
        sched.add_ue(Rnti(1));
        sched.add_ue(Rnti(2));
        let mut store = AllocationStore::new(numerology());

        sched.slot_dl_indication(slot(0), SlotType::Dl, &mut store);

        let data = data_dcis(&store, 0, Direction::Dl);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].rbg_bitmask, vec![true, true, true, false, false]);
        assert_eq!(data[1].rbg_bitmask, vec![false, false, false, true, true]);
        assert!(data.iter().all(|d| d.sym_start == 1));
    }

    #[test]
    fn test_round_robin_rotates() {
        let mut config = SchedulerConfig::new(CellId(1), 4, 14);
        config.max_ues_per_slot = 1;
        let mut sched = RoundRobinScheduler::new(config).unwrap();
        sched.add_ue(Rnti(1));
        sched.add_ue(Rnti(2));
        let mut store = AllocationStore::new(numerology());

        sched.slot_dl_indication(slot(0), SlotType::Dl, &mut store);
        sched.slot_dl_indication(slot(1), SlotType::Dl, &mut store);
        sched.slot_dl_indication(slot(2), SlotType::Dl, &mut store);

        assert_eq!(data_dcis(&store, 0, Direction::Dl)[0].rnti, Rnti(1));
        assert_eq!(data_dcis(&store, 1, Direction::Dl)[0].rnti, Rnti(2));
        assert_eq!(data_dcis(&store, 2, Direction::Dl)[0].rnti, Rnti(1));
    }

    #[test]
    fn test_dl_retransmission_until_limit() {
        let mut config = SchedulerConfig::new(CellId(1), 4, 14);
        config.harq_processes = 1;
        config.max_retx = 1;
        let mut sched = RoundRobinScheduler::new(config).unwrap();
        sched.add_ue(Rnti(1));
        let mut store = AllocationStore::new(numerology());

        sched.slot_dl_indication(slot(0), SlotType::Dl, &mut store);
        // The only process waits for feedback
        sched.slot_dl_indication(slot(1), SlotType::Dl, &mut store);
        assert!(data_dcis(&store, 1, Direction::Dl).is_empty());

        sched.receive_control_message(dl_harq(Rnti(1), 0, HarqStatus::Nack));
        sched.slot_dl_indication(slot(2), SlotType::Dl, &mut store);
        let retx = &data_dcis(&store, 2, Direction::Dl)[0];
        assert_eq!((retx.rv, retx.ndi, retx.harq_process), (1, false, 0));
        assert!(store.has_burst(&slot(2), 1));

        sched.receive_control_message(dl_harq(Rnti(1), 0, HarqStatus::Nack));
        let stats = sched.stats_handle();
        assert_eq!(stats.borrow().dropped_tbs, 1);
        assert_eq!(stats.borrow().dl_retx, 1);

        // Process free again: new data
        sched.slot_dl_indication(slot(3), SlotType::Dl, &mut store);
        let fresh = &data_dcis(&store, 3, Direction::Dl)[0];
        assert_eq!((fresh.rv, fresh.ndi), (0, true));
    }

    #[test]
    fn test_ul_grants_follow_bsr() {
        let mut sched = scheduler(4);
        sched.add_ue(Rnti(1));
        let mut store = AllocationStore::new(numerology());

        sched.slot_ul_indication(slot(4), SlotType::Ul, &mut store);
        assert!(data_dcis(&store, 4, Direction::Ul).is_empty());
        assert!(store.peek(&slot(4)).is_some());

        sched.receive_control_message(ControlMessage::Bsr(BsrInfo {
            rnti: Rnti(1),
            buffer_bytes: 300,
        }));
        sched.slot_ul_indication(slot(5), SlotType::Ul, &mut store);
        sched.slot_ul_indication(slot(6), SlotType::Ul, &mut store);
        sched.slot_ul_indication(slot(7), SlotType::Ul, &mut store);

        // 300 bytes take two 256-byte blocks
        assert_eq!(data_dcis(&store, 5, Direction::Ul).len(), 1);
        assert_eq!(data_dcis(&store, 6, Direction::Ul).len(), 1);
        assert!(data_dcis(&store, 7, Direction::Ul).is_empty());
        assert_eq!(data_dcis(&store, 5, Direction::Ul)[0].sym_start, 0);
    }

    #[test]
    fn test_rach_adds_ue() {
        let mut sched = scheduler(4);
        sched.receive_rach_preamble(7);
        sched.receive_rach_preamble(7);
        sched.receive_rach_preamble(1 << 20);
        assert!(sched.has_ue(Rnti(7)));
        assert_eq!(sched.num_ues(), 1);
        assert_eq!(sched.stats_handle().borrow().rach_received, 3);
    }

    #[test]
    fn test_cqi_sets_mcs() {
        let mut sched = scheduler(4);
        sched.add_ue(Rnti(1));
        sched.receive_control_message(ControlMessage::DlCqi(interfaces::DlCqiInfo {
            rnti: Rnti(1),
            wideband_cqi: 10,
        }));
        let mut store = AllocationStore::new(numerology());
        sched.slot_dl_indication(slot(0), SlotType::Dl, &mut store);
        assert_eq!(data_dcis(&store, 0, Direction::Dl)[0].mcs, 9);
    }

    #[test]
    fn test_stray_feedback_ignored() {
        let mut sched = scheduler(4);
        sched.add_ue(Rnti(1));
        sched.receive_control_message(dl_harq(Rnti(1), 3, HarqStatus::Ack));
        sched.receive_control_message(dl_harq(Rnti(9), 0, HarqStatus::Ack));
        let stats = sched.stats_handle();
        assert_eq!(stats.borrow().dl_acks, 0);
        assert_eq!(stats.borrow().dropped_tbs, 0);
    }
}
