//! Allocation Store
//!
//! What the scheduler handed to the PHY and has not gone on air yet: slot
//! allocations in slot order, MAC PDUs grouped in bursts per (slot, start
//! symbol), and the control message pipeline that delays scheduler output by
//! the L1/L2 latency.

use common::{Direction, Numerology, Rnti, SlotAddress};
use interfaces::{ControlMessage, DciInfo, MacPdu, PhySapProvider, SlotAllocation};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

const SYM_START_MASK: u64 = 0x1F;

#[derive(Debug)]
pub struct AllocationStore {
    numerology: Numerology,
    allocations: VecDeque<SlotAllocation>,
    /// Bursts keyed by `SlotAddress::encode_with_sym_start`
    bursts: BTreeMap<u64, Vec<MacPdu>>,
    /// Front list goes on air in the current slot
    ctrl_queue: VecDeque<Vec<ControlMessage>>,
}

impl AllocationStore {
    pub fn new(numerology: Numerology) -> Self {
        Self {
            numerology,
            allocations: VecDeque::new(),
            bursts: BTreeMap::new(),
            ctrl_queue: VecDeque::from(vec![Vec::new()]),
        }
    }

    pub fn numerology(&self) -> Numerology {
        self.numerology
    }

    /// Prepare `l1l2 + 1` empty control lists
    pub fn initialize_message_list(&mut self, l1l2: u32) {
        self.ctrl_queue = (0..=l1l2).map(|_| Vec::new()).collect();
        debug!("Control pipeline initialized with {} lists", self.ctrl_queue.len());
    }

    /// Queue a message for the current slot, ahead of the pipeline delay.
    ///
    /// It goes before everything already queued for the slot except earlier
    /// broadcast messages, which keep their order.
    pub fn enqueue_ctrl_message_now(&mut self, msg: ControlMessage) {
        trace!("Enqueue {} for the current slot", msg.kind());
        match self.ctrl_queue.front_mut() {
            Some(front) => {
                let pos = front
                    .iter()
                    .take_while(|m| matches!(m, ControlMessage::Mib(_) | ControlMessage::Sib1(_)))
                    .count();
                front.insert(pos, msg);
            }
            None => self.ctrl_queue.push_back(vec![msg]),
        }
    }

    /// Take the messages of the current slot and advance the pipeline
    pub fn pop_current_ctrl(&mut self) -> Vec<ControlMessage> {
        let current = self.ctrl_queue.pop_front().unwrap_or_default();
        self.ctrl_queue.push_back(Vec::new());
        current
    }

    /// Messages waiting for the current slot
    pub fn current_ctrl(&self) -> &[ControlMessage] {
        self.ctrl_queue.front().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ctrl_pipeline_len(&self) -> usize {
        self.ctrl_queue.len()
    }

    pub fn peek(&self, slot: &SlotAddress) -> Option<&SlotAllocation> {
        self.allocations
            .iter()
            .find(|a| a.slot.normalize() == slot.normalize())
    }

    pub fn front(&self) -> Option<&SlotAllocation> {
        self.allocations.front()
    }

    pub fn pending(&self) -> usize {
        self.allocations.len()
    }

    /// Remove the allocation of `slot`, dropping anything older that lapsed
    pub fn retrieve(&mut self, slot: &SlotAddress) -> Option<SlotAllocation> {
        let target = slot.normalize();
        while let Some(front) = self.allocations.front() {
            let front_slot = front.slot.normalize();
            if front_slot < target {
                warn!(
                    "Dropping stale allocation for slot {} (current {})",
                    front.slot, slot
                );
                let stale = front.slot;
                self.allocations.pop_front();
                self.drop_bursts(&stale);
            } else if front_slot == target {
                return self.allocations.pop_front();
            } else {
                break;
            }
        }
        None
    }

    /// Retry the descriptors of `alloc` in `new_slot`.
    ///
    /// Queued allocations never move, terminals may already hold DCIs for
    /// them. A retried descriptor joins the allocation of `new_slot` only if
    /// its symbols are free there; a control descriptor already present is
    /// not duplicated. PDUs of the joining DL data follow it, every other PDU
    /// queued for the old slot is dropped. Returns the data descriptors that
    /// did not fit.
    pub fn push_front(&mut self, alloc: SlotAllocation, new_slot: SlotAddress) -> Vec<DciInfo> {
        let old_slot = alloc.slot;
        let target = new_slot.normalize();
        let pos = self
            .allocations
            .partition_point(|a| a.slot.normalize() < target);
        let occupied: Vec<DciInfo> = match self.allocations.get(pos) {
            Some(queued) if queued.slot.normalize() == target => queued.allocations.clone(),
            _ => {
                self.allocations.insert(pos, SlotAllocation::new(new_slot));
                Vec::new()
            }
        };

        let mut joined = Vec::new();
        let mut rejected = Vec::new();
        for dci in alloc.allocations {
            if dci.is_ctrl()
                && occupied
                    .iter()
                    .any(|q| q.is_ctrl() && q.direction == dci.direction && q.sym_start == dci.sym_start)
            {
                trace!("{:?} control at symbol {} already in slot {}", dci.direction, dci.sym_start, new_slot);
                continue;
            }
            if occupied.iter().any(|q| overlaps(q, &dci)) {
                debug!(
                    "{:?} {:?} of RNTI {} at symbols {}+{} does not fit in slot {}",
                    dci.dci_type, dci.direction, dci.rnti, dci.sym_start, dci.num_sym, new_slot
                );
                if dci.is_data() {
                    rejected.push(dci);
                }
                continue;
            }
            joined.push(dci);
        }

        debug!(
            "Re-queueing {} descriptors of slot {} for slot {} ({} rejected)",
            joined.len(),
            old_slot,
            new_slot,
            rejected.len()
        );
        self.move_bursts(&old_slot, new_slot, &joined);
        if let Some(queued) = self.allocations.get_mut(pos) {
            for dci in joined {
                queued.push(dci);
            }
            if queued.is_empty() {
                self.allocations.remove(pos);
            }
        }
        rejected
    }

    /// Drop the PDUs of `rnti` in the burst of (slot, sym_start)
    pub fn drop_pdus(&mut self, slot: &SlotAddress, sym_start: u8, rnti: Rnti) -> usize {
        let key = slot.encode_with_sym_start(sym_start);
        let Some(burst) = self.bursts.get_mut(&key) else {
            return 0;
        };
        let before = burst.len();
        burst.retain(|pdu| pdu.rnti != rnti);
        let dropped = before - burst.len();
        if burst.is_empty() {
            self.bursts.remove(&key);
        }
        dropped
    }

    /// Remove the burst of (slot, sym_start)
    pub fn take_burst(&mut self, slot: &SlotAddress, sym_start: u8) -> Option<Vec<MacPdu>> {
        self.bursts.remove(&slot.encode_with_sym_start(sym_start))
    }

    pub fn has_burst(&self, slot: &SlotAddress, sym_start: u8) -> bool {
        self.bursts
            .contains_key(&slot.encode_with_sym_start(sym_start))
    }

    fn slot_keys(&self, slot: &SlotAddress) -> Vec<u64> {
        let base = slot.encode_with_sym_start(0);
        self.bursts
            .keys()
            .filter(|key| *key & !SYM_START_MASK == base)
            .copied()
            .collect()
    }

    fn drop_bursts(&mut self, slot: &SlotAddress) {
        for key in self.slot_keys(slot) {
            if let Some(burst) = self.bursts.remove(&key) {
                warn!("Dropping {} queued PDUs of lapsed slot {}", burst.len(), slot);
            }
        }
    }

    /// Move the PDUs of the DL data in `joined` from `old` to `new`, drop the rest of `old`
    fn move_bursts(&mut self, old: &SlotAddress, new: SlotAddress, joined: &[DciInfo]) {
        for key in self.slot_keys(old) {
            let Some(burst) = self.bursts.remove(&key) else {
                continue;
            };
            let sym_start = (key & SYM_START_MASK) as u8;
            let (moved, dropped): (Vec<MacPdu>, Vec<MacPdu>) = burst.into_iter().partition(|pdu| {
                joined.iter().any(|d| {
                    d.is_data() && d.direction == Direction::Dl && d.rnti == pdu.rnti && d.sym_start == sym_start
                })
            });
            if !dropped.is_empty() {
                warn!("Dropping {} PDUs of slot {} symbol {}", dropped.len(), old, sym_start);
            }
            if moved.is_empty() {
                continue;
            }
            self.bursts
                .entry(new.encode_with_sym_start(sym_start))
                .or_default()
                .extend(moved.into_iter().map(|mut pdu| {
                    pdu.slot = new;
                    pdu
                }));
        }
    }
}

fn overlaps(a: &DciInfo, b: &DciInfo) -> bool {
    a.sym_start < b.sym_end() && b.sym_start < a.sym_end()
}

impl PhySapProvider for AllocationStore {
    fn set_slot_alloc_info(&mut self, alloc: SlotAllocation) {
        let target = alloc.slot.normalize();
        trace!(
            "Queueing allocation for slot {} with {} descriptors",
            alloc.slot,
            alloc.allocations.len()
        );
        if let Some(existing) = self
            .allocations
            .iter_mut()
            .find(|a| a.slot.normalize() == target)
        {
            existing.merge(alloc);
            return;
        }
        let pos = self
            .allocations
            .partition_point(|a| a.slot.normalize() < target);
        self.allocations.insert(pos, alloc);
    }

    fn send_mac_pdu(&mut self, pdu: MacPdu) {
        let key = pdu.slot.encode_with_sym_start(pdu.sym_start);
        trace!(
            "PDU of {} bytes for RNTI {} in slot {} symbol {}",
            pdu.size(),
            pdu.rnti,
            pdu.slot,
            pdu.sym_start
        );
        self.bursts.entry(key).or_default().push(pdu);
    }

    fn enqueue_ctrl_message(&mut self, msg: ControlMessage) {
        trace!("Enqueue {} behind the L1/L2 latency", msg.kind());
        match self.ctrl_queue.back_mut() {
            Some(back) => back.push(msg),
            None => self.ctrl_queue.push_back(vec![msg]),
        }
    }

    fn slot_alloc_info_exists(&self, slot: &SlotAddress) -> bool {
        self.peek(slot).is_some()
    }
}
