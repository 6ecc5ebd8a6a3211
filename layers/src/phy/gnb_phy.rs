//! gNB Slot Engine
//!
//! Drives one carrier slot by slot: asks the scheduler for future slots
//! following the compiled timing tables, acquires the medium when the current
//! slot has something to send, and lays the slot's descriptors out in time on
//! the radio. Inbound indications from the radio are routed back to the
//! scheduler.

use super::{
    tx_psd, AllocationStore, ChannelAccess, ChannelStatus, ExpectedTb, PhyConfig, PhyContext,
    PhyEvent, PhyStats, Radio, RxIndication, TimingMaps,
};
use crate::LayerError;
use common::{Direction, ProtocolViolation, Rnti, SlotAddress};
use interfaces::{
    AccessResponse, ChannelAccessManager, ControlMessage, DciInfo, DciType, DlHarqInfo,
    HarqStatus, MacPdu, MibInfo, PhySapProvider, PhySapUser, Sib1Info, SlotAllocation, UlCqiInfo,
    UlHarqInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const ONE_NS: Duration = Duration::from_nanos(1);

/// Slot engine of one carrier
pub struct GnbPhy<R: Radio> {
    config: PhyConfig,
    timing: TimingMaps,
    radio: R,
    mac: Box<dyn PhySapUser>,
    cam: Box<dyn ChannelAccessManager>,
    channel: ChannelAccess,
    store: AllocationStore,
    current_slot: SlotAddress,
    last_slot_start: Duration,
    curr_alloc: SlotAllocation,
    curr_sym_start: u8,
    /// Union of DL data RBGs per start symbol of the current slot
    rbg_per_sym: BTreeMap<u8, Vec<bool>>,
    /// Control messages going out in the current slot
    ctrl_msgs: Vec<ControlMessage>,
    ue_attached: BTreeSet<Rnti>,
    /// Data descriptors whose DCI went on air: (normalized slot, sym_start, rnti)
    announced: BTreeSet<(u64, u8, Rnti)>,
    sib1: Sib1Info,
    stats: PhyStats,
}

impl<R: Radio> GnbPhy<R> {
    pub fn new(
        config: PhyConfig,
        mut radio: R,
        mac: Box<dyn PhySapUser>,
        cam: Box<dyn ChannelAccessManager>,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        if radio.cell_id() != config.cell_id {
            return Err(LayerError::InvalidConfiguration(format!(
                "radio belongs to cell {}, engine to cell {}",
                radio.cell_id(),
                config.cell_id
            )));
        }

        let timing = TimingMaps::compile(&config.pattern, config.delays)?;
        let all_rbs: Vec<usize> = (0..config.num_rbs).collect();
        radio.set_tx_power_spectral_density(tx_psd(&all_rbs, config.num_rbs, config.tx_power_dbm));

        let start = SlotAddress::from_normalized(0, config.numerology);
        info!(
            "gNB PHY for cell {} using channel access manager '{}'",
            config.cell_id,
            cam.name()
        );

        Ok(Self {
            timing,
            radio,
            mac,
            cam,
            channel: ChannelAccess::new(),
            store: AllocationStore::new(config.numerology),
            current_slot: start,
            last_slot_start: Duration::ZERO,
            curr_alloc: SlotAllocation::new(start),
            curr_sym_start: 0,
            rbg_per_sym: BTreeMap::new(),
            ctrl_msgs: Vec::new(),
            ue_attached: BTreeSet::new(),
            announced: BTreeSet::new(),
            sib1: Sib1Info {
                cell_id: config.cell_id,
                tdd_pattern: config.pattern.to_string(),
            },
            stats: PhyStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    pub fn timing(&self) -> &TimingMaps {
        &self.timing
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn stats(&self) -> &PhyStats {
        &self.stats
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn current_slot(&self) -> SlotAddress {
        self.current_slot
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    pub fn is_ue_attached(&self, rnti: Rnti) -> bool {
        self.ue_attached.contains(&rnti)
    }

    /// Register a UE; returns false if it was already attached
    pub fn add_ue(&mut self, rnti: Rnti) -> bool {
        let added = self.ue_attached.insert(rnti);
        if added {
            info!("UE {} attached to cell {}", rnti, self.config.cell_id);
        } else {
            warn!("UE {} already attached to cell {}", rnti, self.config.cell_id);
        }
        added
    }

    pub fn remove_ue(&mut self, rnti: Rnti) -> Result<(), LayerError> {
        if !self.ue_attached.remove(&rnti) {
            return Err(ProtocolViolation::UnknownUe(rnti.value()).into());
        }
        info!("UE {} detached from cell {}", rnti, self.config.cell_id);
        Ok(())
    }

    /// Start ticking at (frame, subframe, slot)
    pub fn start_event_loop(
        &mut self,
        ctx: &mut PhyContext<'_>,
        frame: u32,
        subframe: u8,
        slot: u8,
    ) -> Result<(), LayerError> {
        let start = SlotAddress::new(frame, subframe, slot, self.config.numerology.value())?;
        info!(
            "PHY starting at {}: cell {} tx power {} dBm, noise figure {} dB, n0 {} n1 {} n2 {}, \
             L1/L2 latency {}, TB decode latency {:?}, numerology {}, {} symbols per slot, \
             pattern {}, {} RBs",
            start,
            self.config.cell_id,
            self.config.tx_power_dbm,
            self.config.noise_figure_db,
            self.config.delays.n0,
            self.config.delays.n1,
            self.config.delays.n2,
            self.config.delays.l1l2_ctrl_latency,
            self.config.tb_decode_latency,
            self.config.numerology,
            self.config.symbols_per_slot,
            self.config.pattern,
            self.config.num_rbs
        );

        self.store
            .initialize_message_list(self.config.delays.l1l2_ctrl_latency);
        self.prime_control_allocations(start);
        self.start_slot(ctx, start)
    }

    /// Control-only allocations for the first slots, which no earlier slot
    /// generates through the scheduler.
    fn prime_control_allocations(&mut self, start: SlotAddress) {
        for offset in 0..u64::from(self.timing.max_generate_offset()) {
            let target = start.add(offset);
            let slot_type = self.config.pattern.slot_type(&target);
            let mut alloc = SlotAllocation::new(target);

            if slot_type.has_dl() && !self.generated_by_mac(start, offset, Direction::Dl) {
                alloc.push(self.mac.get_dl_ctrl_dci());
            }
            if slot_type.has_ul() && !self.generated_by_mac(start, offset, Direction::Ul) {
                alloc.push(self.mac.get_ul_ctrl_dci());
            }
            if !alloc.is_empty() {
                debug!("Priming slot {} ({}) with control", target, slot_type);
                self.store.set_slot_alloc_info(alloc);
            }
        }
    }

    fn generated_by_mac(&self, start: SlotAddress, offset: u64, direction: Direction) -> bool {
        let table = match direction {
            Direction::Dl => &self.timing.generate_dl,
            Direction::Ul => &self.timing.generate_ul,
        };
        (0..=offset).any(|from| {
            let pos = self.config.pattern.position(&start.add(from));
            table[pos].iter().any(|k| u64::from(*k) == offset - from)
        })
    }

    /// Dispatch one event addressed to this engine
    pub fn handle_event(&mut self, ctx: &mut PhyContext<'_>, event: PhyEvent) -> Result<(), LayerError> {
        trace!("Cell {} handling {}", self.config.cell_id, event.name());
        match event {
            PhyEvent::StartSlot(slot) => self.start_slot(ctx, slot)?,
            PhyEvent::EndSlot => self.end_slot(ctx),
            PhyEvent::StartVarTti(dci) => self.start_var_tti(ctx, dci)?,
            PhyEvent::EndVarTti(dci) => trace!(
                "DCI from symbol {} lasting {} symbols finished",
                dci.sym_start,
                dci.num_sym
            ),
            PhyEvent::SendDataChannels {
                dci,
                burst,
                duration,
            } => self.send_data_channels(ctx, &dci, burst, duration)?,
            PhyEvent::ChannelAccessGranted(duration) => self.channel_access_granted(ctx, duration),
            PhyEvent::ChannelAccessDenied => self.channel_access_denied(ctx),
            PhyEvent::ChannelAccessLost => self.channel.lost(),
            PhyEvent::DeliverPdu(pdu) => self.mac.receive_phy_pdu(pdu),
            event @ (PhyEvent::StartRx(_)
            | PhyEvent::EndRxData
            | PhyEvent::EndRxCtrl
            | PhyEvent::EndTx
            | PhyEvent::CheckIfStillBusy) => self.radio.handle_event(ctx, event)?,
            other => {
                return Err(ProtocolViolation::UnexpectedEvent {
                    event: other.name(),
                    state: self.channel.status().to_string(),
                }
                .into());
            }
        }
        self.process_indications(ctx);
        Ok(())
    }

    /// Grant delivered by the channel access manager
    pub fn channel_access_granted(&mut self, ctx: &mut PhyContext<'_>, duration: Duration) {
        if self
            .channel
            .grant(ctx, duration, self.config.slot_period())
        {
            self.stats.grants += 1;
        }
    }

    /// Denial delivered by the channel access manager
    pub fn channel_access_denied(&mut self, ctx: &mut PhyContext<'_>) {
        self.stats.denials += 1;
        self.channel.deny(ctx);
    }

    fn request_channel(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        self.channel.request()?;
        self.stats.access_requests += 1;
        match self.cam.request_access(ctx.now()) {
            AccessResponse::Granted(duration) => self.channel_access_granted(ctx, duration),
            AccessResponse::Denied => self.channel_access_denied(ctx),
            AccessResponse::Deferred {
                after,
                grant: Some(duration),
            } => {
                ctx.schedule(after, PhyEvent::ChannelAccessGranted(duration));
            }
            AccessResponse::Deferred { after, grant: None } => {
                ctx.schedule(after, PhyEvent::ChannelAccessDenied);
            }
            AccessResponse::Pending => debug!("Channel access decision pending"),
        }
        Ok(())
    }

    fn queue_mib(&mut self) {
        debug!("Queueing MIB in slot {}", self.current_slot);
        self.store
            .enqueue_ctrl_message_now(ControlMessage::Mib(MibInfo {
                system_frame: self.current_slot.frame(),
                scs_common_khz: self.config.numerology.scs_khz(),
            }));
    }

    fn queue_sib(&mut self) {
        debug!("Queueing SIB1 in slot {}", self.current_slot);
        self.store
            .enqueue_ctrl_message_now(ControlMessage::Sib1(self.sib1.clone()));
    }

    fn call_mac_for_slot_indication(&mut self, current: SlotAddress) {
        self.mac.set_current_slot(current);
        let pos = self.config.pattern.position(&current);
        trace!(
            "Slot {} in position {} of type {}",
            current,
            pos,
            self.config.pattern.slots()[pos]
        );

        for k in &self.timing.generate_ul[pos] {
            let target = current.add(u64::from(*k));
            let slot_type = self.config.pattern.slot_type(&target);
            debug!("In slot {} generate UL for {} of type {}", current, target, slot_type);
            self.mac.slot_ul_indication(target, slot_type, &mut self.store);
        }
        for k in &self.timing.generate_dl[pos] {
            let target = current.add(u64::from(*k));
            let slot_type = self.config.pattern.slot_type(&target);
            debug!("In slot {} generate DL for {} of type {}", current, target, slot_type);
            self.mac.slot_dl_indication(target, slot_type, &mut self.store);
        }
    }

    fn start_slot(&mut self, ctx: &mut PhyContext<'_>, slot: SlotAddress) -> Result<(), LayerError> {
        if self.channel.status() == ChannelStatus::ToLose {
            return Err(LayerError::InvalidState(format!(
                "slot {} started while the channel is {}",
                slot,
                self.channel.status()
            )));
        }

        self.current_slot = slot;
        self.last_slot_start = ctx.now();
        self.announced = self.announced.split_off(&(slot.normalize(), 0, Rnti(0)));
        self.stats.slots += 1;
        ctx.schedule(self.config.slot_period(), PhyEvent::EndSlot);

        self.curr_alloc = match self.store.retrieve(&slot) {
            Some(alloc) => alloc,
            None => {
                debug!("No allocation for slot {}, using an empty one", slot);
                SlotAllocation::new(slot)
            }
        };

        if self.config.is_primary && slot.slot() == 0 {
            match slot.subframe() {
                0 => self.queue_mib(),
                5 => self.queue_sib(),
                _ => {}
            }
        }

        if self.channel.is_granted() {
            trace!("Channel granted");
            self.stats.granted_slots += 1;
            self.call_mac_for_slot_indication(slot);
            return self.do_start_slot(ctx);
        }

        let n2 = self.config.delays.n2;
        let has_ul_dci = n2 > 0
            && self
                .store
                .peek(&slot.add(u64::from(n2)))
                .is_some_and(SlotAllocation::contains_data);

        if self.curr_alloc.contains_data() || self.curr_alloc.contains_dl_ctrl() || has_ul_dci {
            if self.channel.status() == ChannelStatus::None {
                debug!("Channel not granted, requesting it");
                self.request_channel(ctx)?;
                if self.channel.is_granted() {
                    self.stats.granted_slots += 1;
                    self.call_mac_for_slot_indication(slot);
                    return self.do_start_slot(ctx);
                }
            }

            let next = slot.add(1);
            debug!(
                "Re-queueing allocation of slot {} for {} ({})",
                slot,
                next,
                if self.curr_alloc.contains_data() {
                    "has data"
                } else {
                    "has control"
                }
            );
            self.stats.requeued_allocations += 1;
            // The scheduler fills the next slots first so the retry only
            // takes symbols left free there
            self.call_mac_for_slot_indication(slot);
            self.defer_current_allocation(next);
        } else {
            trace!("Empty slot {}, asking the scheduler for future slots", slot);
            self.call_mac_for_slot_indication(slot);
        }

        // Receiving needs no channel
        self.drop_unannounced_data();
        let symbol = self.config.symbol_period();
        for dci in self
            .curr_alloc
            .allocations
            .iter()
            .filter(|a| a.direction == Direction::Ul)
        {
            ctx.schedule(
                symbol * u32::from(dci.sym_start),
                PhyEvent::StartVarTti(dci.clone()),
            );
        }
        Ok(())
    }

    fn do_start_slot(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        if self.curr_alloc.is_empty() {
            return Ok(());
        }
        debug!(
            "Start slot {} of type {} with {} descriptors",
            self.current_slot,
            self.config.pattern.slot_type(&self.current_slot),
            self.curr_alloc.allocations.len()
        );

        self.retrieve_ctrl_msgs()?;
        self.drop_unannounced_data();
        self.check_or_release_channel();
        self.prepare_rbg_allocation_map();
        self.fill_the_event(ctx);
        Ok(())
    }

    fn check_or_release_channel(&mut self) {
        let last_dl_symbol = self.curr_alloc.last_dl_data_symbol().unwrap_or(0);
        let last_data_time = self.config.symbol_period() * u32::from(last_dl_symbol);
        let remaining = self.config.slot_period().saturating_sub(last_data_time);

        if remaining < self.config.guard_interval {
            debug!(
                "DL data ends at symbol {}, {:?} left in the slot, releasing the channel",
                last_dl_symbol, remaining
            );
            self.channel.mark_to_lose();
        } else {
            trace!(
                "DL data ends at symbol {}, {:?} left in the slot, keeping the channel",
                last_dl_symbol,
                remaining
            );
        }
    }

    fn retrieve_ctrl_msgs(&mut self) -> Result<(), LayerError> {
        let mut msgs = self.store.pop_current_ctrl();
        let dcis = self.dci_messages()?;
        if self.curr_alloc.contains_dl_ctrl() {
            for msg in &dcis {
                let (dci, target) = match msg {
                    ControlMessage::DlDci { dci, k0, .. } => (dci, self.current_slot.add(u64::from(*k0))),
                    ControlMessage::UlDci { dci, k2 } => (dci, self.current_slot.add(u64::from(*k2))),
                    _ => continue,
                };
                self.announced.insert((target.normalize(), dci.sym_start, dci.rnti));
            }
        }
        msgs.extend(dcis);
        self.ctrl_msgs = msgs;
        Ok(())
    }

    fn is_announced(&self, slot: SlotAddress, dci: &DciInfo) -> bool {
        self.announced
            .contains(&(slot.normalize(), dci.sym_start, dci.rnti))
    }

    /// Data of the current slot whose DCI never went on air lapses
    fn drop_unannounced_data(&mut self) {
        let slot = self.current_slot;
        let (keep, lapsed): (Vec<DciInfo>, Vec<DciInfo>) = std::mem::take(&mut self.curr_alloc.allocations)
            .into_iter()
            .partition(|dci| dci.is_ctrl() || self.is_announced(slot, dci));
        self.curr_alloc.allocations = keep;
        for dci in lapsed {
            self.lapse_data(&dci, slot, "its DCI never went out");
        }
    }

    /// Split the allocation of a slot that goes without the channel.
    ///
    /// UL descriptors stay, they only need the receiver. DL data the UEs
    /// already expect in this slot lapses, as does DL data the next slot
    /// cannot carry with the same symbol layout. The rest is retried in
    /// `next` on the symbols left free there.
    fn defer_current_allocation(&mut self, next: SlotAddress) {
        let slot = self.current_slot;
        let same_layout = self.config.pattern.slot_type(&next) == self.config.pattern.slot_type(&slot);
        let mut retry = SlotAllocation::new(slot);
        let mut stay = Vec::new();

        for dci in std::mem::take(&mut self.curr_alloc.allocations) {
            if dci.direction == Direction::Ul {
                stay.push(dci);
            } else if dci.is_ctrl() {
                retry.push(dci);
            } else if self.is_announced(slot, &dci) {
                self.lapse_data(&dci, slot, "it was announced for this slot");
            } else if !same_layout {
                self.lapse_data(&dci, slot, "the next slot has another layout");
            } else {
                retry.push(dci);
            }
        }
        self.curr_alloc.allocations = stay;

        for dci in self.store.push_front(retry, next) {
            self.lapse_data(&dci, slot, "the next slot has no room for it");
        }
    }

    /// Give up on a data descriptor; the scheduler sees a NACK and retransmits
    fn lapse_data(&mut self, dci: &DciInfo, slot: SlotAddress, reason: &str) {
        debug!(
            "{:?} data of RNTI {} in slot {} symbols {}+{} lapses: {}",
            dci.direction, dci.rnti, slot, dci.sym_start, dci.num_sym, reason
        );
        self.stats.lapsed_data += 1;
        match dci.direction {
            Direction::Dl => {
                self.store.drop_pdus(&slot, dci.sym_start, dci.rnti);
                self.mac
                    .receive_control_message(ControlMessage::DlHarqFeedback(DlHarqInfo {
                        rnti: dci.rnti,
                        harq_process: dci.harq_process,
                        num_retx: dci.rv,
                        status: HarqStatus::Nack,
                    }));
            }
            Direction::Ul => self.mac.ul_harq_feedback(UlHarqInfo {
                rnti: dci.rnti,
                harq_process: dci.harq_process,
                num_retx: dci.rv,
                status: HarqStatus::Nack,
            }),
        }
    }

    /// DCIs going out in the current slot, per the send tables
    fn dci_messages(&self) -> Result<Vec<ControlMessage>, LayerError> {
        let current = self.current_slot;
        let pos = self.config.pattern.position(&current);
        let mut msgs = Vec::new();

        for k0 in &self.timing.send_dl[pos] {
            let target = current.add(u64::from(*k0));
            let k1 = self.timing.harq_feedback[self.config.pattern.position(&target)]
                .unwrap_or(self.config.delays.n1);
            for dci in self.data_dcis(target, *k0, Direction::Dl)? {
                trace!("DL DCI for RNTI {} in {} (k0 {}, k1 {})", dci.rnti, target, k0, k1);
                msgs.push(ControlMessage::DlDci { dci, k0: *k0, k1 });
            }
        }

        for k2 in &self.timing.send_ul[pos] {
            let target = current.add(u64::from(*k2));
            for dci in self.data_dcis(target, *k2, Direction::Ul)? {
                trace!("UL DCI for RNTI {} in {} (k2 {})", dci.rnti, target, k2);
                msgs.push(ControlMessage::UlDci { dci, k2: *k2 });
            }
        }
        Ok(msgs)
    }

    fn data_dcis(&self, target: SlotAddress, k: u32, direction: Direction) -> Result<Vec<DciInfo>, LayerError> {
        let alloc = if k == 0 {
            Some(&self.curr_alloc)
        } else {
            self.store.peek(&target)
        };
        let Some(alloc) = alloc else {
            trace!("No allocation found for slot {}", target);
            return Ok(Vec::new());
        };

        let mut dcis = Vec::new();
        for dci in alloc
            .allocations
            .iter()
            .filter(|a| a.is_data() && a.direction == direction)
        {
            if dci.tb_size == 0 || dci.sym_end() > self.config.symbols_per_slot {
                return Err(ProtocolViolation::InvalidDescriptor(format!(
                    "RNTI {} symbols {}+{} tb {} in a {}-symbol slot",
                    dci.rnti, dci.sym_start, dci.num_sym, dci.tb_size, self.config.symbols_per_slot
                ))
                .into());
            }
            dcis.push(dci.clone());
        }
        Ok(dcis)
    }

    fn prepare_rbg_allocation_map(&mut self) {
        self.rbg_per_sym.clear();
        for dci in self
            .curr_alloc
            .allocations
            .iter()
            .filter(|a| a.is_data() && a.direction == Direction::Dl)
        {
            let entry = self
                .rbg_per_sym
                .entry(dci.sym_start)
                .or_insert_with(|| vec![false; dci.rbg_bitmask.len()]);
            if entry.len() < dci.rbg_bitmask.len() {
                entry.resize(dci.rbg_bitmask.len(), false);
            }
            for (used, bit) in entry.iter_mut().zip(&dci.rbg_bitmask) {
                *used |= *bit;
            }
        }
    }

    fn fill_the_event(&mut self, ctx: &mut PhyContext<'_>) {
        let symbol = self.config.symbol_period();
        let mut last_sym_start = 0;
        let mut use_next_allocation_same_symbol = true;

        for dci in std::mem::take(&mut self.curr_alloc.allocations) {
            if last_sym_start == dci.sym_start && !use_next_allocation_same_symbol {
                trace!(
                    "Skipping {:?} {:?} at symbol {}, already covered by the DL burst",
                    dci.dci_type,
                    dci.direction,
                    dci.sym_start
                );
                continue;
            }
            use_next_allocation_same_symbol = true;

            let start = symbol * u32::from(dci.sym_start);
            last_sym_start = dci.sym_start;
            // Later descriptors starting on this symbol ride in the same DL burst
            if dci.direction == Direction::Dl {
                use_next_allocation_same_symbol = false;
            }
            trace!("Scheduling {:?} {:?} at {:?}", dci.dci_type, dci.direction, start);
            ctx.schedule(start, PhyEvent::StartVarTti(dci));
        }
    }

    fn start_var_tti(&mut self, ctx: &mut PhyContext<'_>, dci: DciInfo) -> Result<(), LayerError> {
        self.curr_sym_start = dci.sym_start;
        let period = match (dci.dci_type, dci.direction) {
            (DciType::Ctrl, Direction::Dl) => self.dl_ctrl(ctx, &dci)?,
            (DciType::Ctrl, Direction::Ul) => self.ul_ctrl(&dci),
            (DciType::Data, Direction::Dl) => self.dl_data(ctx, &dci)?,
            (DciType::Data, Direction::Ul) => self.ul_data(&dci)?,
        };
        ctx.schedule(period, PhyEvent::EndVarTti(dci));
        Ok(())
    }

    fn dl_ctrl(&mut self, ctx: &mut PhyContext<'_>, dci: &DciInfo) -> Result<Duration, LayerError> {
        let period = self.config.symbol_period() * u32::from(dci.num_sym);
        if self.ctrl_msgs.is_empty() {
            trace!("No control messages in slot {}, skipping DL CTRL", self.current_slot);
            return Ok(period);
        }

        let msgs = std::mem::take(&mut self.ctrl_msgs);
        debug!(
            "Cell {} sending DL CTRL with {} messages in slot {} ({})",
            self.config.cell_id,
            msgs.len(),
            self.current_slot,
            msgs.iter().map(ControlMessage::kind).collect::<Vec<_>>().join(",")
        );
        let all_rbs: Vec<usize> = (0..self.config.num_rbs).collect();
        self.radio.set_tx_power_spectral_density(tx_psd(
            &all_rbs,
            self.config.num_rbs,
            self.config.tx_power_dbm,
        ));
        // Ends 1 ns early so the data region starts on a clean channel
        self.radio
            .start_tx_ctrl_frames(ctx, msgs, period.saturating_sub(ONE_NS))?;
        self.stats.dl_ctrl_bursts += 1;
        Ok(period)
    }

    fn ul_ctrl(&self, dci: &DciInfo) -> Duration {
        let period = self.config.symbol_period() * u32::from(dci.num_sym);
        trace!(
            "Receiving UL CTRL in slot {} symbols {}-{}",
            self.current_slot,
            dci.sym_start,
            dci.sym_end().saturating_sub(1)
        );
        period
    }

    fn dl_data(&mut self, ctx: &mut PhyContext<'_>, dci: &DciInfo) -> Result<Duration, LayerError> {
        let period = self.config.symbol_period() * u32::from(dci.num_sym);
        let missing = || ProtocolViolation::MissingPayload {
            rnti: dci.rnti.value(),
            slot: self.current_slot.to_string(),
            sym_start: dci.sym_start,
        };

        let burst = self
            .store
            .take_burst(&self.current_slot, dci.sym_start)
            .filter(|b| !b.is_empty())
            .ok_or_else(missing)?;
        if !burst.iter().any(|pdu| pdu.rnti == dci.rnti) {
            return Err(missing().into());
        }

        debug!(
            "Cell {} sending DL DATA with {} PDUs in slot {} symbols {}-{}",
            self.config.cell_id,
            burst.len(),
            self.current_slot,
            dci.sym_start,
            dci.sym_end().saturating_sub(1)
        );
        ctx.schedule(
            ONE_NS,
            PhyEvent::SendDataChannels {
                dci: dci.clone(),
                burst,
                duration: period.saturating_sub(ONE_NS * 2),
            },
        );
        self.stats.dl_data_bursts += 1;
        Ok(period)
    }

    fn ul_data(&mut self, dci: &DciInfo) -> Result<Duration, LayerError> {
        if !self.ue_attached.contains(&dci.rnti) {
            return Err(ProtocolViolation::UnknownUe(dci.rnti.value()).into());
        }
        let period = self.config.symbol_period() * u32::from(dci.num_sym);
        let mut expected = ExpectedTb::from_dci(dci, self.config.rbs_per_rbg);
        expected.rb_map.retain(|rb| *rb < self.config.num_rbs);
        debug!(
            "Expecting UL DATA from RNTI {} in slot {} symbols {}-{}",
            dci.rnti,
            self.current_slot,
            dci.sym_start,
            dci.sym_end().saturating_sub(1)
        );
        self.radio.add_expected_tb(expected);
        self.stats.ul_data_expected += 1;
        Ok(period)
    }

    fn send_data_channels(
        &mut self,
        ctx: &mut PhyContext<'_>,
        dci: &DciInfo,
        burst: Vec<MacPdu>,
        duration: Duration,
    ) -> Result<(), LayerError> {
        if !self.ue_attached.contains(&dci.rnti) {
            return Err(ProtocolViolation::UnknownUe(dci.rnti.value()).into());
        }

        let bitmask = self
            .rbg_per_sym
            .get(&dci.sym_start)
            .unwrap_or(&dci.rbg_bitmask);
        let rbs: Vec<usize> = bitmask
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .flat_map(|(rbg, _)| rbg * self.config.rbs_per_rbg..(rbg + 1) * self.config.rbs_per_rbg)
            .filter(|rb| *rb < self.config.num_rbs)
            .collect();
        self.radio.set_tx_power_spectral_density(tx_psd(
            &rbs,
            self.config.num_rbs,
            self.config.tx_power_dbm,
        ));
        self.radio
            .start_tx_data_frames(ctx, burst, Vec::new(), duration)
    }

    fn end_slot(&mut self, ctx: &mut PhyContext<'_>) {
        let to_next_slot = (self.last_slot_start + self.config.slot_period()).saturating_sub(ctx.now());
        self.channel.end_slot(ctx);
        trace!("Slot {} started at {:?} ended", self.current_slot, self.last_slot_start);
        let next = self.current_slot.add(1);
        ctx.schedule(to_next_slot, PhyEvent::StartSlot(next));
    }

    fn process_indications(&mut self, ctx: &mut PhyContext<'_>) {
        for indication in self.radio.drain_indications() {
            match indication {
                RxIndication::DataReceived(pdu) => {
                    ctx.schedule(self.config.tb_decode_latency, PhyEvent::DeliverPdu(pdu));
                }
                RxIndication::CtrlReceived(msgs) => {
                    for msg in msgs {
                        self.dispatch_ctrl_message(msg);
                    }
                }
                RxIndication::UlHarqFeedback(info) => {
                    if self.ue_attached.contains(&info.rnti) {
                        debug!(
                            "UL HARQ {:?} from RNTI {} process {}, forwarding to the scheduler",
                            info.status, info.rnti, info.harq_process
                        );
                        self.stats.ul_harq_forwarded += 1;
                        self.mac.ul_harq_feedback(info);
                    }
                }
                RxIndication::DlHarqFeedback(info) => {
                    warn!("Ignoring DL HARQ indication for RNTI {} at the gNB", info.rnti);
                }
                RxIndication::SinrReport(sinr_per_rb) => {
                    self.mac.ul_cqi_report(UlCqiInfo {
                        slot: self.current_slot,
                        sym_start: self.curr_sym_start,
                        sinr_per_rb,
                    });
                }
                RxIndication::PacketTrace(trace) => {
                    if trace.corrupted {
                        self.stats.rx_corrupted += 1;
                    } else {
                        self.stats.rx_ok += 1;
                    }
                    debug!(
                        "UL TB RNTI {} slot {} size {} mcs {} rv {} sinr {:.2} corrupted {}",
                        trace.rnti,
                        trace.slot,
                        trace.tb_size,
                        trace.mcs,
                        trace.rv,
                        trace.sinr_avg,
                        trace.corrupted
                    );
                }
                RxIndication::ChannelOccupied(duration) => {
                    trace!("Cell {} radio busy for {:?}", self.config.cell_id, duration);
                }
            }
        }
    }

    fn dispatch_ctrl_message(&mut self, msg: ControlMessage) {
        self.stats.ctrl_msgs_received += 1;
        trace!("Received {} in slot {}", msg.kind(), self.current_slot);
        match msg {
            ControlMessage::RachPreamble { rap_id } => {
                info!("Received RACH preamble {} in slot {}", rap_id, self.current_slot);
                self.mac.receive_rach_preamble(rap_id);
            }
            ControlMessage::DlHarqFeedback(info) => {
                if self.ue_attached.contains(&info.rnti) {
                    self.stats.dl_harq_forwarded += 1;
                    self.mac
                        .receive_control_message(ControlMessage::DlHarqFeedback(info));
                } else {
                    debug!("DL HARQ from unattached RNTI {} dropped", info.rnti);
                }
            }
            msg @ (ControlMessage::Mib(_)
            | ControlMessage::Sib1(_)
            | ControlMessage::DlDci { .. }
            | ControlMessage::UlDci { .. }
            | ControlMessage::DlCqi(_)
            | ControlMessage::Bsr(_)) => self.mac.receive_control_message(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::{EndpointId, EventTarget, SimEvent, SlotPattern};
    use bytes::Bytes;
    use common::{CellId, EventQueue, Numerology, SlotType};
    use interfaces::AlwaysOnAccessManager;
    use std::cell::RefCell;
    use std::rc::Rc;

    const GNB: EndpointId = EndpointId(0);
    const RNTI: Rnti = Rnti(1);

    #[derive(Debug, Clone)]
    enum Tx {
        Ctrl(Duration, Vec<ControlMessage>, Duration),
        Data(Duration, Vec<MacPdu>, Vec<f64>),
    }

    /// Radio that records what it is asked to do
    struct RecordingRadio {
        cell_id: CellId,
        psd: Vec<f64>,
        txs: Vec<Tx>,
        expected: Vec<ExpectedTb>,
        pending: Vec<RxIndication>,
    }

    impl RecordingRadio {
        fn new() -> Self {
            Self {
                cell_id: CellId(1),
                psd: Vec::new(),
                txs: Vec::new(),
                expected: Vec::new(),
                pending: Vec::new(),
            }
        }
    }

    impl Radio for RecordingRadio {
        fn cell_id(&self) -> CellId {
            self.cell_id
        }

        fn set_tx_power_spectral_density(&mut self, psd: Vec<f64>) {
            self.psd = psd;
        }

        fn start_tx_data_frames(
            &mut self,
            ctx: &mut PhyContext<'_>,
            burst: Vec<MacPdu>,
            _ctrl: Vec<ControlMessage>,
            _duration: Duration,
        ) -> Result<(), LayerError> {
            self.txs.push(Tx::Data(ctx.now(), burst, self.psd.clone()));
            Ok(())
        }

        fn start_tx_ctrl_frames(
            &mut self,
            ctx: &mut PhyContext<'_>,
            ctrl: Vec<ControlMessage>,
            duration: Duration,
        ) -> Result<(), LayerError> {
            self.txs.push(Tx::Ctrl(ctx.now(), ctrl, duration));
            Ok(())
        }

        fn add_expected_tb(&mut self, tb: ExpectedTb) {
            self.expected.push(tb);
        }

        fn handle_event(&mut self, _ctx: &mut PhyContext<'_>, _event: PhyEvent) -> Result<(), LayerError> {
            Ok(())
        }

        fn drain_indications(&mut self) -> Vec<RxIndication> {
            std::mem::take(&mut self.pending)
        }
    }

    #[derive(Debug, Default)]
    struct MacLog {
        dl_indications: Vec<(SlotAddress, SlotType)>,
        ul_indications: Vec<(SlotAddress, SlotType)>,
        received: Vec<ControlMessage>,
        ul_harq: Vec<UlHarqInfo>,
        rach: Vec<u32>,
    }

    /// Scheduler stub: control in every slot, optional DL data for one UE
    struct ScriptedMac {
        log: Rc<RefCell<MacLog>>,
        num_rbgs: usize,
        dl_data: bool,
        ul_data: bool,
        with_payload: bool,
        /// Extra UE sharing the DL symbols
        second_ue: Option<Rnti>,
    }

    impl ScriptedMac {
        fn new(log: Rc<RefCell<MacLog>>) -> Self {
            Self {
                log,
                num_rbgs: 4,
                dl_data: false,
                ul_data: false,
                with_payload: true,
                second_ue: None,
            }
        }
    }

    impl PhySapUser for ScriptedMac {
        fn slot_dl_indication(&mut self, slot: SlotAddress, slot_type: SlotType, phy: &mut dyn PhySapProvider) {
            self.log.borrow_mut().dl_indications.push((slot, slot_type));
            let mut alloc = SlotAllocation::new(slot);
            alloc.push(self.get_dl_ctrl_dci());
            if self.dl_data {
                let mut users = vec![(RNTI, vec![true, true, false, false])];
                if let Some(second) = self.second_ue {
                    users.push((second, vec![false, false, true, false]));
                }
                for (rnti, mask) in users {
                    alloc.push(DciInfo::data(rnti, Direction::Dl, 1, 13, mask, 64));
                    if self.with_payload {
                        phy.send_mac_pdu(MacPdu {
                            rnti,
                            slot,
                            sym_start: 1,
                            num_sym: 13,
                            lcid: 4,
                            harq_process: 0,
                            payload: Bytes::from_static(b"data"),
                        });
                    }
                }
            }
            phy.set_slot_alloc_info(alloc);
        }

        fn slot_ul_indication(&mut self, slot: SlotAddress, slot_type: SlotType, phy: &mut dyn PhySapProvider) {
            self.log.borrow_mut().ul_indications.push((slot, slot_type));
            let mut alloc = SlotAllocation::new(slot);
            alloc.push(self.get_ul_ctrl_dci());
            if self.ul_data {
                alloc.push(DciInfo::data(RNTI, Direction::Ul, 8, 5, vec![true; 4], 32));
            }
            phy.set_slot_alloc_info(alloc);
        }

        fn set_current_slot(&mut self, _slot: SlotAddress) {}

        fn get_dl_ctrl_dci(&self) -> DciInfo {
            DciInfo::ctrl(Direction::Dl, 0, 1, self.num_rbgs)
        }

        fn get_ul_ctrl_dci(&self) -> DciInfo {
            DciInfo::ctrl(Direction::Ul, 13, 1, self.num_rbgs)
        }

        fn receive_control_message(&mut self, msg: ControlMessage) {
            self.log.borrow_mut().received.push(msg);
        }

        fn receive_rach_preamble(&mut self, rap_id: u32) {
            self.log.borrow_mut().rach.push(rap_id);
        }

        fn ul_cqi_report(&mut self, _cqi: UlCqiInfo) {}

        fn ul_harq_feedback(&mut self, info: UlHarqInfo) {
            self.log.borrow_mut().ul_harq.push(info);
        }

        fn receive_phy_pdu(&mut self, _pdu: MacPdu) {}
    }

    /// Answers every request with the same response
    struct ScriptedCam(AccessResponse);

    impl ChannelAccessManager for ScriptedCam {
        fn request_access(&mut self, _now: Duration) -> AccessResponse {
            self.0
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Plays a script of responses, then repeats the fallback
    struct SequenceCam {
        script: Vec<AccessResponse>,
        fallback: AccessResponse,
    }

    impl ChannelAccessManager for SequenceCam {
        fn request_access(&mut self, _now: Duration) -> AccessResponse {
            if self.script.is_empty() {
                self.fallback
            } else {
                self.script.remove(0)
            }
        }

        fn name(&self) -> &'static str {
            "sequence"
        }
    }

    fn config(pattern: &str) -> PhyConfig {
        let mut config = PhyConfig::new(
            CellId(1),
            Numerology::new(1).unwrap(),
            pattern.parse::<SlotPattern>().unwrap(),
        );
        config.num_rbs = 4;
        config
    }

    fn engine(
        pattern: &str,
        mac: ScriptedMac,
        cam: Box<dyn ChannelAccessManager>,
    ) -> GnbPhy<RecordingRadio> {
        GnbPhy::new(config(pattern), RecordingRadio::new(), Box::new(mac), cam).unwrap()
    }

    fn run_until(
        phy: &mut GnbPhy<RecordingRadio>,
        queue: &mut EventQueue<SimEvent>,
        end: Duration,
    ) -> Result<(), LayerError> {
        while let Some(at) = queue.peek_time() {
            if at > end {
                break;
            }
            let Some((_, ev)) = queue.pop() else { break };
            if ev.target == EventTarget::Endpoint(GNB) {
                let mut ctx = PhyContext::new(queue, GNB);
                phy.handle_event(&mut ctx, ev.event)?;
            }
        }
        Ok(())
    }

    fn start(phy: &mut GnbPhy<RecordingRadio>, queue: &mut EventQueue<SimEvent>) -> Result<(), LayerError> {
        let mut ctx = PhyContext::new(queue, GNB);
        phy.start_event_loop(&mut ctx, 0, 0, 0)
    }

    fn ctrl_txs(radio: &RecordingRadio) -> Vec<Vec<ControlMessage>> {
        radio
            .txs
            .iter()
            .filter_map(|t| match t {
                Tx::Ctrl(_, msgs, _) => Some(msgs.clone()),
                Tx::Data(..) => None,
            })
            .collect()
    }

    fn slot_period() -> Duration {
        config("F|").slot_period()
    }

    #[test]
    fn test_mib_goes_out_in_first_slot() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut phy = engine("F|", ScriptedMac::new(log.clone()), Box::new(AlwaysOnAccessManager::default()));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, Duration::from_micros(100)).unwrap();

        let txs = &phy.radio().txs;
        assert!(matches!(
            &txs[0],
            Tx::Ctrl(at, msgs, duration)
                if at.is_zero()
                    && matches!(msgs[0], ControlMessage::Mib(_))
                    && *duration == config("F|").symbol_period() - ONE_NS
        ));
        assert_eq!(phy.channel_status(), ChannelStatus::Granted);
        assert_eq!(phy.stats().access_requests, 1);
        assert_eq!(phy.stats().grants, 1);

        // F pattern with default delays: DL generated 2 slots ahead, UL 4
        let log = log.borrow();
        assert_eq!(log.dl_indications[0].0.normalize(), 2);
        assert_eq!(log.ul_indications[0].0.normalize(), 4);
    }

    #[test]
    fn test_sib1_in_subframe_five() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut phy = engine("F|", ScriptedMac::new(log), Box::new(AlwaysOnAccessManager::default()));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        // Subframe 5 starts at slot 10 with numerology 1
        run_until(&mut phy, &mut queue, slot_period() * 10 + Duration::from_micros(10)).unwrap();

        let sib = ctrl_txs(phy.radio())
            .into_iter()
            .flatten()
            .find_map(|m| match m {
                ControlMessage::Sib1(sib) => Some(sib),
                _ => None,
            })
            .unwrap();
        assert_eq!(sib.tdd_pattern, "F|");
    }

    #[test]
    fn test_denied_access_requeues() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut phy = engine("F|", ScriptedMac::new(log.clone()), Box::new(ScriptedCam(AccessResponse::Denied)));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, slot_period() * 3 + Duration::from_micros(1)).unwrap();

        assert!(phy.radio().txs.is_empty());
        assert_eq!(phy.channel_status(), ChannelStatus::None);
        assert_eq!(phy.stats().denials, 4);
        assert!(phy.stats().requeued_allocations >= 4);
        // The scheduler is still asked for future slots
        assert_eq!(log.borrow().dl_indications.len(), 4);
    }

    #[test]
    fn test_deferred_grant() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let cam = ScriptedCam(AccessResponse::Deferred {
            after: Duration::from_micros(50),
            grant: Some(Duration::from_millis(2)),
        });
        let mut phy = engine("F|", ScriptedMac::new(log), Box::new(cam));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();

        run_until(&mut phy, &mut queue, Duration::from_micros(10)).unwrap();
        assert_eq!(phy.channel_status(), ChannelStatus::Requested);
        assert!(phy.radio().txs.is_empty());

        // Granted mid slot 0, slot 1 carries the re-queued control
        run_until(&mut phy, &mut queue, slot_period() + Duration::from_micros(1)).unwrap();
        assert_eq!(phy.channel_status(), ChannelStatus::Granted);
        let txs = ctrl_txs(phy.radio());
        assert_eq!(txs.len(), 1);
        assert!(matches!(txs[0][0], ControlMessage::Mib(_)));
        assert_eq!(phy.stats().requeued_allocations, 1);
    }

    #[test]
    fn test_short_grant_rejected() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let cam = ScriptedCam(AccessResponse::Granted(Duration::from_micros(100)));
        let mut phy = engine("F|", ScriptedMac::new(log), Box::new(cam));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();

        assert_eq!(phy.channel_status(), ChannelStatus::None);
        assert_eq!(phy.stats().grants, 0);
        assert_eq!(phy.stats().requeued_allocations, 1);
    }

    #[test]
    fn test_dl_data_with_dci() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log);
        mac.dl_data = true;
        let mut phy = engine("DL|", mac, Box::new(AlwaysOnAccessManager::default()));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, slot_period() * 2 + Duration::from_micros(100)).unwrap();

        // Slot 2 is the first scheduled one; k0 = 0 so its DCI rides in its own control
        let dci_msgs: Vec<_> = ctrl_txs(phy.radio())
            .into_iter()
            .flatten()
            .filter(|m| matches!(m, ControlMessage::DlDci { .. }))
            .collect();
        assert!(matches!(
            &dci_msgs[0],
            ControlMessage::DlDci { dci, k0: 0, k1: 2 } if dci.rnti == RNTI
        ));

        let data: Vec<_> = phy
            .radio()
            .txs
            .iter()
            .filter_map(|t| match t {
                Tx::Data(at, burst, psd) => Some((*at, burst.clone(), psd.clone())),
                Tx::Ctrl(..) => None,
            })
            .collect();
        assert_eq!(data.len(), 1);
        let (at, burst, psd) = &data[0];
        assert_eq!(*at, slot_period() * 2 + config("DL|").symbol_period() + ONE_NS);
        assert_eq!(burst[0].rnti, RNTI);
        assert!(psd[0] > 0.0 && psd[1] > 0.0);
        assert_eq!(psd[2], 0.0);
    }

    #[test]
    fn test_ofdma_burst_covers_union() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log);
        mac.dl_data = true;
        mac.second_ue = Some(Rnti(2));
        let mut phy = engine("DL|", mac, Box::new(AlwaysOnAccessManager::default()));
        phy.add_ue(RNTI);
        phy.add_ue(Rnti(2));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, slot_period() * 2 + Duration::from_micros(100)).unwrap();

        let bursts: Vec<_> = phy
            .radio()
            .txs
            .iter()
            .filter_map(|t| match t {
                Tx::Data(_, burst, psd) => Some((burst.len(), psd.clone())),
                Tx::Ctrl(..) => None,
            })
            .collect();
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].0, 2);
        assert!(bursts[0].1[..3].iter().all(|p| *p > 0.0));
        assert_eq!(bursts[0].1[3], 0.0);
    }

    #[test]
    fn test_missing_payload_is_fatal() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log);
        mac.dl_data = true;
        mac.with_payload = false;
        let mut phy = engine("DL|", mac, Box::new(AlwaysOnAccessManager::default()));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();

        let err = run_until(&mut phy, &mut queue, slot_period() * 3).unwrap_err();
        assert!(matches!(
            err,
            LayerError::Protocol(ProtocolViolation::MissingPayload { rnti: 1, sym_start: 1, .. })
        ));
    }

    #[test]
    fn test_full_dl_slot_releases_channel() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log);
        mac.dl_data = true;
        let mut phy = engine("DL|", mac, Box::new(AlwaysOnAccessManager::default()));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();

        // Data through the last symbol leaves no guard
        run_until(&mut phy, &mut queue, slot_period() * 2 + Duration::from_micros(1)).unwrap();
        assert_eq!(phy.channel_status(), ChannelStatus::ToLose);

        // Released at the boundary, requested again for slot 3
        run_until(&mut phy, &mut queue, slot_period() * 3 + Duration::from_micros(1)).unwrap();
        assert_eq!(phy.stats().access_requests, 2);
    }

    #[test]
    fn test_ul_data_expected_on_radio() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log);
        mac.ul_data = true;
        let mut phy = engine("F|", mac, Box::new(AlwaysOnAccessManager::default()));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, slot_period() * 4 + config("F|").symbol_period() * 9).unwrap();

        let expected = &phy.radio().expected;
        assert_eq!(expected.len(), 1);
        assert_eq!(expected[0].rnti, RNTI);
        assert_eq!(expected[0].direction, Direction::Ul);
        assert_eq!(expected[0].rb_map, vec![0, 1, 2, 3]);

        // The UL DCI for slot 4 went out n2 = 2 slots earlier
        let first_ul_dci = phy
            .radio()
            .txs
            .iter()
            .find_map(|t| match t {
                Tx::Ctrl(at, msgs, _)
                    if msgs
                        .iter()
                        .any(|m| matches!(m, ControlMessage::UlDci { k2: 2, .. })) =>
                {
                    Some(*at)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(first_ul_dci, slot_period() * 2);
    }

    #[test]
    fn test_ul_data_for_unknown_ue() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log);
        mac.ul_data = true;
        let mut phy = engine("F|", mac, Box::new(AlwaysOnAccessManager::default()));
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();

        let err = run_until(&mut phy, &mut queue, slot_period() * 5).unwrap_err();
        assert_eq!(err, LayerError::Protocol(ProtocolViolation::UnknownUe(1)));
    }

    #[test]
    fn test_inbound_dispatch() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut phy = engine("F|", ScriptedMac::new(log.clone()), Box::new(AlwaysOnAccessManager::default()));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();

        let harq = |rnti| interfaces::DlHarqInfo {
            rnti,
            harq_process: 0,
            num_retx: 0,
            status: interfaces::HarqStatus::Ack,
        };
        phy.radio_mut().pending = vec![
            RxIndication::CtrlReceived(vec![
                ControlMessage::RachPreamble { rap_id: 7 },
                ControlMessage::DlHarqFeedback(harq(RNTI)),
                ControlMessage::DlHarqFeedback(harq(Rnti(9))),
            ]),
            RxIndication::UlHarqFeedback(UlHarqInfo {
                rnti: Rnti(9),
                harq_process: 0,
                num_retx: 0,
                status: interfaces::HarqStatus::Nack,
            }),
        ];
        let mut ctx = PhyContext::new(&mut queue, GNB);
        phy.handle_event(&mut ctx, PhyEvent::EndRxCtrl).unwrap();

        let log = log.borrow();
        assert_eq!(log.rach, vec![7]);
        assert_eq!(log.received, vec![ControlMessage::DlHarqFeedback(harq(RNTI))]);
        assert!(log.ul_harq.is_empty());
        assert_eq!(phy.stats().ctrl_msgs_received, 3);
    }

    #[test]
    fn test_remove_unknown_ue() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut phy = engine("F|", ScriptedMac::new(log), Box::new(AlwaysOnAccessManager::default()));
        assert!(phy.add_ue(RNTI));
        assert!(!phy.add_ue(RNTI));
        assert!(phy.remove_ue(RNTI).is_ok());
        assert_eq!(
            phy.remove_ue(RNTI),
            Err(LayerError::Protocol(ProtocolViolation::UnknownUe(1)))
        );
    }

    #[test]
    fn test_radio_of_other_cell_rejected() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut radio = RecordingRadio::new();
        radio.cell_id = CellId(2);
        let result = GnbPhy::new(
            config("F|"),
            radio,
            Box::new(ScriptedMac::new(log)),
            Box::new(AlwaysOnAccessManager::default()),
        );
        assert!(matches!(result, Err(LayerError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_unannounced_ul_data_lapses() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log.clone());
        mac.ul_data = true;
        let mut phy = engine("F|", mac, Box::new(ScriptedCam(AccessResponse::Denied)));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, slot_period() * 4 + config("F|").symbol_period() * 9).unwrap();

        // The UL DCI for slot 4 never went out, so nothing is expected
        assert!(phy.radio().expected.is_empty());
        assert_eq!(phy.stats().lapsed_data, 1);
        let log = log.borrow();
        assert_eq!(log.ul_harq.len(), 1);
        assert_eq!(log.ul_harq[0].rnti, RNTI);
        assert_eq!(log.ul_harq[0].status, HarqStatus::Nack);
    }

    #[test]
    fn test_announced_ul_data_received_without_channel() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log.clone());
        mac.ul_data = true;
        let cam = SequenceCam {
            script: vec![AccessResponse::Granted(slot_period() * 3)],
            fallback: AccessResponse::Denied,
        };
        let mut phy = engine("F|", mac, Box::new(cam));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();
        run_until(&mut phy, &mut queue, slot_period() * 4 + config("F|").symbol_period() * 9).unwrap();

        // Granted for slots 0-2, the UL DCI for slot 4 went out in slot 2
        assert_eq!(phy.channel_status(), ChannelStatus::None);
        assert!(phy.stats().denials >= 2);
        assert_eq!(phy.radio().expected.len(), 1);
        assert_eq!(phy.radio().expected[0].rnti, RNTI);
        assert_eq!(phy.stats().lapsed_data, 0);
        assert!(log.borrow().ul_harq.is_empty());
    }

    #[test]
    fn test_deferred_dl_data_never_displaces_queued() {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mut mac = ScriptedMac::new(log.clone());
        mac.dl_data = true;
        let cam = SequenceCam {
            script: vec![AccessResponse::Granted(slot_period() * 8)],
            fallback: AccessResponse::Denied,
        };
        let mut phy = engine("DL|", mac, Box::new(cam));
        phy.add_ue(RNTI);
        let mut queue = EventQueue::new();
        start(&mut phy, &mut queue).unwrap();

        // Slot 2 fills the whole slot and gives the channel up; slot 3 is denied
        run_until(&mut phy, &mut queue, slot_period() * 3 + Duration::from_micros(100)).unwrap();
        assert_eq!(phy.stats().requeued_allocations, 1);
        assert_eq!(phy.stats().lapsed_data, 1);

        let numerology = phy.config().numerology;
        let slot3 = SlotAddress::from_normalized(3, numerology);
        let slot4 = SlotAddress::from_normalized(4, numerology);
        assert!(!phy.store().has_burst(&slot3, 1));
        assert!(phy.store().has_burst(&slot4, 1));
        let queued = phy.store().peek(&slot4).unwrap();
        assert_eq!(queued.allocations.iter().filter(|d| d.is_data()).count(), 1);
        assert_eq!(queued.allocations.iter().filter(|d| d.is_ctrl()).count(), 1);

        let log = log.borrow();
        assert!(log.received.iter().any(|m| matches!(
            m,
            ControlMessage::DlHarqFeedback(info) if info.rnti == RNTI && info.status == HarqStatus::Nack
        )));
    }
}
