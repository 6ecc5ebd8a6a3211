//! Reference Terminal
//!
//! Minimal UE built on the same half-duplex radio as the base station. It
//! learns the slot pattern from SIB1, announces itself with a RACH preamble,
//! turns DL/UL DCIs into expected blocks and UL transmissions at the
//! announced k0/k2, and answers DL blocks with HARQ feedback and a CQI report
//! in the UL control symbol k1 slots later.

use crate::phy::{
    tx_psd, ExpectedTb, PhyContext, PhyEvent, Radio, RxIndication, SlotConfig, SlotPattern,
    SpectrumPhy,
};
use crate::LayerError;
use bytes::Bytes;
use common::{linear_to_db, CellId, Numerology, ProtocolViolation, Rnti, SlotAddress};
use interfaces::{BsrInfo, ControlMessage, DciInfo, DlCqiInfo, MacPdu};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const ONE_NS: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub rnti: Rnti,
    pub cell_id: CellId,
    pub numerology: Numerology,
    pub symbols_per_slot: u8,
    pub num_rbs: usize,
    pub rbs_per_rbg: usize,
    pub tx_power_dbm: f64,
    /// Symbol carrying UL control
    pub ul_ctrl_symbol: u8,
    /// Bytes waiting for UL grants at start
    pub ul_buffer_bytes: u32,
    pub lcid: u8,
}

impl TerminalConfig {
    pub fn new(rnti: Rnti, cell_id: CellId, numerology: Numerology) -> Self {
        Self {
            rnti,
            cell_id,
            numerology,
            symbols_per_slot: 14,
            num_rbs: 100,
            rbs_per_rbg: 1,
            tx_power_dbm: 23.0,
            ul_ctrl_symbol: 13,
            ul_buffer_bytes: 0,
            lcid: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TerminalStats {
    pub mib_received: u64,
    pub sib1_received: u64,
    pub rach_sent: u64,
    pub dl_dcis: u64,
    pub ul_dcis: u64,
    pub dl_tb_ok: u64,
    pub dl_tb_corrupted: u64,
    pub dl_rx_bytes: u64,
    pub dl_harq_sent: u64,
    pub ul_tx_bytes: u64,
    pub ul_ctrl_bursts: u64,
}

/// Wideband CQI for an average SINR
pub fn cqi_from_sinr_db(sinr_db: f64) -> u8 {
    ((sinr_db + 8.0) / 2.0).floor().clamp(0.0, 15.0) as u8
}

pub struct Terminal {
    config: TerminalConfig,
    slot: SlotConfig,
    radio: SpectrumPhy,
    /// Learnt from SIB1
    pattern: Option<SlotPattern>,
    rach_sent: bool,
    /// k1 announced for each DL HARQ process
    dl_k1: HashMap<u8, u32>,
    /// UL control messages per normalized slot
    ul_ctrl: BTreeMap<u64, Vec<ControlMessage>>,
    ul_buffer: u32,
    last_dl_sinr_db: Option<f64>,
    stats: TerminalStats,
}

impl Terminal {
    pub fn new(config: TerminalConfig, mut radio: SpectrumPhy) -> Result<Self, LayerError> {
        if radio.cell_id() != config.cell_id {
            return Err(LayerError::InvalidConfiguration(format!(
                "radio of UE {} belongs to cell {}, not {}",
                config.rnti,
                radio.cell_id(),
                config.cell_id
            )));
        }
        let slot = SlotConfig::from_numerology(config.numerology, config.symbols_per_slot)?;
        if config.ul_ctrl_symbol >= config.symbols_per_slot {
            return Err(LayerError::InvalidConfiguration(format!(
                "UL control symbol {} outside a {}-symbol slot",
                config.ul_ctrl_symbol, config.symbols_per_slot
            )));
        }
        let all_rbs: Vec<usize> = (0..config.num_rbs).collect();
        radio.set_tx_power_spectral_density(tx_psd(&all_rbs, config.num_rbs, config.tx_power_dbm));

        Ok(Self {
            slot,
            radio,
            pattern: None,
            rach_sent: false,
            dl_k1: HashMap::new(),
            ul_ctrl: BTreeMap::new(),
            ul_buffer: config.ul_buffer_bytes,
            last_dl_sinr_db: None,
            stats: TerminalStats::default(),
            config,
        })
    }

    pub fn rnti(&self) -> Rnti {
        self.config.rnti
    }

    pub fn cell_id(&self) -> CellId {
        self.config.cell_id
    }

    pub fn stats(&self) -> &TerminalStats {
        &self.stats
    }

    pub fn radio(&self) -> &SpectrumPhy {
        &self.radio
    }

    /// SIB1 received and the slot pattern known
    pub fn is_synchronized(&self) -> bool {
        self.pattern.is_some()
    }

    pub fn ul_buffer(&self) -> u32 {
        self.ul_buffer
    }

    /// Slot on air at `now`; every cell starts at slot 0 at time zero
    fn slot_at(&self, now: Duration) -> SlotAddress {
        let index = now.as_nanos() / self.slot.slot_period.as_nanos().max(1);
        SlotAddress::from_normalized(u64::try_from(index).unwrap_or(u64::MAX), self.config.numerology)
    }

    fn time_of(&self, slot: SlotAddress, symbol: u8) -> Duration {
        let slot_ns = self.slot.slot_period.as_nanos() as u64;
        Duration::from_nanos(slot_ns.saturating_mul(slot.normalize()))
            + self.slot.symbol_period * u32::from(symbol)
    }

    fn schedule_at(&self, ctx: &mut PhyContext<'_>, at: Duration, event: PhyEvent) {
        let now = ctx.now();
        if at < now {
            warn!(
                "UE {} late by {:?} for {}",
                self.config.rnti,
                now - at,
                event.name()
            );
        }
        ctx.schedule(at.saturating_sub(now), event);
    }

    pub fn handle_event(&mut self, ctx: &mut PhyContext<'_>, event: PhyEvent) -> Result<(), LayerError> {
        match event {
            PhyEvent::ExpectTb(dci) => {
                let mut tb = ExpectedTb::from_dci(&dci, self.config.rbs_per_rbg);
                tb.rb_map.retain(|rb| *rb < self.config.num_rbs);
                trace!("UE {} expecting DL TB process {}", self.config.rnti, tb.harq_process);
                self.radio.add_expected_tb(tb);
            }
            PhyEvent::SendUlData(dci) => self.send_ul_data(ctx, &dci)?,
            PhyEvent::SendUlCtrl => self.send_ul_ctrl(ctx)?,
            event @ (PhyEvent::StartRx(_)
            | PhyEvent::EndRxData
            | PhyEvent::EndRxCtrl
            | PhyEvent::EndTx
            | PhyEvent::CheckIfStillBusy) => self.radio.handle_event(ctx, event)?,
            other => {
                return Err(ProtocolViolation::UnexpectedEvent {
                    event: other.name(),
                    state: self.radio.state().to_string(),
                }
                .into());
            }
        }
        self.process_indications(ctx)
    }

    fn process_indications(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        for indication in self.radio.drain_indications() {
            match indication {
                RxIndication::CtrlReceived(msgs) => {
                    for msg in msgs {
                        self.handle_ctrl(ctx, msg)?;
                    }
                }
                RxIndication::DataReceived(pdu) => {
                    self.stats.dl_rx_bytes += pdu.size() as u64;
                }
                RxIndication::DlHarqFeedback(info) => {
                    let Some(k1) = self.dl_k1.remove(&info.harq_process) else {
                        warn!(
                            "UE {} has no k1 for DL process {}, feedback dropped",
                            self.config.rnti, info.harq_process
                        );
                        continue;
                    };
                    let target = self.slot_at(ctx.now()).add(u64::from(k1));
                    debug!(
                        "UE {} {:?} for process {} in {}",
                        self.config.rnti, info.status, info.harq_process, target
                    );
                    self.stats.dl_harq_sent += 1;
                    self.queue_ul_ctrl(ctx, target, ControlMessage::DlHarqFeedback(info));
                    if let Some(sinr_db) = self.last_dl_sinr_db {
                        self.queue_ul_ctrl(
                            ctx,
                            target,
                            ControlMessage::DlCqi(DlCqiInfo {
                                rnti: self.config.rnti,
                                wideband_cqi: cqi_from_sinr_db(sinr_db),
                            }),
                        );
                    }
                }
                RxIndication::UlHarqFeedback(info) => {
                    warn!("UE {} got UL HARQ for RNTI {}", self.config.rnti, info.rnti);
                }
                RxIndication::SinrReport(sinr) => {
                    // RBs not carrying this cell's signal read as zero
                    let used: Vec<f64> = sinr.into_iter().filter(|s| *s > 0.0).collect();
                    if !used.is_empty() {
                        let mean = used.iter().sum::<f64>() / used.len() as f64;
                        self.last_dl_sinr_db = Some(linear_to_db(mean));
                    }
                }
                RxIndication::PacketTrace(trace) => {
                    if trace.corrupted {
                        self.stats.dl_tb_corrupted += 1;
                    } else {
                        self.stats.dl_tb_ok += 1;
                    }
                }
                RxIndication::ChannelOccupied(duration) => {
                    trace!("UE {} radio busy for {:?}", self.config.rnti, duration);
                }
            }
        }
        Ok(())
    }

    fn handle_ctrl(&mut self, ctx: &mut PhyContext<'_>, msg: ControlMessage) -> Result<(), LayerError> {
        let current = self.slot_at(ctx.now());
        match msg {
            ControlMessage::Mib(mib) => {
                trace!("UE {} MIB: SFN {} SCS {} kHz", self.config.rnti, mib.system_frame, mib.scs_common_khz);
                self.stats.mib_received += 1;
            }
            ControlMessage::Sib1(sib) => {
                self.stats.sib1_received += 1;
                if self.pattern.is_none() {
                    let pattern: SlotPattern = sib.tdd_pattern.parse()?;
                    info!(
                        "UE {} synchronized to cell {} with pattern {}",
                        self.config.rnti, sib.cell_id, pattern
                    );
                    self.pattern = Some(pattern);
                }
                if !self.rach_sent {
                    self.send_rach(ctx, current);
                }
            }
            ControlMessage::DlDci { dci, k0, k1 } => {
                if dci.rnti != self.config.rnti {
                    return Ok(());
                }
                self.stats.dl_dcis += 1;
                self.dl_k1.insert(dci.harq_process, k1);
                let at = self.time_of(current.add(u64::from(k0)), dci.sym_start);
                self.schedule_at(ctx, at, PhyEvent::ExpectTb(dci));
            }
            ControlMessage::UlDci { dci, k2 } => {
                if dci.rnti != self.config.rnti {
                    return Ok(());
                }
                self.stats.ul_dcis += 1;
                // Same 1 ns offset as DL data, after the receiver arms
                let at = self.time_of(current.add(u64::from(k2)), dci.sym_start) + ONE_NS;
                self.schedule_at(ctx, at, PhyEvent::SendUlData(dci));
            }
            msg @ (ControlMessage::DlCqi(_)
            | ControlMessage::Bsr(_)
            | ControlMessage::RachPreamble { .. }
            | ControlMessage::DlHarqFeedback(_)) => {
                warn!("UE {} ignoring uplink message {} on the downlink", self.config.rnti, msg.kind());
            }
        }
        Ok(())
    }

    /// Next slot after `from` with UL symbols
    fn next_ul_slot(&self, from: SlotAddress) -> Option<SlotAddress> {
        let pattern = self.pattern.as_ref()?;
        (1..=pattern.len() as u64)
            .map(|k| from.add(k))
            .find(|slot| pattern.slot_type(slot).has_ul())
    }

    fn send_rach(&mut self, ctx: &mut PhyContext<'_>, current: SlotAddress) {
        let Some(target) = self.next_ul_slot(current) else {
            warn!("UE {}: pattern has no UL slot for RACH", self.config.rnti);
            return;
        };
        info!("UE {} sending RACH preamble in {}", self.config.rnti, target);
        self.rach_sent = true;
        self.stats.rach_sent += 1;
        self.queue_ul_ctrl(
            ctx,
            target,
            ControlMessage::RachPreamble {
                rap_id: u32::from(self.config.rnti.value()),
            },
        );

        // First buffer report right after
        if self.ul_buffer > 0 {
            if let Some(next) = self.next_ul_slot(target) {
                let bsr = self.bsr();
                self.queue_ul_ctrl(ctx, next, bsr);
            }
        }
    }

    fn bsr(&self) -> ControlMessage {
        ControlMessage::Bsr(BsrInfo {
            rnti: self.config.rnti,
            buffer_bytes: self.ul_buffer,
        })
    }

    fn queue_ul_ctrl(&mut self, ctx: &mut PhyContext<'_>, slot: SlotAddress, msg: ControlMessage) {
        let key = slot.normalize();
        let first = !self.ul_ctrl.contains_key(&key);
        self.ul_ctrl.entry(key).or_default().push(msg);
        if first {
            let at = self.time_of(slot, self.config.ul_ctrl_symbol);
            self.schedule_at(ctx, at, PhyEvent::SendUlCtrl);
        }
    }

    fn send_ul_ctrl(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        let slot = self.slot_at(ctx.now());
        let Some(mut msgs) = self.ul_ctrl.remove(&slot.normalize()) else {
            return Ok(());
        };
        let has_bsr = msgs.iter().any(|m| matches!(m, ControlMessage::Bsr(_)));
        if self.ul_buffer > 0 && self.rach_sent && !has_bsr {
            msgs.push(self.bsr());
        }

        debug!(
            "UE {} sending UL CTRL in {} ({})",
            self.config.rnti,
            slot,
            msgs.iter().map(ControlMessage::kind).collect::<Vec<_>>().join(",")
        );
        let all_rbs: Vec<usize> = (0..self.config.num_rbs).collect();
        self.radio
            .set_tx_power_spectral_density(tx_psd(&all_rbs, self.config.num_rbs, self.config.tx_power_dbm));
        self.radio
            .start_tx_ctrl_frames(ctx, msgs, self.slot.symbol_period.saturating_sub(ONE_NS))?;
        self.stats.ul_ctrl_bursts += 1;
        Ok(())
    }

    fn send_ul_data(&mut self, ctx: &mut PhyContext<'_>, dci: &DciInfo) -> Result<(), LayerError> {
        let slot = self.slot_at(ctx.now());
        let pdu = MacPdu {
            rnti: self.config.rnti,
            slot,
            sym_start: dci.sym_start,
            num_sym: dci.num_sym,
            lcid: self.config.lcid,
            harq_process: dci.harq_process,
            payload: Bytes::from(vec![0xA5; dci.tb_size as usize]),
        };
        if dci.ndi {
            self.ul_buffer = self.ul_buffer.saturating_sub(dci.tb_size);
        }

        let rbs: Vec<usize> = dci
            .rb_assignment(self.config.rbs_per_rbg)
            .into_iter()
            .filter(|rb| *rb < self.config.num_rbs)
            .collect();
        self.radio
            .set_tx_power_spectral_density(tx_psd(&rbs, self.config.num_rbs, self.config.tx_power_dbm));
        let duration = (self.slot.symbol_period * u32::from(dci.num_sym)).saturating_sub(ONE_NS * 2);
        debug!(
            "UE {} sending UL DATA of {} bytes in {} symbols {}+{} rv {}",
            self.config.rnti, dci.tb_size, slot, dci.sym_start, dci.num_sym, dci.rv
        );
        self.radio
            .start_tx_data_frames(ctx, vec![pdu], Vec::new(), duration)?;
        self.stats.ul_tx_bytes += u64::from(dci.tb_size);
        Ok(())
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("rnti", &self.config.rnti)
            .field("cell_id", &self.config.cell_id)
            .field("synchronized", &self.pattern.is_some())
            .field("ul_buffer", &self.ul_buffer)
            .finish()
    }
}
