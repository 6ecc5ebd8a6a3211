//! Half-Duplex Spectrum PHY
//!
//! Receive/transmit state machine of one radio. Every arriving signal is
//! accounted as interference; signals of the serving cell sent by the opposite
//! role open control or data reception windows. At the end of a data window
//! each expected transport block is evaluated against the error model and
//! answered with exactly one HARQ feedback.

use super::{
    ExpectedTb, HarqHistory, InterferenceTracker, PhyContext, PhyEvent, Radio, RxIndication,
    RxSignal, SignalKind, SpectrumSignal,
};
use crate::LayerError;
use common::utils::{dbm_to_watt, noise_power_per_rb};
use common::{CellId, DeviceRole, Direction, EventId, Numerology, ProtocolViolation, Rnti};
use interfaces::{
    ControlMessage, DlHarqInfo, ErrorModel, ErrorModelOutput, HarqStatus, MacPdu, RxPacketTrace,
    UlHarqInfo,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Receiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    Tx,
    RxCtrl,
    RxData,
    CcaBusy,
}

impl fmt::Display for RxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RxState::Idle => "IDLE",
            RxState::Tx => "TX",
            RxState::RxCtrl => "RX_CTRL",
            RxState::RxData => "RX_DATA",
            RxState::CcaBusy => "CCA_BUSY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SpectrumPhyConfig {
    pub cell_id: CellId,
    pub role: DeviceRole,
    pub num_rbs: usize,
    pub numerology: Numerology,
    pub noise_figure_db: f64,
    /// Sense the medium for foreign energy (unlicensed operation)
    pub contested: bool,
    pub cca_threshold_dbm: f64,
    pub error_model_enabled: bool,
    /// Redundancy version after which a failed process starts over
    pub max_retx: u8,
    pub seed: u64,
}

impl SpectrumPhyConfig {
    pub fn new(cell_id: CellId, role: DeviceRole, num_rbs: usize, numerology: Numerology) -> Self {
        Self {
            cell_id,
            role,
            num_rbs,
            numerology,
            noise_figure_db: 5.0,
            contested: false,
            cca_threshold_dbm: -62.0,
            error_model_enabled: true,
            max_retx: 3,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct TbInfo {
    expected: ExpectedTb,
    sinr_avg: f64,
    sinr_min: f64,
    output: Option<ErrorModelOutput>,
    corrupted: bool,
    feedback_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RxWindow {
    start: Duration,
    duration: Duration,
}

pub struct SpectrumPhy {
    config: SpectrumPhyConfig,
    state: RxState,
    error_model: Box<dyn ErrorModel>,
    rng: StdRng,
    interference: InterferenceTracker,
    harq: HarqHistory,
    transport_blocks: BTreeMap<Rnti, TbInfo>,
    rx_bursts: Vec<Vec<MacPdu>>,
    rx_ctrl: Vec<ControlMessage>,
    rx_window: Option<RxWindow>,
    tx_psd: Vec<f64>,
    cca_threshold_w: f64,
    busy_until: Duration,
    busy_check: Option<EventId>,
    indications: Vec<RxIndication>,
}

impl SpectrumPhy {
    pub fn new(config: SpectrumPhyConfig, error_model: Box<dyn ErrorModel>) -> Self {
        let noise = noise_power_per_rb(config.numerology.scs_khz(), config.noise_figure_db);
        info!(
            "Spectrum PHY for cell {} ({:?}): {} RBs, noise {:.3e} W/RB, contested={}",
            config.cell_id, config.role, config.num_rbs, noise, config.contested
        );
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            interference: InterferenceTracker::new(vec![noise; config.num_rbs]),
            cca_threshold_w: dbm_to_watt(config.cca_threshold_dbm),
            tx_psd: vec![0.0; config.num_rbs],
            config,
            state: RxState::Idle,
            error_model,
            harq: HarqHistory::new(),
            transport_blocks: BTreeMap::new(),
            rx_bursts: Vec::new(),
            rx_ctrl: Vec::new(),
            rx_window: None,
            busy_until: Duration::ZERO,
            busy_check: None,
            indications: Vec::new(),
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn config(&self) -> &SpectrumPhyConfig {
        &self.config
    }

    pub fn harq_history(&self) -> &HarqHistory {
        &self.harq
    }

    pub fn expected_tbs(&self) -> usize {
        self.transport_blocks.len()
    }

    fn change_state(&mut self, new_state: RxState, duration: Duration) {
        trace!("{} -> {} for {:?}", self.state, new_state, duration);
        if new_state != RxState::Idle && !duration.is_zero() {
            self.indications.push(RxIndication::ChannelOccupied(duration));
        }
        self.state = new_state;
    }

    /// Serving cell, sent by the other end of the link
    fn is_matching(&self, signal: &SpectrumSignal) -> bool {
        signal.cell_id == self.config.cell_id && signal.role != self.config.role
    }

    fn start_rx(&mut self, ctx: &mut PhyContext<'_>, rx: RxSignal) -> Result<(), LayerError> {
        let now = ctx.now();
        let signal = rx.signal;
        trace!(
            "Start receiving {} of {:?} from {} (cell {})",
            signal.kind.name(),
            signal.duration,
            signal.tx,
            signal.cell_id
        );
        self.interference.add_signal(&rx.rx_psd, now, signal.duration);

        if !self.is_matching(&signal) {
            // Never leave RX or TX for CCA_BUSY, only IDLE
            if self.config.contested && self.state == RxState::Idle {
                self.maybe_cca_busy(ctx);
            }
            return Ok(());
        }

        match &signal.kind {
            SignalKind::Data { burst, ctrl } => {
                self.start_rx_data(ctx, &rx.rx_psd, signal.duration, burst, ctrl)
            }
            SignalKind::Ctrl(ctrl) => self.start_rx_ctrl(ctx, signal.duration, ctrl),
        }
    }

    fn open_or_join_window(&self, now: Duration, duration: Duration) -> Result<bool, ProtocolViolation> {
        match self.rx_window {
            None => Ok(true),
            Some(window) if window.start == now && window.duration == duration => Ok(false),
            Some(window) => Err(ProtocolViolation::RxWindowMismatch {
                window_start_ns: window.start.as_nanos(),
                window_ns: window.duration.as_nanos(),
                signal_start_ns: now.as_nanos(),
                signal_ns: duration.as_nanos(),
            }),
        }
    }

    fn start_rx_data(
        &mut self,
        ctx: &mut PhyContext<'_>,
        rx_psd: &[f64],
        duration: Duration,
        burst: &[MacPdu],
        ctrl: &[ControlMessage],
    ) -> Result<(), LayerError> {
        match self.state {
            RxState::Tx | RxState::RxCtrl => {
                return Err(ProtocolViolation::HalfDuplex {
                    state: self.state.to_string(),
                    incoming: "DATA",
                }
                .into());
            }
            RxState::CcaBusy => debug!("Start receiving DATA while in CCA_BUSY state"),
            RxState::Idle | RxState::RxData => {}
        }

        let now = ctx.now();
        if self.state == RxState::RxData {
            self.open_or_join_window(now, duration)?;
        } else {
            self.rx_window = Some(RxWindow { start: now, duration });
            ctx.schedule(duration, PhyEvent::EndRxData);
            self.change_state(RxState::RxData, duration);
        }

        self.interference.start_rx(rx_psd, now);
        if !burst.is_empty() {
            self.rx_bursts.push(burst.to_vec());
        }
        self.rx_ctrl.extend_from_slice(ctrl);
        trace!("{} simultaneous data receptions", self.rx_bursts.len());
        Ok(())
    }

    fn start_rx_ctrl(
        &mut self,
        ctx: &mut PhyContext<'_>,
        duration: Duration,
        ctrl: &[ControlMessage],
    ) -> Result<(), LayerError> {
        match self.state {
            RxState::Tx | RxState::RxData => {
                return Err(ProtocolViolation::HalfDuplex {
                    state: self.state.to_string(),
                    incoming: "CTRL",
                }
                .into());
            }
            RxState::CcaBusy => debug!("Start receiving CTRL while in CCA_BUSY state"),
            RxState::Idle | RxState::RxCtrl => {}
        }

        let now = ctx.now();
        if self.state == RxState::RxCtrl {
            self.open_or_join_window(now, duration)?;
        } else {
            self.rx_window = Some(RxWindow { start: now, duration });
            ctx.schedule(duration, PhyEvent::EndRxCtrl);
            self.change_state(RxState::RxCtrl, duration);
        }
        self.rx_ctrl.extend_from_slice(ctrl);
        Ok(())
    }

    fn end_rx_data(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        if self.state != RxState::RxData {
            return Err(ProtocolViolation::UnexpectedEvent {
                event: "EndRxData",
                state: self.state.to_string(),
            }
            .into());
        }

        let sinr = self.interference.end_rx(ctx.now());
        self.indications.push(RxIndication::SinrReport(sinr.clone()));
        let any_payload = !self.rx_bursts.is_empty();

        for (rnti, tb) in self.transport_blocks.iter_mut() {
            let rb_sinr: Vec<f64> = tb
                .expected
                .rb_map
                .iter()
                .map(|rb| sinr.get(*rb).copied().unwrap_or(0.0))
                .collect();
            if rb_sinr.is_empty() {
                tb.sinr_avg = 0.0;
                tb.sinr_min = 0.0;
            } else {
                tb.sinr_avg = rb_sinr.iter().sum::<f64>() / rb_sinr.len() as f64;
                tb.sinr_min = rb_sinr.iter().copied().fold(f64::INFINITY, f64::min);
            }
            debug!(
                "RNTI {} finished RX, sinr avg {:.2} dB min {:.2} dB",
                rnti,
                common::linear_to_db(tb.sinr_avg),
                common::linear_to_db(tb.sinr_min)
            );

            if !self.config.error_model_enabled || !any_payload {
                continue;
            }

            let history = self
                .harq
                .get(tb.expected.direction, *rnti, tb.expected.harq_process);
            let output = self.error_model.get_tbler(
                &sinr,
                &tb.expected.rb_map,
                tb.expected.tb_size,
                tb.expected.mcs,
                history,
            );
            let sample: f64 = self.rng.gen();
            tb.corrupted = is_corrupted(sample, output.tbler);
            tb.output = Some(output);

            if tb.corrupted {
                info!(
                    "RNTI {} size {} mcs {} rbs {} rv {} history {} TBLER {:.3} corrupted",
                    rnti,
                    tb.expected.tb_size,
                    tb.expected.mcs,
                    tb.expected.rb_map.len(),
                    tb.expected.rv,
                    history.len(),
                    output.tbler
                );
            }
        }

        let bursts = std::mem::take(&mut self.rx_bursts);
        for pdu in bursts.into_iter().flatten() {
            if pdu.payload.is_empty() {
                continue;
            }
            let Some(tb) = self.transport_blocks.get_mut(&pdu.rnti) else {
                // Addressed to another device
                continue;
            };

            let trace = RxPacketTrace {
                slot: pdu.slot,
                sym_start: tb.expected.sym_start,
                num_sym: tb.expected.num_sym,
                rnti: pdu.rnti,
                cell_id: self.config.cell_id,
                direction: tb.expected.direction,
                tb_size: tb.expected.tb_size,
                mcs: tb.expected.mcs,
                rv: tb.expected.rv,
                sinr_avg: tb.sinr_avg,
                sinr_min: tb.sinr_min,
                tbler: tb.output.map(|o| o.tbler).unwrap_or(0.0),
                corrupted: tb.corrupted,
                rb_assigned_num: tb.expected.rb_map.len(),
            };
            let rnti = pdu.rnti;

            if !tb.corrupted {
                self.indications.push(RxIndication::DataReceived(pdu));
            } else {
                debug!("TB of RNTI {} failed", rnti);
            }
            self.indications.push(RxIndication::PacketTrace(trace));

            if tb.feedback_sent {
                continue;
            }
            tb.feedback_sent = true;

            let status = if tb.corrupted {
                HarqStatus::Nack
            } else {
                HarqStatus::Ack
            };
            let process = tb.expected.harq_process;
            let direction = tb.expected.direction;
            let indication = match direction {
                Direction::Ul => RxIndication::UlHarqFeedback(UlHarqInfo {
                    rnti,
                    harq_process: process,
                    num_retx: tb.expected.rv,
                    status,
                }),
                Direction::Dl => RxIndication::DlHarqFeedback(DlHarqInfo {
                    rnti,
                    harq_process: process,
                    num_retx: tb.expected.rv,
                    status,
                }),
            };
            self.indications.push(indication);

            if !tb.corrupted || tb.expected.rv >= self.config.max_retx {
                self.harq.reset(direction, rnti, process);
            } else if let Some(output) = tb.output {
                self.harq.update(direction, rnti, process, output);
            }
        }

        if !self.rx_ctrl.is_empty() {
            let ctrl = std::mem::take(&mut self.rx_ctrl);
            self.indications.push(RxIndication::CtrlReceived(ctrl));
        }

        self.finish_activity(ctx);
        for (rnti, tb) in &self.transport_blocks {
            if !tb.feedback_sent {
                debug!("Expected TB of RNTI {} never arrived", rnti);
            }
        }
        self.transport_blocks.clear();
        self.rx_window = None;
        Ok(())
    }

    fn end_rx_ctrl(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        if self.state != RxState::RxCtrl {
            return Err(ProtocolViolation::UnexpectedEvent {
                event: "EndRxCtrl",
                state: self.state.to_string(),
            }
            .into());
        }

        if !self.rx_ctrl.is_empty() {
            let ctrl = std::mem::take(&mut self.rx_ctrl);
            self.indications.push(RxIndication::CtrlReceived(ctrl));
        }
        self.finish_activity(ctx);
        self.rx_window = None;
        Ok(())
    }

    fn end_tx(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        if self.state != RxState::Tx {
            return Err(ProtocolViolation::UnexpectedEvent {
                event: "EndTx",
                state: self.state.to_string(),
            }
            .into());
        }
        self.finish_activity(ctx);
        Ok(())
    }

    /// Back to IDLE, or to CCA_BUSY if foreign energy is still on air
    fn finish_activity(&mut self, ctx: &mut PhyContext<'_>) {
        if self.config.contested {
            self.maybe_cca_busy(ctx);
        } else {
            self.change_state(RxState::Idle, Duration::ZERO);
        }
    }

    fn check_if_still_busy(&mut self, ctx: &mut PhyContext<'_>) -> Result<(), LayerError> {
        self.busy_check = None;
        match self.state {
            RxState::Idle => Err(ProtocolViolation::UnexpectedEvent {
                event: "CheckIfStillBusy",
                state: self.state.to_string(),
            }
            .into()),
            RxState::CcaBusy => {
                self.maybe_cca_busy(ctx);
                Ok(())
            }
            RxState::Tx | RxState::RxCtrl | RxState::RxData => {
                // Re-evaluated once the ongoing activity ends
                let remaining = self
                    .interference
                    .energy_duration(ctx.now(), self.cca_threshold_w);
                trace!("Channel busy for another {:?} while in {}", remaining, self.state);
                Ok(())
            }
        }
    }

    fn maybe_cca_busy(&mut self, ctx: &mut PhyContext<'_>) {
        let now = ctx.now();
        let delay = self.interference.energy_duration(now, self.cca_threshold_w);
        if delay.is_zero() {
            if let Some(id) = self.busy_check.take() {
                debug!("Channel idle before the pending busy check, cancelling it");
                ctx.cancel(id);
            }
            self.change_state(RxState::Idle, Duration::ZERO);
            return;
        }

        debug!("Channel detected busy for {:?}", delay);
        self.change_state(RxState::CcaBusy, delay);
        let ends = now + delay;
        if self.busy_until < ends {
            self.busy_until = ends;
            if let Some(id) = self.busy_check.take() {
                ctx.cancel(id);
            }
            self.busy_check = Some(ctx.schedule(delay, PhyEvent::CheckIfStillBusy));
        }
    }

    fn start_tx(
        &mut self,
        ctx: &mut PhyContext<'_>,
        kind: SignalKind,
        duration: Duration,
    ) -> Result<(), LayerError> {
        match self.state {
            RxState::RxCtrl | RxState::RxData | RxState::Tx => {
                return Err(ProtocolViolation::TransmitWhileBusy(self.state.to_string()).into());
            }
            RxState::CcaBusy => warn!("Start transmitting {} while in CCA_BUSY state", kind.name()),
            RxState::Idle => {}
        }

        trace!("Transmitting {} for {:?}", kind.name(), duration);
        self.change_state(RxState::Tx, duration);
        ctx.transmit(SpectrumSignal {
            tx: ctx.owner(),
            cell_id: self.config.cell_id,
            role: self.config.role,
            kind,
            psd: self.tx_psd.clone(),
            duration,
        });
        ctx.schedule(duration, PhyEvent::EndTx);
        Ok(())
    }
}

/// A draw equal to the TBLER still counts as a failure
fn is_corrupted(sample: f64, tbler: f64) -> bool {
    sample <= tbler
}

impl Radio for SpectrumPhy {
    fn cell_id(&self) -> CellId {
        self.config.cell_id
    }

    fn set_tx_power_spectral_density(&mut self, psd: Vec<f64>) {
        self.tx_psd = psd;
    }

    fn start_tx_data_frames(
        &mut self,
        ctx: &mut PhyContext<'_>,
        burst: Vec<MacPdu>,
        ctrl: Vec<ControlMessage>,
        duration: Duration,
    ) -> Result<(), LayerError> {
        self.start_tx(ctx, SignalKind::Data { burst, ctrl }, duration)
    }

    fn start_tx_ctrl_frames(
        &mut self,
        ctx: &mut PhyContext<'_>,
        ctrl: Vec<ControlMessage>,
        duration: Duration,
    ) -> Result<(), LayerError> {
        self.start_tx(ctx, SignalKind::Ctrl(ctrl), duration)
    }

    fn add_expected_tb(&mut self, tb: ExpectedTb) {
        if self.transport_blocks.contains_key(&tb.rnti) {
            debug!("Replacing expected TB of RNTI {}", tb.rnti);
        }
        trace!(
            "Expecting TB of RNTI {} size {} process {} rv {}",
            tb.rnti,
            tb.tb_size,
            tb.harq_process,
            tb.rv
        );
        self.transport_blocks.insert(
            tb.rnti,
            TbInfo {
                expected: tb,
                sinr_avg: 0.0,
                sinr_min: 0.0,
                output: None,
                corrupted: false,
                feedback_sent: false,
            },
        );
    }

    fn handle_event(&mut self, ctx: &mut PhyContext<'_>, event: PhyEvent) -> Result<(), LayerError> {
        match event {
            PhyEvent::StartRx(rx) => self.start_rx(ctx, rx),
            PhyEvent::EndRxData => self.end_rx_data(ctx),
            PhyEvent::EndRxCtrl => self.end_rx_ctrl(ctx),
            PhyEvent::EndTx => self.end_tx(ctx),
            PhyEvent::CheckIfStillBusy => self.check_if_still_busy(ctx),
            other => Err(ProtocolViolation::UnexpectedEvent {
                event: other.name(),
                state: self.state.to_string(),
            }
            .into()),
        }
    }

    fn drain_indications(&mut self) -> Vec<RxIndication> {
        std::mem::take(&mut self.indications)
    }
}
