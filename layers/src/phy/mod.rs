//! Physical Layer (PHY) Submodules
//!
//! Slot timing and medium access of an NR base station PHY: the timing table
//! compiler, channel access bookkeeping, the per-slot engine and the
//! half-duplex receiver, plus the event and signal types they exchange.

pub mod alloc_store;
pub mod channel_access;
pub mod frame_structure;
pub mod gnb_phy;
pub mod harq;
pub mod interference;
pub mod spectrum;

// Re-export commonly used types
pub use alloc_store::AllocationStore;
pub use channel_access::{ChannelAccess, ChannelStatus};
pub use frame_structure::{ProcessingDelays, SlotConfig, SlotPattern, TimingMaps};
pub use gnb_phy::GnbPhy;
pub use harq::HarqHistory;
pub use interference::InterferenceTracker;
pub use spectrum::{RxState, SpectrumPhy, SpectrumPhyConfig};

use crate::LayerError;
use common::utils::dbm_to_watt;
use common::{
    CellId, ConfigError, DeviceRole, Direction, EventId, EventQueue, Numerology, Rnti,
};
use interfaces::{
    ControlMessage, DciInfo, DlHarqInfo, MacPdu, RxPacketTrace, UlHarqInfo,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// PHY layer configuration
#[derive(Debug, Clone)]
pub struct PhyConfig {
    pub cell_id: CellId,
    pub numerology: Numerology,
    pub symbols_per_slot: u8,
    /// Number of resource blocks in the carrier
    pub num_rbs: usize,
    pub rbs_per_rbg: usize,
    pub pattern: SlotPattern,
    pub delays: ProcessingDelays,
    /// Delay between end of reception and PDU delivery to the MAC
    pub tb_decode_latency: Duration,
    pub tx_power_dbm: f64,
    pub noise_figure_db: f64,
    /// Carrier that broadcasts MIB and SIB1
    pub is_primary: bool,
    /// Minimum time left in a slot to keep holding the channel
    pub guard_interval: Duration,
}

impl PhyConfig {
    pub fn new(cell_id: CellId, numerology: Numerology, pattern: SlotPattern) -> Self {
        Self {
            cell_id,
            numerology,
            symbols_per_slot: 14,
            num_rbs: 100,
            rbs_per_rbg: 1,
            pattern,
            delays: ProcessingDelays::default(),
            tb_decode_latency: Duration::from_micros(100),
            tx_power_dbm: 30.0,
            noise_figure_db: 5.0,
            is_primary: true,
            guard_interval: Duration::from_micros(25),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.delays.validate()?;
        SlotConfig::from_numerology(self.numerology, self.symbols_per_slot)?;
        if self.num_rbs == 0 {
            return Err(ConfigError::InvalidParameter("num_rbs must be positive".to_string()));
        }
        if self.rbs_per_rbg == 0 || self.rbs_per_rbg > self.num_rbs {
            return Err(ConfigError::InvalidParameter(format!(
                "rbs_per_rbg {} not in [1, {}]",
                self.rbs_per_rbg, self.num_rbs
            )));
        }
        Ok(())
    }

    pub fn symbol_period(&self) -> Duration {
        self.numerology.slot_duration() / u32::from(self.symbols_per_slot.max(1))
    }

    pub fn slot_period(&self) -> Duration {
        self.symbol_period() * u32::from(self.symbols_per_slot)
    }

    /// Resource block groups covering the carrier
    pub fn rbg_count(&self) -> usize {
        self.num_rbs.div_ceil(self.rbs_per_rbg.max(1))
    }
}

/// Index of an endpoint in the simulation registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub usize);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiver of a queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Endpoint(EndpointId),
    /// The shared channel, which fans signals out to every endpoint
    Channel,
}

#[derive(Debug, Clone)]
pub struct SimEvent {
    pub target: EventTarget,
    pub event: PhyEvent,
}

/// Everything that can be scheduled on the event queue
#[derive(Debug, Clone)]
pub enum PhyEvent {
    StartSlot(common::SlotAddress),
    EndSlot,
    StartVarTti(DciInfo),
    EndVarTti(DciInfo),
    SendDataChannels {
        dci: DciInfo,
        burst: Vec<MacPdu>,
        duration: Duration,
    },
    ChannelAccessGranted(Duration),
    ChannelAccessDenied,
    ChannelAccessLost,
    DeliverPdu(MacPdu),

    StartRx(RxSignal),
    EndRxData,
    EndRxCtrl,
    EndTx,
    CheckIfStillBusy,

    ExpectTb(DciInfo),
    SendUlData(DciInfo),
    SendUlCtrl,

    Transmit(Arc<SpectrumSignal>),
}

impl PhyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PhyEvent::StartSlot(_) => "StartSlot",
            PhyEvent::EndSlot => "EndSlot",
            PhyEvent::StartVarTti(_) => "StartVarTti",
            PhyEvent::EndVarTti(_) => "EndVarTti",
            PhyEvent::SendDataChannels { .. } => "SendDataChannels",
            PhyEvent::ChannelAccessGranted(_) => "ChannelAccessGranted",
            PhyEvent::ChannelAccessDenied => "ChannelAccessDenied",
            PhyEvent::ChannelAccessLost => "ChannelAccessLost",
            PhyEvent::DeliverPdu(_) => "DeliverPdu",
            PhyEvent::StartRx(_) => "StartRx",
            PhyEvent::EndRxData => "EndRxData",
            PhyEvent::EndRxCtrl => "EndRxCtrl",
            PhyEvent::EndTx => "EndTx",
            PhyEvent::CheckIfStillBusy => "CheckIfStillBusy",
            PhyEvent::ExpectTb(_) => "ExpectTb",
            PhyEvent::SendUlData(_) => "SendUlData",
            PhyEvent::SendUlCtrl => "SendUlCtrl",
            PhyEvent::Transmit(_) => "Transmit",
        }
    }
}

/// Access to the event queue on behalf of one endpoint
pub struct PhyContext<'a> {
    queue: &'a mut EventQueue<SimEvent>,
    owner: EndpointId,
}

impl<'a> PhyContext<'a> {
    pub fn new(queue: &'a mut EventQueue<SimEvent>, owner: EndpointId) -> Self {
        Self { queue, owner }
    }

    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    pub fn owner(&self) -> EndpointId {
        self.owner
    }

    /// Schedule `event` for the owning endpoint
    pub fn schedule(&mut self, delay: Duration, event: PhyEvent) -> EventId {
        self.queue.schedule(
            delay,
            SimEvent {
                target: EventTarget::Endpoint(self.owner),
                event,
            },
        )
    }

    /// Put a signal on the shared channel right now
    pub fn transmit(&mut self, signal: SpectrumSignal) -> EventId {
        self.queue.schedule(
            Duration::ZERO,
            SimEvent {
                target: EventTarget::Channel,
                event: PhyEvent::Transmit(Arc::new(signal)),
            },
        )
    }

    pub fn cancel(&mut self, id: EventId) -> bool {
        self.queue.cancel(id)
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.queue.is_pending(id)
    }
}

/// Payload of a signal on air
#[derive(Debug, Clone)]
pub enum SignalKind {
    Ctrl(Vec<ControlMessage>),
    Data {
        burst: Vec<MacPdu>,
        ctrl: Vec<ControlMessage>,
    },
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Ctrl(_) => "CTRL",
            SignalKind::Data { .. } => "DATA",
        }
    }
}

/// A transmission as emitted by an endpoint
#[derive(Debug, Clone)]
pub struct SpectrumSignal {
    pub tx: EndpointId,
    pub cell_id: CellId,
    pub role: DeviceRole,
    pub kind: SignalKind,
    /// Transmit power per RB in W
    pub psd: Vec<f64>,
    pub duration: Duration,
}

/// A signal as seen at one receiver
#[derive(Debug, Clone)]
pub struct RxSignal {
    pub signal: Arc<SpectrumSignal>,
    /// Received power per RB in W, after propagation loss
    pub rx_psd: Vec<f64>,
}

/// Transport block a receiver waits for
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedTb {
    pub rnti: Rnti,
    pub ndi: bool,
    pub tb_size: u32,
    pub mcs: u8,
    pub rb_map: Vec<usize>,
    pub harq_process: u8,
    pub rv: u8,
    pub direction: Direction,
    pub sym_start: u8,
    pub num_sym: u8,
}

impl ExpectedTb {
    pub fn from_dci(dci: &DciInfo, rbs_per_rbg: usize) -> Self {
        Self {
            rnti: dci.rnti,
            ndi: dci.ndi,
            tb_size: dci.tb_size,
            mcs: dci.mcs,
            rb_map: dci.rb_assignment(rbs_per_rbg),
            harq_process: dci.harq_process,
            rv: dci.rv,
            direction: dci.direction,
            sym_start: dci.sym_start,
            num_sym: dci.num_sym,
        }
    }
}

/// Outcome of a reception, collected by the owner of the radio
#[derive(Debug, Clone, PartialEq)]
pub enum RxIndication {
    DataReceived(MacPdu),
    CtrlReceived(Vec<ControlMessage>),
    DlHarqFeedback(DlHarqInfo),
    UlHarqFeedback(UlHarqInfo),
    /// Linear SINR per RB measured over a data window
    SinrReport(Vec<f64>),
    PacketTrace(RxPacketTrace),
    /// The radio left IDLE for at least this long
    ChannelOccupied(Duration),
}

/// Radio collaborator of a slot engine
pub trait Radio {
    fn cell_id(&self) -> CellId;

    /// Transmit power per RB used by the next transmissions
    fn set_tx_power_spectral_density(&mut self, psd: Vec<f64>);

    fn start_tx_data_frames(
        &mut self,
        ctx: &mut PhyContext<'_>,
        burst: Vec<MacPdu>,
        ctrl: Vec<ControlMessage>,
        duration: Duration,
    ) -> Result<(), LayerError>;

    fn start_tx_ctrl_frames(
        &mut self,
        ctx: &mut PhyContext<'_>,
        ctrl: Vec<ControlMessage>,
        duration: Duration,
    ) -> Result<(), LayerError>;

    fn add_expected_tb(&mut self, tb: ExpectedTb);

    /// Receiver-side events: signal arrivals, window ends, CCA rechecks
    fn handle_event(&mut self, ctx: &mut PhyContext<'_>, event: PhyEvent) -> Result<(), LayerError>;

    fn drain_indications(&mut self) -> Vec<RxIndication>;
}

/// Transmit power spread evenly over the carrier, zero outside `rbs`
pub fn tx_psd(rbs: &[usize], num_rbs: usize, tx_power_dbm: f64) -> Vec<f64> {
    let per_rb = dbm_to_watt(tx_power_dbm) / num_rbs.max(1) as f64;
    let mut psd = vec![0.0; num_rbs];
    for rb in rbs {
        if let Some(v) = psd.get_mut(*rb) {
            *v = per_rb;
        }
    }
    psd
}

/// Per-engine counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PhyStats {
    pub slots: u64,
    pub granted_slots: u64,
    pub access_requests: u64,
    pub grants: u64,
    pub denials: u64,
    pub dl_ctrl_bursts: u64,
    pub dl_data_bursts: u64,
    pub ul_data_expected: u64,
    pub requeued_allocations: u64,
    /// Data descriptors given up without going on air
    pub lapsed_data: u64,
    pub rx_ok: u64,
    pub rx_corrupted: u64,
    pub ul_harq_forwarded: u64,
    pub dl_harq_forwarded: u64,
    pub ctrl_msgs_received: u64,
}
