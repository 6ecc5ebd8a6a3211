//! Discrete-Event Simulation
//!
//! Registry of endpoints (base station engines and terminals) indexed by
//! [`EndpointId`], sharing one virtual-time event queue and one channel. A
//! transmission is fanned out to every other endpoint with the propagation
//! loss applied per RB.

pub mod terminal;

pub use terminal::{Terminal, TerminalConfig, TerminalStats};

use crate::mac::SchedulerStats;
use crate::phy::{
    EndpointId, EventTarget, GnbPhy, PhyContext, PhyEvent, PhyStats, RxSignal, SimEvent,
    SpectrumPhy, SpectrumSignal,
};
use crate::LayerError;
use common::{db_to_linear, CellId, EventQueue, Rnti};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Position on the plane, in meters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Free-space propagation between endpoints
#[derive(Debug, Clone, Copy)]
pub struct ChannelModel {
    pub frequency_hz: f64,
    /// Distances below this are clamped
    pub min_distance_m: f64,
}

impl Default for ChannelModel {
    fn default() -> Self {
        Self {
            frequency_hz: 3.5e9,
            min_distance_m: 1.0,
        }
    }
}

impl ChannelModel {
    /// Friis path loss in dB
    pub fn path_loss_db(&self, distance_m: f64) -> f64 {
        let d = distance_m.max(self.min_distance_m);
        20.0 * d.log10() + 20.0 * self.frequency_hz.log10() - 147.55
    }

    /// Linear power gain between two positions
    pub fn gain(&self, a: &Position, b: &Position) -> f64 {
        db_to_linear(-self.path_loss_db(a.distance(b)))
    }
}

pub enum Endpoint {
    Gnb(Box<GnbPhy<SpectrumPhy>>),
    Terminal(Box<Terminal>),
}

impl Endpoint {
    pub fn cell_id(&self) -> CellId {
        match self {
            Endpoint::Gnb(phy) => phy.config().cell_id,
            Endpoint::Terminal(ue) => ue.cell_id(),
        }
    }

    fn handle_event(&mut self, ctx: &mut PhyContext<'_>, event: PhyEvent) -> Result<(), LayerError> {
        match self {
            Endpoint::Gnb(phy) => phy.handle_event(ctx, event),
            Endpoint::Terminal(ue) => ue.handle_event(ctx, event),
        }
    }
}

struct Node {
    endpoint: Endpoint,
    position: Position,
    scheduler: Option<Rc<RefCell<SchedulerStats>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellReport {
    pub cell_id: u16,
    pub phy: PhyStats,
    pub scheduler: Option<SchedulerStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalReport {
    pub rnti: u16,
    pub cell_id: u16,
    pub synchronized: bool,
    pub stats: TerminalStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub simulated_time_us: u128,
    pub events: u64,
    pub cells: Vec<CellReport>,
    pub terminals: Vec<TerminalReport>,
}

pub struct Simulation {
    queue: EventQueue<SimEvent>,
    nodes: Vec<Node>,
    channel: ChannelModel,
    stop: Arc<AtomicBool>,
    started: bool,
    events_processed: u64,
}

impl Simulation {
    pub fn new(channel: ChannelModel) -> Self {
        Self::with_stop_flag(channel, Arc::new(AtomicBool::new(false)))
    }

    /// Simulation that returns early once `stop` is set
    pub fn with_stop_flag(channel: ChannelModel, stop: Arc<AtomicBool>) -> Self {
        Self {
            queue: EventQueue::new(),
            nodes: Vec::new(),
            channel,
            stop,
            started: false,
            events_processed: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn add_gnb(
        &mut self,
        phy: GnbPhy<SpectrumPhy>,
        position: Position,
        scheduler: Option<Rc<RefCell<SchedulerStats>>>,
    ) -> Result<EndpointId, LayerError> {
        let cell_id = phy.config().cell_id;
        if self.gnb_index(cell_id).is_some() {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {} already has a base station",
                cell_id
            )));
        }
        let id = EndpointId(self.nodes.len());
        info!("Adding gNB of cell {} as endpoint {}", cell_id, id);
        self.nodes.push(Node {
            endpoint: Endpoint::Gnb(Box::new(phy)),
            position,
            scheduler,
        });
        Ok(id)
    }

    /// Register a terminal and attach it to the engine of its cell
    pub fn add_terminal(&mut self, ue: Terminal, position: Position) -> Result<EndpointId, LayerError> {
        let cell_id = ue.cell_id();
        let Some(gnb) = self.gnb_index(cell_id) else {
            return Err(LayerError::InvalidConfiguration(format!(
                "no base station for cell {} of UE {}",
                cell_id,
                ue.rnti()
            )));
        };
        if let Endpoint::Gnb(phy) = &mut self.nodes[gnb].endpoint {
            if !phy.add_ue(ue.rnti()) {
                return Err(LayerError::InvalidConfiguration(format!(
                    "RNTI {} already attached to cell {}",
                    ue.rnti(),
                    cell_id
                )));
            }
        }
        let id = EndpointId(self.nodes.len());
        info!("Adding UE {} of cell {} as endpoint {}", ue.rnti(), cell_id, id);
        self.nodes.push(Node {
            endpoint: Endpoint::Terminal(Box::new(ue)),
            position,
            scheduler: None,
        });
        Ok(id)
    }

    fn gnb_index(&self, cell_id: CellId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| matches!(&n.endpoint, Endpoint::Gnb(phy) if phy.config().cell_id == cell_id))
    }

    pub fn gnb(&self, cell_id: CellId) -> Option<&GnbPhy<SpectrumPhy>> {
        self.nodes.iter().find_map(|n| match &n.endpoint {
            Endpoint::Gnb(phy) if phy.config().cell_id == cell_id => Some(phy.as_ref()),
            _ => None,
        })
    }

    pub fn terminal(&self, rnti: Rnti) -> Option<&Terminal> {
        self.nodes.iter().find_map(|n| match &n.endpoint {
            Endpoint::Terminal(ue) if ue.rnti() == rnti => Some(ue.as_ref()),
            _ => None,
        })
    }

    /// Start every base station at slot 0/0/0
    pub fn start(&mut self) -> Result<(), LayerError> {
        if self.started {
            return Err(LayerError::InvalidState("simulation already started".to_string()));
        }
        self.started = true;
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if let Endpoint::Gnb(phy) = &mut node.endpoint {
                let mut ctx = PhyContext::new(&mut self.queue, EndpointId(index));
                phy.start_event_loop(&mut ctx, 0, 0, 0)?;
            }
        }
        Ok(())
    }

    /// Process events up to and including `end`. Stops at the first error.
    pub fn run_until(&mut self, end: Duration) -> Result<(), LayerError> {
        if !self.started {
            self.start()?;
        }
        while let Some(at) = self.queue.peek_time() {
            if at > end {
                break;
            }
            if self.stop.load(Ordering::Relaxed) {
                warn!("Simulation stopped at {:?}", self.queue.now());
                break;
            }
            let Some((_, event)) = self.queue.pop() else {
                break;
            };
            self.events_processed += 1;
            self.dispatch(event)?;
        }
        debug!(
            "Ran until {:?} after {} events",
            self.queue.now(),
            self.events_processed
        );
        Ok(())
    }

    fn dispatch(&mut self, event: SimEvent) -> Result<(), LayerError> {
        match (event.target, event.event) {
            (EventTarget::Channel, PhyEvent::Transmit(signal)) => self.fan_out(signal),
            (EventTarget::Channel, other) => {
                warn!("Channel ignoring {}", other.name());
                Ok(())
            }
            (EventTarget::Endpoint(id), event) => {
                let Some(node) = self.nodes.get_mut(id.0) else {
                    return Err(LayerError::UnknownEndpoint(id.0));
                };
                let mut ctx = PhyContext::new(&mut self.queue, id);
                node.endpoint.handle_event(&mut ctx, event)
            }
        }
    }

    /// Deliver a transmission to every endpoint but its sender
    fn fan_out(&mut self, signal: Arc<SpectrumSignal>) -> Result<(), LayerError> {
        let Some(tx) = self.nodes.get(signal.tx.0) else {
            return Err(LayerError::UnknownEndpoint(signal.tx.0));
        };
        let tx_position = tx.position;
        trace!(
            "Channel: {} from {} of cell {} for {:?}",
            signal.kind.name(),
            signal.tx,
            signal.cell_id,
            signal.duration
        );

        for (index, node) in self.nodes.iter().enumerate() {
            if index == signal.tx.0 {
                continue;
            }
            let gain = self.channel.gain(&tx_position, &node.position);
            let rx_psd = signal.psd.iter().map(|p| p * gain).collect();
            self.queue.schedule(
                Duration::ZERO,
                SimEvent {
                    target: EventTarget::Endpoint(EndpointId(index)),
                    event: PhyEvent::StartRx(RxSignal {
                        signal: Arc::clone(&signal),
                        rx_psd,
                    }),
                },
            );
        }
        Ok(())
    }

    pub fn report(&self) -> SimulationReport {
        let mut cells = Vec::new();
        let mut terminals = Vec::new();
        for node in &self.nodes {
            match &node.endpoint {
                Endpoint::Gnb(phy) => cells.push(CellReport {
                    cell_id: phy.config().cell_id.0,
                    phy: phy.stats().clone(),
                    scheduler: node.scheduler.as_ref().map(|s| s.borrow().clone()),
                }),
                Endpoint::Terminal(ue) => terminals.push(TerminalReport {
                    rnti: ue.rnti().value(),
                    cell_id: ue.cell_id().0,
                    synchronized: ue.is_synchronized(),
                    stats: ue.stats().clone(),
                }),
            }
        }
        SimulationReport {
            simulated_time_us: self.queue.now().as_micros(),
            events: self.events_processed,
            cells,
            terminals,
        }
    }
}
