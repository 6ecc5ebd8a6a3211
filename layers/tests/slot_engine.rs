//! End-to-end runs of base station engines and terminals on a shared channel

use common::{CellId, DeviceRole, Numerology, Rnti};
use interfaces::{AlwaysOnAccessManager, BackoffAccessManager, ChannelAccessManager, FixedTblerErrorModel};
use layers::mac::{RoundRobinScheduler, SchedulerConfig};
use layers::phy::{GnbPhy, PhyConfig, SlotPattern, SpectrumPhy, SpectrumPhyConfig};
use layers::sim::{ChannelModel, Position, Simulation, SimulationReport, Terminal, TerminalConfig};
use std::time::Duration;

const NUM_RBS: usize = 8;

fn numerology() -> Numerology {
    Numerology::new(1).unwrap()
}

fn add_cell(sim: &mut Simulation, cell: u16, pattern: &str, position: Position) {
    add_cell_with(
        sim,
        cell,
        pattern,
        position,
        Box::new(AlwaysOnAccessManager::default()),
        false,
    );
}

fn add_cell_with(
    sim: &mut Simulation,
    cell: u16,
    pattern: &str,
    position: Position,
    cam: Box<dyn ChannelAccessManager>,
    contested: bool,
) {
    let pattern: SlotPattern = pattern.parse().unwrap();
    let mut config = PhyConfig::new(CellId(cell), numerology(), pattern);
    config.num_rbs = NUM_RBS;
    let mut radio_config = SpectrumPhyConfig::new(CellId(cell), DeviceRole::BaseStation, NUM_RBS, numerology());
    radio_config.contested = contested;
    let radio = SpectrumPhy::new(radio_config, Box::new(FixedTblerErrorModel::new(0.0)));
    let mac = RoundRobinScheduler::new(SchedulerConfig::new(CellId(cell), NUM_RBS, 14)).unwrap();
    let stats = mac.stats_handle();
    let phy = GnbPhy::new(config, radio, Box::new(mac), cam).unwrap();
    sim.add_gnb(phy, position, Some(stats)).unwrap();
}

fn add_ue(sim: &mut Simulation, rnti: u16, cell: u16, ul_buffer: u32, position: Position) {
    add_ue_with(sim, rnti, cell, ul_buffer, position, false);
}

fn add_ue_with(sim: &mut Simulation, rnti: u16, cell: u16, ul_buffer: u32, position: Position, contested: bool) {
    let mut config = TerminalConfig::new(Rnti(rnti), CellId(cell), numerology());
    config.num_rbs = NUM_RBS;
    config.ul_buffer_bytes = ul_buffer;
    let mut radio_config = SpectrumPhyConfig::new(CellId(cell), DeviceRole::Terminal, NUM_RBS, numerology());
    radio_config.contested = contested;
    let radio = SpectrumPhy::new(radio_config, Box::new(FixedTblerErrorModel::new(0.0)));
    sim.add_terminal(Terminal::new(config, radio).unwrap(), position)
        .unwrap();
}

fn run(sim: &mut Simulation, ms: u64) -> SimulationReport {
    sim.run_until(Duration::from_millis(ms)).unwrap();
    sim.report()
}

#[test]
fn test_single_cell_tdd() {
    let mut sim = Simulation::new(ChannelModel::default());
    add_cell(&mut sim, 1, "DL|DL|DL|F|UL|", Position::default());
    add_ue(&mut sim, 10, 1, 4096, Position::new(30.0, 0.0));
    add_ue(&mut sim, 11, 1, 0, Position::new(0.0, 60.0));

    let report = run(&mut sim, 40);
    let cell = &report.cells[0];
    let scheduler = cell.scheduler.as_ref().unwrap();

    assert!(cell.phy.grants > 0);
    assert_eq!(cell.phy.denials, 0);
    assert_eq!(scheduler.rach_received, 2);
    assert!(scheduler.dl_new_tx > 0);
    assert!(scheduler.dl_acks > 0);
    assert_eq!(scheduler.dl_nacks, 0);
    assert!(scheduler.ul_new_tx > 0);
    assert!(scheduler.ul_rx_bytes > 0);

    for ue in &report.terminals {
        assert!(ue.synchronized);
        assert_eq!(ue.stats.rach_sent, 1);
        assert!(ue.stats.dl_dcis > 0);
        assert!(ue.stats.dl_tb_ok > 0);
        assert_eq!(ue.stats.dl_tb_corrupted, 0);
    }

    // Only the UE with data asks for UL grants
    let quiet = sim.terminal(Rnti(11)).unwrap();
    assert_eq!(quiet.stats().ul_dcis, 0);
    let busy = sim.terminal(Rnti(10)).unwrap();
    assert!(busy.stats().ul_tx_bytes > 0);
    assert!(busy.ul_buffer() < 4096);
}

#[test]
fn test_flexible_slots_only() {
    let mut sim = Simulation::new(ChannelModel::default());
    add_cell(&mut sim, 1, "F|", Position::default());
    add_ue(&mut sim, 20, 1, 1024, Position::new(10.0, 10.0));

    let report = run(&mut sim, 20);
    let scheduler = report.cells[0].scheduler.as_ref().unwrap();
    assert_eq!(scheduler.rach_received, 1);
    assert!(scheduler.dl_acks > 0);
    assert!(scheduler.ul_rx_bytes > 0);
    assert!(report.terminals[0].stats.dl_harq_sent > 0);
}

#[test]
fn test_two_cells_share_the_channel() {
    let mut sim = Simulation::new(ChannelModel::default());
    add_cell(&mut sim, 1, "DL|DL|F|UL|", Position::default());
    add_cell(&mut sim, 2, "DL|DL|F|UL|", Position::new(2000.0, 0.0));
    add_ue(&mut sim, 30, 1, 0, Position::new(20.0, 0.0));
    add_ue(&mut sim, 31, 2, 0, Position::new(1980.0, 0.0));

    let report = run(&mut sim, 30);
    for cell in &report.cells {
        let scheduler = cell.scheduler.as_ref().unwrap();
        assert_eq!(scheduler.rach_received, 1);
        assert!(scheduler.dl_acks > 0);
    }
    // Each terminal only decodes its own cell
    for ue in &report.terminals {
        assert!(ue.synchronized);
        assert!(ue.stats.dl_tb_ok > 0);
    }
    assert!(sim.gnb(CellId(1)).unwrap().is_ue_attached(Rnti(30)));
    assert!(!sim.gnb(CellId(1)).unwrap().is_ue_attached(Rnti(31)));
}

#[test]
fn test_report_serializes() {
    let mut sim = Simulation::new(ChannelModel::default());
    add_cell(&mut sim, 3, "DL|UL|", Position::default());
    add_ue(&mut sim, 40, 3, 0, Position::new(5.0, 0.0));

    let report = run(&mut sim, 5);
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"cell_id\":3"));
    assert!(json.contains("\"rnti\":40"));
    assert!(report.simulated_time_us <= 5000);
}

#[test]
fn test_backoff_cell_keeps_running() {
    let mut sim = Simulation::new(ChannelModel::default());
    add_cell_with(
        &mut sim,
        5,
        "DL|DL|DL|F|UL|",
        Position::default(),
        Box::new(BackoffAccessManager::new(1, 15, Duration::from_millis(2))),
        true,
    );
    add_ue_with(&mut sim, 50, 5, 4096, Position::new(25.0, 0.0), true);

    let report = run(&mut sim, 60);
    let cell = &report.cells[0];
    let scheduler = cell.scheduler.as_ref().unwrap();

    // Full DL slots give the channel up, so the medium is requested again and again
    assert!(cell.phy.grants > 1);
    assert_eq!(cell.phy.denials, 0);
    assert!(cell.phy.requeued_allocations > 0);
    assert_eq!(scheduler.rach_received, 1);
    assert!(scheduler.dl_acks > 0);
    assert!(scheduler.ul_new_tx > 0);

    let ue = &report.terminals[0];
    assert!(ue.synchronized);
    assert!(ue.stats.dl_tb_ok > 0);
    assert!(report.simulated_time_us > 50_000);
}

#[test]
fn test_backoff_cell_next_to_licensed_cell() {
    let mut sim = Simulation::new(ChannelModel::default());
    add_cell(&mut sim, 1, "DL|DL|DL|F|UL|", Position::default());
    add_cell_with(
        &mut sim,
        2,
        "DL|DL|DL|F|UL|",
        Position::new(500.0, 0.0),
        Box::new(BackoffAccessManager::new(2, 15, Duration::from_millis(4))),
        true,
    );
    add_ue(&mut sim, 100, 1, 20000, Position::new(40.0, 10.0));
    add_ue_with(&mut sim, 200, 2, 5000, Position::new(460.0, 5.0), true);

    let report = run(&mut sim, 60);
    for cell in &report.cells {
        let scheduler = cell.scheduler.as_ref().unwrap();
        assert_eq!(scheduler.rach_received, 1);
        assert!(scheduler.dl_new_tx > 0);
    }
    assert!(report.terminals.iter().all(|ue| ue.synchronized));
}
