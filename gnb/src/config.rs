//! Simulation Configuration
//!
//! Cells, terminals and channel of one run, loaded from YAML or TOML.

use anyhow::{bail, Context};
use common::{CellId, DeviceRole, Numerology, Rnti};
use interfaces::{
    AlwaysOnAccessManager, BackoffAccessManager, ChannelAccessManager, ErrorModel,
    FixedTblerErrorModel, SinrThresholdErrorModel,
};
use layers::mac::SchedulerConfig;
use layers::phy::{PhyConfig, ProcessingDelays, SlotPattern, SpectrumPhyConfig};
use layers::sim::{ChannelModel, Position, TerminalConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GnbConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    pub cells: Vec<CellConfig>,
    #[serde(default)]
    pub ues: Vec<UeConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Simulated time
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Seed of every random generator, offset per endpoint
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Carrier frequency for the propagation model
    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            seed: default_seed(),
            frequency_hz: default_frequency_hz(),
        }
    }
}

fn default_duration_ms() -> u64 {
    100
}

fn default_seed() -> u64 {
    1
}

fn default_frequency_hz() -> f64 {
    3.5e9
}

/// One base station carrier
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    pub cell_id: u16,
    #[serde(default = "default_numerology")]
    pub numerology: u8,
    /// Slot types separated by `|`, e.g. "DL|DL|S|UL|"
    pub pattern: String,
    #[serde(default = "default_symbols_per_slot")]
    pub symbols_per_slot: u8,
    #[serde(default = "default_num_rbs")]
    pub num_rbs: usize,
    #[serde(default = "default_rbs_per_rbg")]
    pub rbs_per_rbg: usize,
    #[serde(default = "default_gnb_tx_power")]
    pub tx_power_dbm: f64,
    #[serde(default = "default_noise_figure")]
    pub noise_figure_db: f64,
    #[serde(default)]
    pub delays: DelaysConfig,
    #[serde(default = "default_tb_decode_latency_us")]
    pub tb_decode_latency_us: u64,
    #[serde(default = "default_guard_interval_us")]
    pub guard_interval_us: u64,
    #[serde(default = "default_true")]
    pub primary: bool,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default)]
    pub channel_access: ChannelAccessConfig,
    #[serde(default)]
    pub error_model: ErrorModelConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

fn default_numerology() -> u8 {
    1
}

fn default_symbols_per_slot() -> u8 {
    14
}

fn default_num_rbs() -> usize {
    52
}

fn default_rbs_per_rbg() -> usize {
    4
}

fn default_gnb_tx_power() -> f64 {
    30.0
}

fn default_ue_tx_power() -> f64 {
    23.0
}

fn default_noise_figure() -> f64 {
    5.0
}

fn default_tb_decode_latency_us() -> u64 {
    100
}

fn default_guard_interval_us() -> u64 {
    25
}

fn default_true() -> bool {
    true
}

/// Processing delays in slots
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DelaysConfig {
    #[serde(default)]
    pub n0: u32,
    #[serde(default = "default_two")]
    pub n1: u32,
    #[serde(default = "default_two")]
    pub n2: u32,
    #[serde(default = "default_two")]
    pub l1l2_ctrl_latency: u32,
}

impl Default for DelaysConfig {
    fn default() -> Self {
        let delays = ProcessingDelays::default();
        Self {
            n0: delays.n0,
            n1: delays.n1,
            n2: delays.n2,
            l1l2_ctrl_latency: delays.l1l2_ctrl_latency,
        }
    }
}

fn default_two() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct PositionConfig {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

impl From<PositionConfig> for Position {
    fn from(p: PositionConfig) -> Self {
        Position::new(p.x, p.y)
    }
}

/// How a cell gets hold of the medium
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelAccessConfig {
    /// Licensed carrier, every request granted
    AlwaysOn {
        #[serde(default = "default_grant_ms")]
        grant_ms: u64,
    },
    /// Random backoff before each grant
    Backoff {
        #[serde(default = "default_contention_window")]
        contention_window: u32,
        #[serde(default = "default_txop_us")]
        txop_us: u64,
    },
}

impl Default for ChannelAccessConfig {
    fn default() -> Self {
        ChannelAccessConfig::AlwaysOn {
            grant_ms: default_grant_ms(),
        }
    }
}

fn default_grant_ms() -> u64 {
    1000
}

fn default_contention_window() -> u32 {
    15
}

fn default_txop_us() -> u64 {
    4000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorModelConfig {
    /// Every block fails with the same probability
    Fixed {
        #[serde(default)]
        tbler: f64,
    },
    SinrThreshold {
        #[serde(default = "default_threshold_db")]
        base_threshold_db: f64,
        #[serde(default = "default_step_db")]
        step_db: f64,
        #[serde(default = "default_slope")]
        slope: f64,
    },
    /// Every block decodes
    Disabled,
}

impl Default for ErrorModelConfig {
    fn default() -> Self {
        ErrorModelConfig::SinrThreshold {
            base_threshold_db: default_threshold_db(),
            step_db: default_step_db(),
            slope: default_slope(),
        }
    }
}

fn default_threshold_db() -> f64 {
    -6.0
}

fn default_step_db() -> f64 {
    1.0
}

fn default_slope() -> f64 {
    1.5
}

impl ErrorModelConfig {
    pub fn build(&self) -> Box<dyn ErrorModel> {
        match *self {
            ErrorModelConfig::Fixed { tbler } => Box::new(FixedTblerErrorModel::new(tbler)),
            ErrorModelConfig::SinrThreshold {
                base_threshold_db,
                step_db,
                slope,
            } => Box::new(SinrThresholdErrorModel::new(base_threshold_db, step_db, slope)),
            ErrorModelConfig::Disabled => Box::new(FixedTblerErrorModel::new(0.0)),
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, ErrorModelConfig::Disabled)
    }
}

/// Reference scheduler knobs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_dl_tb_size")]
    pub dl_tb_size: u32,
    #[serde(default = "default_ul_tb_size")]
    pub ul_tb_size: u32,
    #[serde(default = "default_max_retx")]
    pub max_retx: u8,
    #[serde(default = "default_max_ues_per_slot")]
    pub max_ues_per_slot: usize,
    #[serde(default = "default_true")]
    pub dl_full_buffer: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            dl_tb_size: default_dl_tb_size(),
            ul_tb_size: default_ul_tb_size(),
            max_retx: default_max_retx(),
            max_ues_per_slot: default_max_ues_per_slot(),
            dl_full_buffer: true,
        }
    }
}

fn default_dl_tb_size() -> u32 {
    512
}

fn default_ul_tb_size() -> u32 {
    256
}

fn default_max_retx() -> u8 {
    3
}

fn default_max_ues_per_slot() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UeConfig {
    pub rnti: u16,
    pub cell_id: u16,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default = "default_ue_tx_power")]
    pub tx_power_dbm: f64,
    #[serde(default)]
    pub ul_buffer_bytes: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Used when neither RUST_LOG nor --log-level is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GnbConfig {
    /// Load configuration, YAML or TOML by file extension
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml_str(&contents)?,
            Some("toml") => Self::from_toml_str(&contents)?,
            other => bail!("unsupported configuration format {:?} for {}", other, path.display()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Cross-checks a single cell cannot see
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cells.is_empty() {
            bail!("at least one cell is required");
        }
        for (i, cell) in self.cells.iter().enumerate() {
            if self.cells[..i].iter().any(|c| c.cell_id == cell.cell_id) {
                bail!("cell {} configured twice", cell.cell_id);
            }
            cell.phy_config()?;
        }
        for (i, ue) in self.ues.iter().enumerate() {
            if !self.cells.iter().any(|c| c.cell_id == ue.cell_id) {
                bail!("UE {} refers to unknown cell {}", ue.rnti, ue.cell_id);
            }
            if self.ues[..i].iter().any(|u| u.rnti == ue.rnti) {
                bail!("RNTI {} configured twice", ue.rnti);
            }
        }
        Ok(())
    }

    pub fn channel_model(&self) -> ChannelModel {
        ChannelModel {
            frequency_hz: self.simulation.frequency_hz,
            ..ChannelModel::default()
        }
    }

    pub fn cell(&self, cell_id: u16) -> Option<&CellConfig> {
        self.cells.iter().find(|c| c.cell_id == cell_id)
    }
}

impl CellConfig {
    pub fn numerology(&self) -> anyhow::Result<Numerology> {
        Ok(Numerology::new(self.numerology)?)
    }

    /// Slot engine configuration, validated
    pub fn phy_config(&self) -> anyhow::Result<PhyConfig> {
        let pattern: SlotPattern = self
            .pattern
            .parse()
            .with_context(|| format!("pattern of cell {}", self.cell_id))?;
        let mut config = PhyConfig::new(CellId(self.cell_id), self.numerology()?, pattern);
        config.symbols_per_slot = self.symbols_per_slot;
        config.num_rbs = self.num_rbs;
        config.rbs_per_rbg = self.rbs_per_rbg;
        config.delays = ProcessingDelays {
            n0: self.delays.n0,
            n1: self.delays.n1,
            n2: self.delays.n2,
            l1l2_ctrl_latency: self.delays.l1l2_ctrl_latency,
        };
        config.tb_decode_latency = Duration::from_micros(self.tb_decode_latency_us);
        config.tx_power_dbm = self.tx_power_dbm;
        config.noise_figure_db = self.noise_figure_db;
        config.is_primary = self.primary;
        config.guard_interval = Duration::from_micros(self.guard_interval_us);
        config
            .validate()
            .with_context(|| format!("cell {}", self.cell_id))?;
        Ok(config)
    }

    pub fn radio_config(&self, seed: u64) -> anyhow::Result<SpectrumPhyConfig> {
        let mut config = SpectrumPhyConfig::new(
            CellId(self.cell_id),
            DeviceRole::BaseStation,
            self.num_rbs,
            self.numerology()?,
        );
        config.noise_figure_db = self.noise_figure_db;
        config.contested = matches!(self.channel_access, ChannelAccessConfig::Backoff { .. });
        config.error_model_enabled = self.error_model.enabled();
        config.max_retx = self.scheduler.max_retx;
        config.seed = seed;
        Ok(config)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let num_rbgs = self.num_rbs.div_ceil(self.rbs_per_rbg.max(1));
        let mut config = SchedulerConfig::new(CellId(self.cell_id), num_rbgs, self.symbols_per_slot);
        config.dl_tb_size = self.scheduler.dl_tb_size;
        config.ul_tb_size = self.scheduler.ul_tb_size;
        config.max_retx = self.scheduler.max_retx;
        config.max_ues_per_slot = self.scheduler.max_ues_per_slot;
        config.dl_full_buffer = self.scheduler.dl_full_buffer;
        config
    }

    pub fn channel_access_manager(&self, seed: u64) -> Box<dyn ChannelAccessManager> {
        match self.channel_access {
            ChannelAccessConfig::AlwaysOn { grant_ms } => {
                Box::new(AlwaysOnAccessManager::new(Duration::from_millis(grant_ms)))
            }
            ChannelAccessConfig::Backoff {
                contention_window,
                txop_us,
            } => Box::new(BackoffAccessManager::new(
                seed,
                contention_window,
                Duration::from_micros(txop_us),
            )),
        }
    }
}

impl UeConfig {
    /// Terminal and radio configuration on the carrier of `cell`
    pub fn terminal_config(
        &self,
        cell: &CellConfig,
        seed: u64,
    ) -> anyhow::Result<(TerminalConfig, SpectrumPhyConfig)> {
        let numerology = cell.numerology()?;
        let mut config = TerminalConfig::new(Rnti(self.rnti), CellId(self.cell_id), numerology);
        config.symbols_per_slot = cell.symbols_per_slot;
        config.num_rbs = cell.num_rbs;
        config.rbs_per_rbg = cell.rbs_per_rbg;
        config.tx_power_dbm = self.tx_power_dbm;
        config.ul_ctrl_symbol = cell.symbols_per_slot.saturating_sub(1);
        config.ul_buffer_bytes = self.ul_buffer_bytes;

        let mut radio =
            SpectrumPhyConfig::new(CellId(self.cell_id), DeviceRole::Terminal, cell.num_rbs, numerology);
        radio.noise_figure_db = cell.noise_figure_db;
        radio.error_model_enabled = cell.error_model.enabled();
        radio.max_retx = cell.scheduler.max_retx;
        radio.seed = seed;
        Ok((config, radio))
    }
}
