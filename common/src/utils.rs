//! Common Utilities
//!
//! Power unit conversions and resource-block helpers

use tracing::trace;

/// Thermal noise power spectral density in dBm/Hz
pub const THERMAL_NOISE_DBM_HZ: f64 = -174.0;

/// Subcarriers per resource block
pub const SUBCARRIERS_PER_RB: u32 = 12;

/// Convert dBm to Watt
pub fn dbm_to_watt(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) / 1000.0
}

/// Convert Watt to dBm
pub fn watt_to_dbm(watt: f64) -> f64 {
    10.0 * (watt * 1000.0).log10()
}

/// Convert a linear ratio to dB
pub fn linear_to_db(linear: f64) -> f64 {
    10.0 * linear.log10()
}

/// Convert dB to a linear ratio
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Euclidean modulo for signed offsets into a pattern of length `m`
pub fn modulo(n: i64, m: usize) -> usize {
    n.rem_euclid(m as i64) as usize
}

/// Calculate resource blocks from bandwidth and subcarrier spacing
pub fn calculate_nrb(bandwidth_hz: u32, scs_khz: u32) -> u16 {
    let scs_hz = scs_khz * 1000;
    let total_subcarriers = bandwidth_hz / scs_hz;
    let nrb = total_subcarriers / SUBCARRIERS_PER_RB;

    trace!("Calculated {} RBs for {}Hz bandwidth with {}kHz SCS",
           nrb, bandwidth_hz, scs_khz);

    nrb as u16
}

/// Noise power per resource block in Watt
pub fn noise_power_per_rb(scs_khz: u32, noise_figure_db: f64) -> f64 {
    let rb_bandwidth_hz = f64::from(SUBCARRIERS_PER_RB * scs_khz * 1000);
    dbm_to_watt(THERMAL_NOISE_DBM_HZ + noise_figure_db + linear_to_db(rb_bandwidth_hz))
}
