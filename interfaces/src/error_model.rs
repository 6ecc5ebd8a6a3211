//! Block Error Models
//!
//! Map a per-RB SINR profile and the HARQ history of a process to a
//! transport block error probability.

use common::linear_to_db;
use serde::{Deserialize, Serialize};

/// Result of one error model evaluation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ErrorModelOutput {
    /// Transport block error probability
    pub tbler: f64,
}

/// Error model collaborator
pub trait ErrorModel {
    /// `sinr_per_rb` holds linear SINR indexed by RB; `rb_map` lists the RBs in use
    fn get_tbler(
        &self,
        sinr_per_rb: &[f64],
        rb_map: &[usize],
        tb_size: u32,
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> ErrorModelOutput;
}

/// Constant error probability, independent of channel conditions
#[derive(Debug, Clone, Copy)]
pub struct FixedTblerErrorModel {
    tbler: f64,
}

impl FixedTblerErrorModel {
    pub fn new(tbler: f64) -> Self {
        Self {
            tbler: tbler.clamp(0.0, 1.0),
        }
    }
}

impl ErrorModel for FixedTblerErrorModel {
    fn get_tbler(
        &self,
        _sinr_per_rb: &[f64],
        _rb_map: &[usize],
        _tb_size: u32,
        _mcs: u8,
        _history: &[ErrorModelOutput],
    ) -> ErrorModelOutput {
        ErrorModelOutput { tbler: self.tbler }
    }
}

/// Logistic curve around an MCS-dependent SINR threshold.
///
/// Retransmissions are chase-combined: each prior attempt adds the SINR of
/// the current one again.
#[derive(Debug, Clone, Copy)]
pub struct SinrThresholdErrorModel {
    /// Threshold at MCS 0 in dB
    base_threshold_db: f64,
    /// Threshold increase per MCS index in dB
    step_db: f64,
    /// Steepness of the curve per dB
    slope: f64,
}

impl Default for SinrThresholdErrorModel {
    fn default() -> Self {
        Self {
            base_threshold_db: -6.0,
            step_db: 1.0,
            slope: 1.5,
        }
    }
}

impl SinrThresholdErrorModel {
    pub fn new(base_threshold_db: f64, step_db: f64, slope: f64) -> Self {
        Self {
            base_threshold_db,
            step_db,
            slope,
        }
    }
}

impl ErrorModel for SinrThresholdErrorModel {
    fn get_tbler(
        &self,
        sinr_per_rb: &[f64],
        rb_map: &[usize],
        tb_size: u32,
        mcs: u8,
        history: &[ErrorModelOutput],
    ) -> ErrorModelOutput {
        let samples: Vec<f64> = rb_map
            .iter()
            .filter_map(|rb| sinr_per_rb.get(*rb).copied())
            .collect();
        if samples.is_empty() || tb_size == 0 {
            return ErrorModelOutput { tbler: 1.0 };
        }

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let combined = mean * (1 + history.len()) as f64;
        let effective_db = linear_to_db(combined);
        let threshold_db = self.base_threshold_db + self.step_db * f64::from(mcs);

        let tbler = 1.0 / (1.0 + (self.slope * (effective_db - threshold_db)).exp());
        ErrorModelOutput { tbler }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db_to_linear;

    #[test]
    fn test_fixed_model() {
        let model = FixedTblerErrorModel::new(0.3);
        assert_eq!(model.get_tbler(&[], &[], 100, 5, &[]).tbler, 0.3);
        assert_eq!(FixedTblerErrorModel::new(2.0).get_tbler(&[], &[], 1, 0, &[]).tbler, 1.0);
    }

    #[test]
    fn test_threshold_midpoint() {
        let model = SinrThresholdErrorModel::default();
        // MCS 6 threshold is 0 dB
        let sinr = vec![1.0; 4];
        let out = model.get_tbler(&sinr, &[0, 1, 2, 3], 100, 6, &[]);
        assert!((out.tbler - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_high_sinr_decodes() {
        let model = SinrThresholdErrorModel::default();
        let sinr = vec![db_to_linear(25.0); 8];
        let out = model.get_tbler(&sinr, &[0, 1], 100, 0, &[]);
        assert!(out.tbler < 1e-6);
    }

    #[test]
    fn test_combining_lowers_tbler() {
        let model = SinrThresholdErrorModel::default();
        let sinr = vec![db_to_linear(-2.0); 4];
        let first = model.get_tbler(&sinr, &[0, 1], 100, 4, &[]);
        let second = model.get_tbler(&sinr, &[0, 1], 100, 4, &[first]);
        assert!(second.tbler < first.tbler);
    }

    #[test]
    fn test_no_rbs_fails() {
        let model = SinrThresholdErrorModel::default();
        assert_eq!(model.get_tbler(&[1.0], &[], 100, 0, &[]).tbler, 1.0);
    }
}
