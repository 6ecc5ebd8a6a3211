//! HARQ Soft-Combining History
//!
//! Error model outputs of earlier attempts, per user and HARQ process, kept
//! separately for both directions.

use common::{Direction, Rnti};
use interfaces::ErrorModelOutput;
use std::collections::HashMap;
use tracing::trace;

type ProcessKey = (Rnti, u8);

#[derive(Debug, Default, Clone)]
pub struct HarqHistory {
    dl: HashMap<ProcessKey, Vec<ErrorModelOutput>>,
    ul: HashMap<ProcessKey, Vec<ErrorModelOutput>>,
}

impl HarqHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, direction: Direction) -> &HashMap<ProcessKey, Vec<ErrorModelOutput>> {
        match direction {
            Direction::Dl => &self.dl,
            Direction::Ul => &self.ul,
        }
    }

    fn map_mut(&mut self, direction: Direction) -> &mut HashMap<ProcessKey, Vec<ErrorModelOutput>> {
        match direction {
            Direction::Dl => &mut self.dl,
            Direction::Ul => &mut self.ul,
        }
    }

    /// Prior attempts of a process; empty for a fresh one
    pub fn get(&self, direction: Direction, rnti: Rnti, process: u8) -> &[ErrorModelOutput] {
        self.map(direction)
            .get(&(rnti, process))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn reset(&mut self, direction: Direction, rnti: Rnti, process: u8) {
        trace!("Reset {:?} HARQ history of RNTI {} process {}", direction, rnti, process);
        self.map_mut(direction).remove(&(rnti, process));
    }

    pub fn update(&mut self, direction: Direction, rnti: Rnti, process: u8, output: ErrorModelOutput) {
        let history = self.map_mut(direction).entry((rnti, process)).or_default();
        history.push(output);
        trace!(
            "{:?} HARQ history of RNTI {} process {} now holds {} attempts",
            direction,
            rnti,
            process,
            history.len()
        );
    }
}
