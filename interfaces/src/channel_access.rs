//! Channel Access Managers
//!
//! A manager decides whether a contested medium may be used. The answer can be
//! synchronous, delivered later as a scheduled event, or left to an outside
//! party.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, trace};

/// Answer to a channel access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResponse {
    /// Medium granted now for the given duration
    Granted(Duration),
    /// Medium refused now
    Denied,
    /// Decision delivered after `after`; `None` means denial
    Deferred {
        after: Duration,
        grant: Option<Duration>,
    },
    /// Decision delivered by an outside party
    Pending,
}

/// Channel access collaborator
pub trait ChannelAccessManager {
    fn request_access(&mut self, now: Duration) -> AccessResponse;

    fn name(&self) -> &'static str;
}

/// Licensed-band manager: every request is granted immediately
#[derive(Debug, Clone)]
pub struct AlwaysOnAccessManager {
    grant: Duration,
}

impl AlwaysOnAccessManager {
    pub fn new(grant: Duration) -> Self {
        Self { grant }
    }
}

impl Default for AlwaysOnAccessManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ChannelAccessManager for AlwaysOnAccessManager {
    fn request_access(&mut self, now: Duration) -> AccessResponse {
        trace!("Always-on grant of {:?} at {:?}", self.grant, now);
        AccessResponse::Granted(self.grant)
    }

    fn name(&self) -> &'static str {
        "always-on"
    }
}

/// Listen-before-talk style manager with a random backoff
pub struct BackoffAccessManager {
    rng: StdRng,
    /// Fixed deferral before counting backoff slots
    defer: Duration,
    slot_time: Duration,
    contention_window: u32,
    txop: Duration,
}

impl BackoffAccessManager {
    pub fn new(seed: u64, contention_window: u32, txop: Duration) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            defer: Duration::from_micros(16),
            slot_time: Duration::from_micros(9),
            contention_window,
            txop,
        }
    }
}

impl ChannelAccessManager for BackoffAccessManager {
    fn request_access(&mut self, now: Duration) -> AccessResponse {
        let slots = self.rng.gen_range(0..=self.contention_window);
        let after = self.defer + self.slot_time * slots;
        debug!(
            "Backoff of {} slots at {:?}, grant of {:?} in {:?}",
            slots, now, self.txop, after
        );
        AccessResponse::Deferred {
            after,
            grant: Some(self.txop),
        }
    }

    fn name(&self) -> &'static str {
        "backoff"
    }
}
