//! Interference Tracking
//!
//! Keeps every signal currently on air at a receiver, per resource block, so
//! that the end of a reception window can be turned into a SINR profile and
//! the channel can be sensed for energy above a threshold.

use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
struct ActiveSignal {
    /// Received power per RB in W
    psd: Vec<f64>,
    start: Duration,
    end: Duration,
}

/// Per-RB energy bookkeeping of one receiver
#[derive(Debug, Clone)]
pub struct InterferenceTracker {
    /// Noise power per RB in W
    noise: Vec<f64>,
    signals: Vec<ActiveSignal>,
    /// Wanted signal of the ongoing reception
    rx_signal: Vec<f64>,
    rx_start: Option<Duration>,
}

impl InterferenceTracker {
    pub fn new(noise: Vec<f64>) -> Self {
        let num_rbs = noise.len();
        Self {
            noise,
            signals: Vec::new(),
            rx_signal: vec![0.0; num_rbs],
            rx_start: None,
        }
    }

    pub fn num_rbs(&self) -> usize {
        self.noise.len()
    }

    pub fn is_receiving(&self) -> bool {
        self.rx_start.is_some()
    }

    /// Account for a signal arriving at `now`
    pub fn add_signal(&mut self, psd: &[f64], now: Duration, duration: Duration) {
        self.prune(now);
        let mut power = vec![0.0; self.num_rbs()];
        for (dst, src) in power.iter_mut().zip(psd) {
            *dst = *src;
        }
        trace!(
            "Adding signal of {:?} at {:?}, {} active",
            duration,
            now,
            self.signals.len() + 1
        );
        self.signals.push(ActiveSignal {
            psd: power,
            start: now,
            end: now.saturating_add(duration),
        });
    }

    /// Mark `psd` as wanted signal. The first call opens the window.
    pub fn start_rx(&mut self, psd: &[f64], now: Duration) {
        if self.rx_start.is_none() {
            self.rx_start = Some(now);
            self.rx_signal.iter_mut().for_each(|v| *v = 0.0);
        }
        for (dst, src) in self.rx_signal.iter_mut().zip(psd) {
            *dst += *src;
        }
    }

    /// Close the reception window and return the linear SINR per RB
    pub fn end_rx(&mut self, now: Duration) -> Vec<f64> {
        let start = self.rx_start.take().unwrap_or(now);
        let window = now.saturating_sub(start);

        let mut total = vec![0.0; self.num_rbs()];
        for signal in &self.signals {
            let weight = if window.is_zero() {
                if signal.start <= now && now < signal.end {
                    1.0
                } else {
                    0.0
                }
            } else {
                let overlap = signal
                    .end
                    .min(now)
                    .saturating_sub(signal.start.max(start));
                overlap.as_secs_f64() / window.as_secs_f64()
            };
            if weight > 0.0 {
                for (acc, p) in total.iter_mut().zip(&signal.psd) {
                    *acc += p * weight;
                }
            }
        }

        let sinr = self
            .rx_signal
            .iter()
            .zip(&total)
            .zip(&self.noise)
            .map(|((s, all), n)| {
                let interference = (all - s).max(0.0);
                s / (n + interference)
            })
            .collect();

        self.rx_signal.iter_mut().for_each(|v| *v = 0.0);
        self.prune(now);
        sinr
    }

    /// Time until the aggregate energy on air no longer exceeds `threshold_w`.
    ///
    /// Zero when the channel is already at or below the threshold.
    pub fn energy_duration(&mut self, now: Duration, threshold_w: f64) -> Duration {
        self.prune(now);

        let mut active: Vec<(Duration, f64)> = self
            .signals
            .iter()
            .filter(|s| s.start <= now && now < s.end)
            .map(|s| (s.end, s.psd.iter().sum::<f64>()))
            .collect();
        let mut power: f64 = active.iter().map(|(_, p)| p).sum();
        if power <= threshold_w {
            return Duration::ZERO;
        }

        active.sort_by_key(|(end, _)| *end);
        for (end, p) in active {
            power -= p;
            if power <= threshold_w {
                return end - now;
            }
        }
        Duration::ZERO
    }

    fn prune(&mut self, now: Duration) {
        let horizon = match self.rx_start {
            Some(start) => start.min(now),
            None => now,
        };
        self.signals.retain(|s| s.end >= horizon);
    }
}
