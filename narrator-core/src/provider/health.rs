//! Rolling per-provider health.

use crate::config::HealthConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    latency: Duration,
}

/// Mutable health state of one provider. Lives behind the manager's lock.
#[derive(Debug)]
pub(crate) struct HealthState {
    window: VecDeque<Sample>,
    successes: u64,
    failures: u64,
    deprioritized: bool,
    last_error: Option<String>,
    /// Last automatic probe, or the demotion itself.
    last_probe: Option<Instant>,
}

/// What a record call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    None,
    Deprioritized,
}

impl HealthState {
    pub(crate) fn new() -> Self {
        Self {
            window: VecDeque::new(),
            successes: 0,
            failures: 0,
            deprioritized: false,
            last_error: None,
            last_probe: None,
        }
    }

    pub(crate) fn record(
        &mut self,
        config: &HealthConfig,
        ok: bool,
        latency: Duration,
        error: Option<String>,
    ) -> Transition {
        if ok {
            self.successes += 1;
        } else {
            self.failures += 1;
            self.last_error = error;
        }

        self.window.push_back(Sample { ok, latency });
        while self.window.len() > config.window {
            self.window.pop_front();
        }

        if !self.deprioritized
            && self.window.len() >= config.min_samples
            && self.success_rate() < config.min_success_rate
        {
            self.deprioritized = true;
            self.last_probe = Some(Instant::now());
            return Transition::Deprioritized;
        }
        Transition::None
    }

    /// A successful probe restores the provider with a clean window.
    /// Returns whether it had been deprioritized.
    pub(crate) fn restore(&mut self) -> bool {
        let was = self.deprioritized;
        self.deprioritized = false;
        self.window.clear();
        was
    }

    pub(crate) fn is_deprioritized(&self) -> bool {
        self.deprioritized
    }

    /// Claim the next automatic probe if one is due.
    pub(crate) fn claim_probe(&mut self, interval: Duration) -> bool {
        if !self.deprioritized {
            return false;
        }
        if self.last_probe.is_some_and(|at| at.elapsed() < interval) {
            return false;
        }
        self.last_probe = Some(Instant::now());
        true
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|s| s.ok).count();
        ok as f64 / self.window.len() as f64
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().map(|s| s.latency).sum();
        Some(total / self.window.len() as u32)
    }

    pub(crate) fn snapshot(&self, name: &str) -> HealthSnapshot {
        HealthSnapshot {
            name: name.to_string(),
            successes: self.successes,
            failures: self.failures,
            success_rate: self.success_rate(),
            average_latency: self.average_latency(),
            samples: self.window.len(),
            deprioritized: self.deprioritized,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time health of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub name: String,
    /// Lifetime successful attempts.
    pub successes: u64,
    /// Lifetime failed attempts.
    pub failures: u64,
    /// Success rate over the rolling window (1.0 when empty).
    pub success_rate: f64,
    pub average_latency: Option<Duration>,
    pub samples: usize,
    pub deprioritized: bool,
    pub last_error: Option<String>,
}
