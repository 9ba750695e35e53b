//! Metrics sink interface.
//!
//! The engine reports what happened; where it goes (Prometheus, logs,
//! nowhere) is up to the implementation.

use crate::consistency::Severity;
use crate::id::SessionId;
use crate::turn::TurnStatus;
use parking_lot::Mutex;
use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    /// A turn reached a terminal status.
    fn turn_finished(&self, session: SessionId, status: TurnStatus, latency: Duration);

    /// One provider attempt finished.
    fn provider_call(&self, provider: &str, success: bool, latency: Duration);

    /// A consistency check found `count` issues of `severity`.
    fn consistency_violations(&self, session: SessionId, severity: Severity, count: usize);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn turn_finished(&self, _: SessionId, _: TurnStatus, _: Duration) {}
    fn provider_call(&self, _: &str, _: bool, _: Duration) {}
    fn consistency_violations(&self, _: SessionId, _: Severity, _: usize) {}
}

/// One recorded metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    TurnFinished {
        session: SessionId,
        status: TurnStatus,
        latency: Duration,
    },
    ProviderCall {
        provider: String,
        success: bool,
        latency: Duration,
    },
    ConsistencyViolations {
        session: SessionId,
        severity: Severity,
        count: usize,
    },
}

/// Keeps every event in memory; used by tests and the dev examples.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    pub fn turn_statuses(&self) -> Vec<TurnStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MetricEvent::TurnFinished { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// (successes, failures) recorded for a provider.
    pub fn provider_counts(&self, provider: &str) -> (usize, usize) {
        self.events
            .lock()
            .iter()
            .fold((0, 0), |(ok, failed), e| match e {
                MetricEvent::ProviderCall {
                    provider: p,
                    success,
                    ..
                } if p == provider => {
                    if *success {
                        (ok + 1, failed)
                    } else {
                        (ok, failed + 1)
                    }
                }
                _ => (ok, failed),
            })
    }

    pub fn violation_count(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .iter()
            .map(|e| match e {
                MetricEvent::ConsistencyViolations {
                    severity: s, count, ..
                } if *s == severity => *count,
                _ => 0,
            })
            .sum()
    }
}

impl MetricsSink for RecordingMetrics {
    fn turn_finished(&self, session: SessionId, status: TurnStatus, latency: Duration) {
        self.events.lock().push(MetricEvent::TurnFinished {
            session,
            status,
            latency,
        });
    }

    fn provider_call(&self, provider: &str, success: bool, latency: Duration) {
        self.events.lock().push(MetricEvent::ProviderCall {
            provider: provider.to_string(),
            success,
            latency,
        });
    }

    fn consistency_violations(&self, session: SessionId, severity: Severity, count: usize) {
        self.events.lock().push(MetricEvent::ConsistencyViolations {
            session,
            severity,
            count,
        });
    }
}
