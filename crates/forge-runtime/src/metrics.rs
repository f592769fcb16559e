// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide orchestrator metrics and the cost model.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Informational cost model: fixed USD/token rates with an assumed
/// output fraction. Purely advisory, never enforced.
const INPUT_COST_PER_TOKEN: f64 = 3.0e-6;
const OUTPUT_COST_PER_TOKEN: f64 = 15.0e-6;
const ASSUMED_OUTPUT_FRACTION: f64 = 0.25;

/// Estimate the USD cost of a token count.
#[must_use]
pub fn estimate_cost_usd(tokens: u64) -> f64 {
    let tokens = tokens as f64;
    tokens * (1.0 - ASSUMED_OUTPUT_FRACTION) * INPUT_COST_PER_TOKEN
        + tokens * ASSUMED_OUTPUT_FRACTION * OUTPUT_COST_PER_TOKEN
}

/// Atomic task-level metrics shared across the orchestrator.
pub struct RunMetrics {
    total_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    total_tokens: AtomicU64,
    cumulative_duration_ms: AtomicU64,
}

impl RunMetrics {
    /// Create a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            cumulative_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record one finished task.
    pub fn record_task(&self, duration_ms: u64, tokens: u64, success: bool) {
        self.total_tasks.fetch_add(1, Relaxed);
        if success {
            self.completed_tasks.fetch_add(1, Relaxed);
        } else {
            self.failed_tasks.fetch_add(1, Relaxed);
        }
        self.total_tokens.fetch_add(tokens, Relaxed);
        self.cumulative_duration_ms.fetch_add(duration_ms, Relaxed);
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_tasks.load(Relaxed);
        let cumulative = self.cumulative_duration_ms.load(Relaxed);
        MetricsSnapshot {
            total_tasks: total,
            completed_tasks: self.completed_tasks.load(Relaxed),
            failed_tasks: self.failed_tasks.load(Relaxed),
            total_tokens: self.total_tokens.load(Relaxed),
            average_duration_ms: if total == 0 { 0 } else { cumulative / total },
        }
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialisable snapshot of [`RunMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Tasks started.
    pub total_tasks: u64,
    /// Tasks that produced a signed bundle.
    pub completed_tasks: u64,
    /// Tasks that failed.
    pub failed_tasks: u64,
    /// Tokens consumed across all tasks.
    pub total_tokens: u64,
    /// Running average task duration in milliseconds.
    pub average_duration_ms: u64,
}
