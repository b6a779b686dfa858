//! Bounded rolling reward history per expert.
//!
//! Two writers feed the tracker: the per-transaction bandit reward path and
//! the batched accuracy path. Each expert's history sits behind its own
//! mutex so the two paths only contend when they touch the same expert.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::types::ExpertId;

/// Value reported for an expert with no history yet.
pub const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Rolling statistics for one expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub count: usize,
    /// Mean over the trailing window
    pub recent_mean: f64,
}

impl PerformanceSummary {
    /// Summary of an expert with no history.
    pub fn empty() -> Self {
        Self {
            mean: NEUTRAL_PERFORMANCE,
            std_dev: 0.0,
            count: 0,
            recent_mean: NEUTRAL_PERFORMANCE,
        }
    }
}

/// Fixed set of per-expert FIFO histories.
#[derive(Debug)]
pub struct PerformanceTracker {
    capacity: usize,
    recent_window: usize,
    histories: BTreeMap<ExpertId, Mutex<VecDeque<f64>>>,
}

impl PerformanceTracker {
    pub fn new<'a>(experts: impl IntoIterator<Item = &'a ExpertId>, config: &TrackerConfig) -> Self {
        let capacity = config.capacity.max(1);
        let histories = experts
            .into_iter()
            .map(|e| (e.clone(), Mutex::new(VecDeque::with_capacity(capacity))))
            .collect();
        Self {
            capacity,
            recent_window: config.recent_window.max(1),
            histories,
        }
    }

    /// Append a value, evicting the oldest entry when full.
    ///
    /// Returns `false` for an expert outside the tracked set.
    pub fn record(&self, expert: &str, value: f64) -> bool {
        let Some(history) = self.histories.get(expert) else {
            return false;
        };
        if !value.is_finite() {
            return false;
        }

        let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(value);
        true
    }

    /// Mean of the trailing window, or the neutral prior when empty.
    pub fn recent_performance(&self, expert: &str) -> f64 {
        self.summary(expert)
            .map_or(NEUTRAL_PERFORMANCE, |s| s.recent_mean)
    }

    /// Rolling statistics for one expert, `None` if it is not tracked.
    pub fn summary(&self, expert: &str) -> Option<PerformanceSummary> {
        let history = self.histories.get(expert)?;
        let history = history.lock().unwrap_or_else(PoisonError::into_inner);
        Some(summarize(&history, self.recent_window))
    }

    /// Statistics for every tracked expert.
    pub fn summaries(&self) -> BTreeMap<ExpertId, PerformanceSummary> {
        self.histories
            .iter()
            .map(|(expert, history)| {
                let history = history.lock().unwrap_or_else(PoisonError::into_inner);
                (expert.clone(), summarize(&history, self.recent_window))
            })
            .collect()
    }

    /// Number of stored values for `expert`.
    pub fn len(&self, expert: &str) -> usize {
        self.histories.get(expert).map_or(0, |h| {
            h.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn summarize(history: &VecDeque<f64>, recent_window: usize) -> PerformanceSummary {
    if history.is_empty() {
        return PerformanceSummary::empty();
    }

    let count = history.len();
    let mean = history.iter().sum::<f64>() / count as f64;
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    let window = recent_window.min(count);
    let recent_mean = history.iter().skip(count - window).sum::<f64>() / window as f64;

    PerformanceSummary {
        mean,
        std_dev: variance.sqrt(),
        count,
        recent_mean,
    }
}
