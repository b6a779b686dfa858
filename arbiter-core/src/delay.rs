//! Importance weighting of delayed labels.
//!
//! A label that arrives long after its transaction describes a population
//! that may have shifted since, so its influence decays exponentially with
//! the delay:
//!
//! ```text
//! weight = max(floor, e^(-λ · hours))
//! ```
//!
//! The floor keeps old labels from being discarded outright. The estimator
//! also keeps a bounded history of observed delays for diagnostics.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::DelayConfig;

/// One non-empty bin of the delay histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayBucket {
    /// Bin range in hours, e.g. `"0.0-4.8h"`
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Aggregate view of observed delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayStatistics {
    pub mean_delay: f64,
    pub total_feedbacks: usize,
    pub delay_histogram: Vec<DelayBucket>,
}

/// Delay-to-weight mapping plus rolling delay history.
#[derive(Debug)]
pub struct DelayEstimator {
    config: DelayConfig,
    delays: Mutex<VecDeque<f64>>,
}

impl DelayEstimator {
    pub fn new(config: DelayConfig) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            config: DelayConfig {
                history_capacity: capacity,
                ..config
            },
            delays: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Weight in `[floor, 1]` for a label `delay_hours` late.
    ///
    /// Negative or non-finite delays are treated as zero delay.
    pub fn importance_weight(&self, delay_hours: f64) -> f64 {
        let delay = sanitize_delay(delay_hours);
        (-self.config.decay_rate * delay)
            .exp()
            .max(self.config.min_weight)
    }

    /// Append a delay observation, dropping the oldest beyond capacity.
    pub fn record_delay(&self, delay_hours: f64) {
        let delay = sanitize_delay(delay_hours);
        let mut delays = self.delays.lock().unwrap_or_else(PoisonError::into_inner);
        if delays.len() >= self.config.history_capacity {
            delays.pop_front();
        }
        delays.push_back(delay);
    }

    /// Mean observed delay in hours, 0 when nothing was recorded.
    pub fn mean_delay(&self) -> f64 {
        let delays = self.delays.lock().unwrap_or_else(PoisonError::into_inner);
        if delays.is_empty() {
            return 0.0;
        }
        delays.iter().sum::<f64>() / delays.len() as f64
    }

    pub fn len(&self) -> usize {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Equal-width histogram from 0 to the largest observed delay.
    ///
    /// Only non-empty bins are returned, in ascending order. The last bin
    /// is closed so the maximum lands in it.
    pub fn histogram(&self, bins: usize) -> Vec<DelayBucket> {
        let bins = bins.max(1);
        let delays = self.delays.lock().unwrap_or_else(PoisonError::into_inner);
        if delays.is_empty() {
            return Vec::new();
        }

        let max_delay = delays.iter().copied().fold(0.0, f64::max);
        let width = if max_delay > 0.0 {
            max_delay / bins as f64
        } else {
            1.0
        };

        let mut counts = vec![0usize; bins];
        for delay in delays.iter() {
            let idx = ((delay / width) as usize).min(bins - 1);
            counts[idx] += 1;
        }
        drop(delays);

        counts
            .into_iter()
            .enumerate()
            .filter(|(_, count)| *count > 0)
            .map(|(idx, count)| {
                let lower = idx as f64 * width;
                let upper = (idx + 1) as f64 * width;
                DelayBucket {
                    label: format!("{lower:.1}-{upper:.1}h"),
                    lower,
                    upper,
                    count,
                }
            })
            .collect()
    }

    pub fn statistics(&self) -> DelayStatistics {
        DelayStatistics {
            mean_delay: self.mean_delay(),
            total_feedbacks: self.len(),
            delay_histogram: self.histogram(self.config.histogram_bins),
        }
    }
}

fn sanitize_delay(delay_hours: f64) -> f64 {
    if delay_hours.is_finite() {
        delay_hours.max(0.0)
    } else {
        0.0
    }
}
