//! Batched, importance-weighted accuracy estimation.
//!
//! Enriched feedback is buffered until either the batch size is reached or
//! the flush timer fires. A flush scores every expert referenced in the
//! batch:
//!
//! ```text
//! weighted_accuracy = Σ w·correct / Σ w
//! smoothed          = lr · weighted_accuracy + (1 - lr) · previous
//! ```
//!
//! The first batch for an expert is taken as-is. Buffer, per-expert state
//! and last-batch breakdown share one lock, so a flush is observed either
//! entirely or not at all.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AggregatorConfig;
use crate::types::{EnrichedFeedback, ExpertId, WeightUpdateEvent};

/// Per-expert counts accumulated over one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPerformance {
    pub correct: f64,
    pub total: f64,
    pub weighted_correct: f64,
    pub weighted_total: f64,
}

impl BatchPerformance {
    /// Importance-weighted accuracy, `None` when nothing carried weight.
    pub fn weighted_accuracy(&self) -> Option<f64> {
        (self.weighted_total > 0.0).then(|| self.weighted_correct / self.weighted_total)
    }
}

/// Smoothed accuracy estimate for one expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertAccuracy {
    pub accuracy: f64,
    /// Records in the batch that last updated this expert
    pub total_samples: f64,
    /// Importance weight carried by those records
    pub weighted_samples: f64,
    pub last_update: DateTime<Utc>,
}

/// Snapshot persisted at `online_learning_stats` after each flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineLearningStats {
    pub timestamp: DateTime<Utc>,
    pub performance: BTreeMap<ExpertId, BatchPerformance>,
    pub expert_stats: BTreeMap<ExpertId, ExpertAccuracy>,
}

/// Diagnostics for the aggregator as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStatistics {
    pub expert_stats: BTreeMap<ExpertId, ExpertAccuracy>,
    pub pending_updates: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub batches_flushed: u64,
}

#[derive(Debug, Default)]
struct AggregatorState {
    pending: Vec<EnrichedFeedback>,
    expert_stats: BTreeMap<ExpertId, ExpertAccuracy>,
    last_batch: BTreeMap<ExpertId, BatchPerformance>,
    batches_flushed: u64,
}

/// Buffers enriched feedback and emits smoothed accuracies.
#[derive(Debug)]
pub struct OnlineAggregator {
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
}

impl OnlineAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    /// Buffer one record, flushing when the batch is full.
    ///
    /// Returns the weight update produced by that flush, if any.
    pub fn accept(&self, record: EnrichedFeedback) -> Option<WeightUpdateEvent> {
        let mut state = self.lock();
        debug!(
            alert_id = %record.feedback.alert_id,
            pending = state.pending.len() + 1,
            "Queued feedback for online learning"
        );
        state.pending.push(record);

        if state.pending.len() >= self.config.batch_size {
            self.flush_locked(&mut state)
        } else {
            None
        }
    }

    /// Process the whole buffer as one unit and clear it.
    ///
    /// An empty buffer, or a batch in which no expert carried weight,
    /// yields `None`.
    pub fn flush(&self) -> Option<WeightUpdateEvent> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut AggregatorState) -> Option<WeightUpdateEvent> {
        if state.pending.is_empty() {
            return None;
        }

        let batch = std::mem::take(&mut state.pending);
        let performance = summarize_batch(&batch, self.config.correct_threshold);
        let now = Utc::now();
        let lr = self.config.learning_rate;

        let mut event = WeightUpdateEvent::default();
        for (expert, perf) in &performance {
            let Some(batch_accuracy) = perf.weighted_accuracy() else {
                continue;
            };
            let smoothed = match state.expert_stats.get(expert) {
                Some(prior) => lr * batch_accuracy + (1.0 - lr) * prior.accuracy,
                None => batch_accuracy,
            };

            event.accuracies.insert(expert.clone(), smoothed);
            state.expert_stats.insert(
                expert.clone(),
                ExpertAccuracy {
                    accuracy: smoothed,
                    total_samples: perf.total,
                    weighted_samples: perf.weighted_total,
                    last_update: now,
                },
            );
        }

        state.last_batch = performance;
        state.batches_flushed += 1;

        info!(
            records = batch.len(),
            experts = event.accuracies.len(),
            "Flushed online learning batch"
        );

        (!event.is_empty()).then_some(event)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Smoothed accuracy for `expert`, if it has been scored.
    pub fn expert_accuracy(&self, expert: &str) -> Option<f64> {
        self.lock().expert_stats.get(expert).map(|s| s.accuracy)
    }

    pub fn statistics(&self) -> LearningStatistics {
        let state = self.lock();
        LearningStatistics {
            expert_stats: state.expert_stats.clone(),
            pending_updates: state.pending.len(),
            batch_size: self.config.batch_size,
            learning_rate: self.config.learning_rate,
            batches_flushed: state.batches_flushed,
        }
    }

    /// Snapshot of the last batch and current estimates.
    pub fn snapshot(&self) -> OnlineLearningStats {
        let state = self.lock();
        OnlineLearningStats {
            timestamp: Utc::now(),
            performance: state.last_batch.clone(),
            expert_stats: state.expert_stats.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-expert correctness counts for a batch.
///
/// An expert is correct when `score > threshold` agrees with the label.
pub fn summarize_batch(
    records: &[EnrichedFeedback],
    threshold: f64,
) -> BTreeMap<ExpertId, BatchPerformance> {
    let mut performance: BTreeMap<ExpertId, BatchPerformance> = BTreeMap::new();

    for record in records {
        let label = record.feedback.correct_label;
        let weight = record.importance_weight;

        for (expert, decision) in &record.decisions {
            let entry = performance.entry(expert.clone()).or_default();
            entry.total += 1.0;
            entry.weighted_total += weight;
            if decision.predicts_fraud(threshold) == label {
                entry.correct += 1.0;
                entry.weighted_correct += weight;
            }
        }
    }

    performance
}
