//! Weight manager: turns bandit scores into an ensemble distribution and
//! routes realized rewards back into the bandits.
//!
//! Two update paths reach an expert:
//!
//! - [`WeightManager::apply_feedback`] updates the bandit with an
//!   importance-weighted reward and logs the raw reward to the tracker.
//! - [`WeightManager::apply_weight_update`] records a batched accuracy
//!   estimate in the tracker only. It never touches bandit state, so
//!   [`WeightManager::select_weights`] is driven purely by the bandits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bandit::LinUcb;
use crate::config::EngineConfig;
use crate::context::{ContextVector, normalize};
use crate::tracker::{PerformanceSummary, PerformanceTracker};
use crate::types::{DecisionSet, ExpertId, WeightDistribution, WeightUpdateEvent};

/// Diagnostics for one expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertStatistics {
    pub recent_performance: f64,
    pub theta: Vec<f64>,
    pub confidence: f64,
    pub updates: u64,
    pub performance: PerformanceSummary,
}

/// Owner of every expert's bandit and the shared performance tracker.
#[derive(Debug)]
pub struct WeightManager {
    temperature: f64,
    bandits: BTreeMap<ExpertId, LinUcb>,
    tracker: PerformanceTracker,
}

impl WeightManager {
    /// Build a manager for a fixed expert set.
    pub fn new(experts: &[ExpertId], config: &EngineConfig) -> Self {
        let bandits = experts
            .iter()
            .map(|e| (e.clone(), LinUcb::new(&config.bandit)))
            .collect();
        Self {
            temperature: config.weights.temperature,
            bandits,
            tracker: PerformanceTracker::new(experts, &config.tracker),
        }
    }

    /// Probability distribution over experts for a raw context.
    ///
    /// The context is truncated or zero-padded to the bandit dimension.
    pub fn select_weights(&self, raw_context: &[f64]) -> WeightDistribution {
        self.select_weights_for(&normalize(raw_context))
    }

    /// Distribution for an already normalized context.
    pub fn select_weights_for(&self, context: &ContextVector) -> WeightDistribution {
        let scores: Vec<(&ExpertId, f64)> = self
            .bandits
            .iter()
            .map(|(expert, bandit)| (expert, bandit.score(context)))
            .collect();
        softmax(&scores, self.temperature)
    }

    /// Feed one labelled transaction back into the bandits.
    ///
    /// Experts missing from the known set are skipped. Returns the number
    /// of experts updated.
    pub fn apply_feedback(
        &self,
        raw_context: &[f64],
        decisions: &DecisionSet,
        true_label: bool,
        importance_weight: f64,
    ) -> usize {
        if !importance_weight.is_finite() {
            warn!(importance_weight, "Ignoring feedback with non-finite importance weight");
            return 0;
        }
        let importance_weight = importance_weight.clamp(0.0, 1.0);
        let context = normalize(raw_context);

        let mut updated = 0;
        for (expert, decision) in decisions {
            let Some(bandit) = self.bandits.get(expert) else {
                debug!(expert = %expert, "Ignoring feedback for unknown expert");
                continue;
            };

            let reward = reward_for(decision.score, true_label);
            if bandit.update(&context, reward * importance_weight) {
                updated += 1;
            }
            self.tracker.record(expert, reward);
        }
        updated
    }

    /// Record externally computed accuracies in the tracker.
    ///
    /// Returns the number of experts recorded.
    pub fn apply_weight_update(&self, event: &WeightUpdateEvent) -> usize {
        event
            .accuracies
            .iter()
            .filter(|(expert, accuracy)| self.tracker.record(expert, **accuracy))
            .count()
    }

    /// Per-expert diagnostics.
    pub fn statistics(&self) -> BTreeMap<ExpertId, ExpertStatistics> {
        self.bandits
            .iter()
            .map(|(expert, bandit)| {
                let snapshot = bandit.snapshot();
                let performance = self
                    .tracker
                    .summary(expert)
                    .unwrap_or_else(PerformanceSummary::empty);
                let stats = ExpertStatistics {
                    recent_performance: performance.recent_mean,
                    theta: snapshot.theta,
                    confidence: snapshot.confidence,
                    updates: snapshot.updates,
                    performance,
                };
                (expert.clone(), stats)
            })
            .collect()
    }

    /// Known experts in stable order.
    pub fn experts(&self) -> impl Iterator<Item = &ExpertId> {
        self.bandits.keys()
    }

    pub fn bandit(&self, expert: &str) -> Option<&LinUcb> {
        self.bandits.get(expert)
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }
}

/// Reward for an expert's score given the true label.
///
/// High when the score agrees with the label: the score itself for fraud,
/// its complement for a legitimate transaction.
pub fn reward_for(score: f64, true_label: bool) -> f64 {
    let score = if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.5
    };
    if true_label { score } else { 1.0 - score }
}

/// Temperature softmax with a uniform fallback for degenerate scores.
fn softmax(scores: &[(&ExpertId, f64)], temperature: f64) -> WeightDistribution {
    if scores.is_empty() {
        return WeightDistribution::default();
    }
    let uniform = || WeightDistribution::uniform(scores.iter().map(|(e, _)| *e));

    if scores.iter().any(|(_, s)| !s.is_finite()) {
        return uniform();
    }

    let max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores
        .iter()
        .map(|(_, s)| ((s - max) / temperature).exp())
        .collect();
    let total: f64 = exps.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return uniform();
    }

    WeightDistribution::from_map(
        scores
            .iter()
            .zip(exps)
            .map(|((expert, _), e)| ((*expert).clone(), e / total))
            .collect(),
    )
}
