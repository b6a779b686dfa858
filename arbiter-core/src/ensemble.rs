//! Expert capability and ensemble combination.
//!
//! Experts are opaque scoring functions supplied at construction. The
//! engine asks each one for a decision, blends the scores under the weight
//! distribution chosen by the bandits, and ranks the factors the experts
//! cite.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EnsembleConfig;
use crate::types::{
    DecisionSet, EnsembleDecision, ExpertDecision, ExpertId, PrimaryFactor, Transaction,
    WeightDistribution,
};

/// A fraud-scoring model.
pub trait Expert: Send + Sync {
    /// Stable name used as the expert's key everywhere in the engine.
    fn name(&self) -> &str;

    /// Score one transaction.
    fn predict(&self, transaction: &Transaction) -> ExpertDecision;
}

/// Fixed, named set of experts.
#[derive(Clone, Default)]
pub struct ExpertSet {
    experts: BTreeMap<ExpertId, Arc<dyn Expert>>,
}

impl ExpertSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expert, replacing any previous one with the same name.
    #[must_use]
    pub fn with(mut self, expert: Arc<dyn Expert>) -> Self {
        self.experts.insert(expert.name().to_string(), expert);
        self
    }

    pub fn names(&self) -> Vec<ExpertId> {
        self.experts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    /// Run every expert on `transaction`.
    ///
    /// Decisions are keyed by the registered name and clamped into range.
    pub fn predict_all(&self, transaction: &Transaction) -> DecisionSet {
        self.experts
            .iter()
            .map(|(name, expert)| {
                let mut decision = expert.predict(transaction).sanitized();
                decision.expert_name = name.clone();
                (name.clone(), decision)
            })
            .collect()
    }
}

impl std::fmt::Debug for ExpertSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertSet")
            .field("experts", &self.experts.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Weighted mean of expert scores. Zero when no decision carries weight.
pub fn combine(decisions: &DecisionSet, weights: &WeightDistribution) -> f64 {
    let (weighted_sum, total_weight) =
        decisions
            .iter()
            .fold((0.0, 0.0), |(sum, total), (expert, decision)| {
                let w = weights.get(expert);
                (sum + decision.score * w, total + w)
            });

    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.0
    }
}

/// Factors cited across experts, ranked by summed absolute impact.
pub fn primary_factors(decisions: &DecisionSet, limit: usize) -> Vec<PrimaryFactor> {
    let mut factors: BTreeMap<&str, PrimaryFactor> = BTreeMap::new();

    for (expert, decision) in decisions {
        for factor in &decision.contributing_factors {
            let entry = factors
                .entry(factor.description.as_str())
                .or_insert_with(|| PrimaryFactor {
                    description: factor.description.clone(),
                    impact: 0.0,
                    experts: Vec::new(),
                });
            if factor.impact.is_finite() {
                entry.impact += factor.impact.abs();
            }
            entry.experts.push(expert.clone());
        }
    }

    let mut ranked: Vec<PrimaryFactor> = factors.into_values().collect();
    ranked.sort_by(|a, b| b.impact.total_cmp(&a.impact));
    ranked.truncate(limit);
    ranked
}

/// Whether a score falls inside the inclusive review band.
pub fn needs_human_review(score: f64, config: &EnsembleConfig) -> bool {
    (config.review_band_low..=config.review_band_high).contains(&score)
}

/// Assemble the full decision for a transaction.
pub fn decide(
    transaction_id: &str,
    decisions: DecisionSet,
    weights: WeightDistribution,
    config: &EnsembleConfig,
) -> EnsembleDecision {
    let final_score = combine(&decisions, &weights);
    EnsembleDecision {
        transaction_id: transaction_id.to_string(),
        final_score,
        primary_factors: primary_factors(&decisions, config.primary_factor_count),
        needs_human_review: needs_human_review(final_score, config),
        expert_decisions: decisions,
        weights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContributingFactor;

    struct Fixed {
        name: &'static str,
        score: f64,
        factors: Vec<(&'static str, f64)>,
    }

    impl Expert for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn predict(&self, _transaction: &Transaction) -> ExpertDecision {
            ExpertDecision {
                expert_name: "ignored".into(),
                score: self.score,
                confidence: 0.9,
                contributing_factors: self
                    .factors
                    .iter()
                    .map(|(d, i)| ContributingFactor {
                        description: (*d).into(),
                        impact: *i,
                        features_involved: vec![],
                    })
                    .collect(),
                model_type: "fixed".into(),
            }
        }
    }

    fn transaction() -> Transaction {
        Transaction {
            transaction_id: "txn_1".into(),
            timestamp: chrono::Utc::now(),
            amount: 10.0,
            customer_id: "c".into(),
            merchant_id: "m".into(),
            location: "l".into(),
            device_id: "d".into(),
            transaction_type: "purchase".into(),
            features: BTreeMap::new(),
        }
    }

    fn experts() -> ExpertSet {
        ExpertSet::new()
            .with(Arc::new(Fixed {
                name: "rules",
                score: 0.9,
                factors: vec![("High amount", 0.7), ("New location", 0.5)],
            }))
            .with(Arc::new(Fixed {
                name: "gbm",
                score: 0.1,
                factors: vec![("High amount", -0.4), ("Night time", 0.2)],
            }))
            .with(Arc::new(Fixed {
                name: "forest",
                score: 1.8,
                factors: vec![("Device change", 0.05)],
            }))
    }

    #[test]
    fn test_predict_all_keys_by_registered_name() {
        let decisions = experts().predict_all(&transaction());
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions["rules"].expert_name, "rules");
        assert_eq!(decisions["forest"].score, 1.0);
    }

    #[test]
    fn test_combine_is_weighted_mean() {
        let set = experts();
        let decisions = set.predict_all(&transaction());
        let names = set.names();
        let uniform = WeightDistribution::uniform(&names);
        let score = combine(&decisions, &uniform);
        assert!((score - (0.9 + 0.1 + 1.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_combine_without_weight_is_zero() {
        let decisions = experts().predict_all(&transaction());
        assert_eq!(combine(&decisions, &WeightDistribution::default()), 0.0);
    }

    #[test]
    fn test_primary_factors_rank_by_summed_impact() {
        let decisions = experts().predict_all(&transaction());
        let factors = primary_factors(&decisions, 3);
        assert_eq!(factors.len(), 3);
        assert_eq!(factors[0].description, "High amount");
        assert!((factors[0].impact - 1.1).abs() < 1e-12);
        assert_eq!(factors[0].experts, vec!["gbm".to_string(), "rules".to_string()]);
        assert_eq!(factors[1].description, "New location");
        assert_eq!(factors[2].description, "Night time");
    }

    #[test]
    fn test_review_band_is_inclusive() {
        let config = EnsembleConfig::default();
        assert!(needs_human_review(0.3, &config));
        assert!(needs_human_review(0.7, &config));
        assert!(!needs_human_review(0.71, &config));
        assert!(!needs_human_review(0.1, &config));
    }

    #[test]
    fn test_decide_assembles_decision() {
        let set = experts();
        let names = set.names();
        let decision = decide(
            "txn_1",
            set.predict_all(&transaction()),
            WeightDistribution::uniform(&names),
            &EnsembleConfig::default(),
        );
        assert_eq!(decision.transaction_id, "txn_1");
        assert!(decision.needs_human_review);
        assert_eq!(decision.primary_factors.len(), 3);
    }
}
