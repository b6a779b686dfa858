//! Demonstration experts for the simulated stream.
//!
//! Each is deliberately simple: a fixed rule set, a stepwise amount model
//! and a distance-based anomaly detector. They disagree often enough for
//! the bandits to have something to learn.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use arbiter_core::{ContributingFactor, Expert, ExpertDecision, Transaction, stable_hash};

/// Deterministic rules, each adding its weight when it fires.
pub struct RuleExpert {
    rules: Vec<Rule>,
}

struct Rule {
    weight: f64,
    description: &'static str,
    fires: fn(&Transaction) -> bool,
}

impl RuleExpert {
    pub const NAME: &'static str = "rule_engine";

    pub fn new() -> Self {
        Self {
            rules: vec![
                Rule {
                    weight: 0.7,
                    description: "Transaction amount exceeds $1000",
                    fires: |t| t.amount > 1000.0,
                },
                Rule {
                    weight: 0.5,
                    description: "Transaction from new geographic location",
                    fires: |t| stable_hash(&t.location) % 10 == 0,
                },
                Rule {
                    weight: 0.6,
                    description: "Unusual transaction frequency",
                    fires: |t| {
                        let key = format!("{}{}", t.customer_id, t.timestamp.to_rfc3339());
                        stable_hash(&key) % 5 == 0
                    },
                },
            ],
        }
    }
}

impl Default for RuleExpert {
    fn default() -> Self {
        Self::new()
    }
}

impl Expert for RuleExpert {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn predict(&self, transaction: &Transaction) -> ExpertDecision {
        let fired: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|rule| (rule.fires)(transaction))
            .collect();

        let score = fired.iter().map(|rule| rule.weight).sum::<f64>().min(1.0);
        let contributing_factors = fired
            .iter()
            .map(|rule| ContributingFactor {
                description: rule.description.to_string(),
                impact: rule.weight,
                features_involved: vec!["rule_based".to_string()],
            })
            .collect();

        ExpertDecision {
            expert_name: Self::NAME.to_string(),
            score,
            confidence: 1.0,
            contributing_factors,
            model_type: "rule_based".to_string(),
        }
    }
}

/// Stepwise amount model with feature-outlier explanations.
pub struct AmountExpert;

impl AmountExpert {
    pub const NAME: &'static str = "amount_model";
    const MAX_FACTORS: usize = 3;
    const OUTLIER_THRESHOLD: f64 = 2.0;
}

impl Expert for AmountExpert {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn predict(&self, transaction: &Transaction) -> ExpertDecision {
        let score = if transaction.amount > 1000.0 {
            0.8
        } else if transaction.amount > 500.0 {
            0.4
        } else {
            0.1
        };

        let mut factors = Vec::new();
        if transaction.amount > 1000.0 {
            factors.push(ContributingFactor {
                description: format!("High transaction amount: ${:.2}", transaction.amount),
                impact: 0.6,
                features_involved: vec!["amount".to_string()],
            });
        }
        factors.extend(
            transaction
                .features
                .iter()
                .filter(|(_, value)| value.abs() > Self::OUTLIER_THRESHOLD)
                .map(|(name, value)| ContributingFactor {
                    description: format!("Feature {name} anomaly: {value:.2}"),
                    impact: 0.3,
                    features_involved: vec![name.clone()],
                }),
        );
        factors.truncate(Self::MAX_FACTORS);

        ExpertDecision {
            expert_name: Self::NAME.to_string(),
            score,
            confidence: 0.8,
            contributing_factors: factors,
            model_type: "static".to_string(),
        }
    }
}

/// Scores a transaction by its distance from recently seen ones.
///
/// Keeps a sliding reference window of feature vectors. Until the window
/// holds `WARMUP` points every transaction scores 0.1.
pub struct AnomalyExpert {
    window: Mutex<VecDeque<Vec<f64>>>,
    capacity: usize,
}

impl AnomalyExpert {
    pub const NAME: &'static str = "anomaly_detector";
    const WARMUP: usize = 10;
    const COMPARE_RECENT: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn features(transaction: &Transaction) -> Vec<f64> {
        let mut values: Vec<f64> = transaction.features.values().copied().collect();
        values.push(transaction.amount / 1000.0);
        values.push(transaction.customer_id.len() as f64 / 100.0);
        values.push((stable_hash(&transaction.merchant_id) % 100) as f64 / 100.0);
        values
    }

    fn distance(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn score(window: &VecDeque<Vec<f64>>, point: &[f64]) -> f64 {
        if window.len() < Self::WARMUP {
            return 0.1;
        }
        let distances: Vec<f64> = window
            .iter()
            .rev()
            .take(Self::COMPARE_RECENT)
            .map(|reference| Self::distance(point, reference))
            .collect();
        let mean = distances.iter().sum::<f64>() / distances.len() as f64;
        let max = distances.iter().copied().fold(0.0_f64, f64::max);
        if max > 0.0 { (mean / max).min(1.0) } else { 0.0 }
    }
}

impl Default for AnomalyExpert {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Expert for AnomalyExpert {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn predict(&self, transaction: &Transaction) -> ExpertDecision {
        let point = Self::features(transaction);
        let score = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(point.clone());
            Self::score(&window, &point)
        };

        ExpertDecision {
            expert_name: Self::NAME.to_string(),
            score,
            confidence: (score * 2.0).min(1.0),
            contributing_factors: vec![ContributingFactor {
                description: "Distance from recent transactions".to_string(),
                impact: score,
                features_involved: vec!["composite_anomaly".to_string()],
            }],
            model_type: "streaming_anomaly".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn tx(amount: f64, features: &[(&str, f64)]) -> Transaction {
        Transaction {
            transaction_id: "txn_1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            amount,
            customer_id: "cust_1".into(),
            merchant_id: "merch_1".into(),
            location: "loc_1".into(),
            device_id: "device_1".into(),
            transaction_type: "purchase".into(),
            features: features
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_rule_expert_high_amount_fires() {
        let expert = RuleExpert::new();
        let decision = expert.predict(&tx(1500.0, &[]));
        assert!(decision.score >= 0.7);
        assert!(decision.score <= 1.0);
        assert_eq!(decision.confidence, 1.0);
        assert!(
            decision
                .contributing_factors
                .iter()
                .any(|f| f.description == "Transaction amount exceeds $1000")
        );
    }

    #[test]
    fn test_rule_expert_score_matches_fired_weights() {
        let expert = RuleExpert::new();
        let decision = expert.predict(&tx(10.0, &[]));
        let total: f64 = decision.contributing_factors.iter().map(|f| f.impact).sum();
        assert!((decision.score - total.min(1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_amount_expert_steps() {
        let expert = AmountExpert;
        assert_eq!(expert.predict(&tx(2000.0, &[])).score, 0.8);
        assert_eq!(expert.predict(&tx(700.0, &[])).score, 0.4);
        assert_eq!(expert.predict(&tx(20.0, &[])).score, 0.1);
    }

    #[test]
    fn test_amount_expert_caps_factors() {
        let expert = AmountExpert;
        let decision = expert.predict(&tx(
            5000.0,
            &[("V1", 3.0), ("V2", -4.0), ("V3", 2.5), ("V4", 0.1)],
        ));
        assert_eq!(decision.contributing_factors.len(), 3);
        assert_eq!(decision.contributing_factors[0].features_involved, vec!["amount"]);
    }

    #[test]
    fn test_anomaly_expert_warms_up() {
        let expert = AnomalyExpert::new(50);
        for _ in 0..(AnomalyExpert::WARMUP - 1) {
            assert_eq!(expert.predict(&tx(10.0, &[("V1", 0.0)])).score, 0.1);
        }
        let outlier = expert.predict(&tx(9000.0, &[("V1", 8.0)]));
        assert!(outlier.score > 0.0);
        assert!(outlier.score <= 1.0);
    }

    #[test]
    fn test_anomaly_expert_identical_points_score_zero() {
        let expert = AnomalyExpert::new(50);
        let mut last = 0.1;
        for _ in 0..20 {
            last = expert.predict(&tx(10.0, &[("V1", 0.5)])).score;
        }
        assert_eq!(last, 0.0);
    }
}
