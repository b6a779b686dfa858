//! Simulated analysts who label alerts after a random delay.

use arbiter_core::{Alert, Feedback};
use chrono::Duration;
use rand::prelude::*;
use rand::rngs::StdRng;

/// Longest label delay the simulation will draw (one year).
pub const MAX_DELAY_HOURS: f64 = 24.0 * 365.0;

/// Decides which alerts get labelled and when.
pub struct Analyst {
    rng: StdRng,
    feedback_rate: f64,
    max_delay_hours: f64,
}

impl Analyst {
    /// A non-finite delay bound means immediate labels. Finite bounds are
    /// capped at [`MAX_DELAY_HOURS`].
    pub fn new(seed: u64, feedback_rate: f64, max_delay_hours: f64) -> Self {
        let max_delay_hours = if max_delay_hours.is_finite() {
            max_delay_hours.clamp(0.0, MAX_DELAY_HOURS)
        } else {
            0.0
        };
        Self {
            rng: StdRng::seed_from_u64(seed),
            feedback_rate: feedback_rate.clamp(0.0, 1.0),
            max_delay_hours,
        }
    }

    /// Label `alert` with the true outcome, or skip it.
    ///
    /// The feedback timestamp is the transaction time plus a delay drawn
    /// uniformly from `[0, max_delay_hours]`.
    pub fn review(&mut self, alert: &Alert, is_fraud: bool) -> Option<Feedback> {
        if !self.rng.gen_bool(self.feedback_rate) {
            return None;
        }
        let delay_hours = if self.max_delay_hours > 0.0 {
            self.rng.gen_range(0.0..=self.max_delay_hours)
        } else {
            0.0
        };
        let delay = Duration::milliseconds((delay_hours * 3_600_000.0).round() as i64);

        Some(Feedback {
            alert_id: alert.alert_id.clone(),
            correct_label: is_fraud,
            analyst_notes: alert
                .ensemble_decision
                .needs_human_review
                .then(|| "reviewed from ambiguous band".to_string()),
            feedback_timestamp: alert.transaction.timestamp + delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{EnsembleDecision, Transaction, WeightDistribution};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn alert(review: bool) -> Alert {
        let transaction = Transaction {
            transaction_id: "txn_9".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            amount: 42.0,
            customer_id: "cust_1".into(),
            merchant_id: "merch_1".into(),
            location: "loc_1".into(),
            device_id: "device_1".into(),
            transaction_type: "purchase".into(),
            features: BTreeMap::new(),
        };
        Alert {
            alert_id: "txn_9".into(),
            ensemble_decision: EnsembleDecision {
                transaction_id: "txn_9".into(),
                final_score: 0.5,
                expert_decisions: BTreeMap::new(),
                weights: WeightDistribution::default(),
                primary_factors: vec![],
                needs_human_review: review,
            },
            transaction,
            processing_time_ms: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_review_labels_after_transaction() {
        let mut analyst = Analyst::new(5, 1.0, 48.0);
        let alert = alert(false);
        for _ in 0..50 {
            let feedback = analyst.review(&alert, true).unwrap();
            assert_eq!(feedback.alert_id, "txn_9");
            assert!(feedback.correct_label);
            let delay = feedback.feedback_timestamp - alert.transaction.timestamp;
            assert!(delay >= Duration::zero());
            assert!(delay <= Duration::hours(48));
        }
    }

    #[test]
    fn test_review_respects_feedback_rate() {
        let mut silent = Analyst::new(5, 0.0, 24.0);
        assert!(silent.review(&alert(false), false).is_none());
    }

    #[test]
    fn test_unbounded_delay_never_panics() {
        let alert = alert(false);
        for bound in [f64::INFINITY, f64::NAN, 1e300] {
            let mut analyst = Analyst::new(5, 1.0, bound);
            let feedback = analyst.review(&alert, true).unwrap();
            let delay = feedback.feedback_timestamp - alert.transaction.timestamp;
            assert!(delay <= Duration::hours(MAX_DELAY_HOURS as i64));
        }
    }

    #[test]
    fn test_zero_delay_labels_immediately() {
        let mut analyst = Analyst::new(5, 1.0, 0.0);
        let alert = alert(true);
        let feedback = analyst.review(&alert, false).unwrap();
        assert_eq!(feedback.feedback_timestamp, alert.transaction.timestamp);
        assert!(feedback.analyst_notes.is_some());
    }
}
