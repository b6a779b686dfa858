//! Joins incoming labels with the decisions they judge.
//!
//! For each feedback the correlator loads the scored transaction and the
//! per-expert decisions from the store, derives the label delay and its
//! importance weight, and hands back an [`EnrichedFeedback`]. Records that
//! have aged out of the store are dropped: the evidence cannot be rebuilt.
//!
//! Duplicate deliveries are detected with an idempotency marker claimed via
//! [`KeyValueStore::put_if_absent`] once both lookups succeed, so a
//! redelivered label never reaches the bandits twice.

use std::sync::Arc;

use arbiter_bus::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::CorrelatorConfig;
use crate::delay::DelayEstimator;
use crate::keys;
use crate::types::{DecisionSet, EnrichedFeedback, Feedback, Payload, Transaction};

/// Result of correlating one feedback.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationOutcome {
    /// Feedback joined with its transaction and decisions.
    Enriched(Box<EnrichedFeedback>),
    /// The transaction record is gone or was never stored.
    MissingTransaction,
    /// The decision record is gone or was never stored.
    MissingDecisions,
    /// This alert was already learned from.
    Duplicate,
}

impl CorrelationOutcome {
    pub fn enriched(self) -> Option<EnrichedFeedback> {
        match self {
            Self::Enriched(record) => Some(*record),
            _ => None,
        }
    }
}

/// Record persisted at `feedback_metadata:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMetadata {
    pub feedback: Feedback,
    pub original_decisions: DecisionSet,
    pub importance_weight: f64,
    pub delay_hours: f64,
    pub transaction_timestamp: DateTime<Utc>,
    pub processed_timestamp: DateTime<Utc>,
}

/// Store-backed feedback correlator.
pub struct FeedbackCorrelator {
    store: Arc<dyn KeyValueStore>,
    delay: DelayEstimator,
    config: CorrelatorConfig,
}

impl FeedbackCorrelator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        delay: DelayEstimator,
        config: CorrelatorConfig,
    ) -> Self {
        Self {
            store,
            delay,
            config,
        }
    }

    /// Correlate one feedback against the stored decision.
    ///
    /// Store and decode failures are returned as errors. A missing record
    /// or a duplicate is a normal outcome, not an error.
    pub async fn process(&self, feedback: &Feedback) -> Result<CorrelationOutcome> {
        let alert_id = feedback.alert_id.as_str();

        let Some(raw_transaction) = self.store.get(&keys::transaction(alert_id)).await? else {
            warn!(alert_id = %alert_id, "No transaction found for feedback, dropping");
            return Ok(CorrelationOutcome::MissingTransaction);
        };
        let transaction = Transaction::decode(&raw_transaction)?;

        let Some(raw_decisions) = self.store.get(&keys::decisions(alert_id)).await? else {
            warn!(alert_id = %alert_id, "No original decisions found for feedback, dropping");
            return Ok(CorrelationOutcome::MissingDecisions);
        };
        let decisions: DecisionSet = serde_json::from_str::<DecisionSet>(&raw_decisions)?
            .into_iter()
            .map(|(expert, decision)| (expert, decision.sanitized()))
            .collect();

        let processed_at = Utc::now();

        if self.config.deduplicate {
            let claimed = self
                .store
                .put_if_absent(
                    &keys::feedback_processed(alert_id),
                    processed_at.to_rfc3339(),
                    self.config.record_ttl,
                )
                .await?;
            if !claimed {
                info!(alert_id = %alert_id, "Feedback already processed, skipping duplicate");
                return Ok(CorrelationOutcome::Duplicate);
            }
        }

        let delay_hours = delay_hours(transaction.timestamp, feedback.feedback_timestamp);
        let importance_weight = self.delay.importance_weight(delay_hours);

        let metadata = FeedbackMetadata {
            feedback: feedback.clone(),
            original_decisions: decisions.clone(),
            importance_weight,
            delay_hours,
            transaction_timestamp: transaction.timestamp,
            processed_timestamp: processed_at,
        };
        if let Err(e) = self.persist_metadata(alert_id, &metadata).await {
            warn!(alert_id = %alert_id, error = %e, "Failed to persist feedback metadata");
        }

        self.delay.record_delay(delay_hours);

        info!(
            alert_id = %alert_id,
            delay_hours,
            importance_weight,
            "Correlated delayed feedback"
        );

        Ok(CorrelationOutcome::Enriched(Box::new(EnrichedFeedback {
            feedback: feedback.clone(),
            transaction,
            decisions,
            delay_hours,
            importance_weight,
            processed_at,
        })))
    }

    async fn persist_metadata(&self, alert_id: &str, metadata: &FeedbackMetadata) -> Result<()> {
        let value = serde_json::to_string(metadata)?;
        self.store
            .put(&keys::feedback_metadata(alert_id), value, self.config.record_ttl)
            .await?;
        debug!(alert_id = %alert_id, "Persisted feedback metadata");
        Ok(())
    }

    pub fn delay(&self) -> &DelayEstimator {
        &self.delay
    }
}

/// Hours from `transaction` to `label`, clamped at zero.
pub fn delay_hours(transaction: DateTime<Utc>, label: DateTime<Utc>) -> f64 {
    let millis = (label - transaction).num_milliseconds();
    (millis as f64 / 3_600_000.0).max(0.0)
}
