//! Wire and record types shared across the engine.
//!
//! Everything that crosses the bus or the key-value store is one of these
//! types, encoded as JSON. Payloads are validated at the decode boundary
//! through [`Payload::decode`] so the learning path never sees a
//! half-formed record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Stable string key naming an expert.
pub type ExpertId = String;

/// Per-expert decisions produced for one transaction.
pub type DecisionSet = BTreeMap<ExpertId, ExpertDecision>;

/// JSON payload with validation at the decode boundary.
pub trait Payload: Serialize + DeserializeOwned {
    /// Check invariants serde cannot express.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Decode and validate a JSON payload.
    fn decode(raw: &str) -> Result<Self> {
        let value: Self = serde_json::from_str(raw)?;
        value.validate()?;
        Ok(value)
    }

    /// Encode as a JSON string.
    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A card transaction as ingested upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub customer_id: String,
    pub merchant_id: String,
    pub location: String,
    pub device_id: String,
    pub transaction_type: String,
    /// Engineered numeric features, keyed by name
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

impl Payload for Transaction {
    fn validate(&self) -> Result<()> {
        if self.transaction_id.trim().is_empty() {
            return Err(CoreError::InvalidPayload("empty transaction_id".into()));
        }
        if !self.amount.is_finite() {
            return Err(CoreError::InvalidPayload(format!(
                "non-finite amount for {}",
                self.transaction_id
            )));
        }
        Ok(())
    }
}

/// One factor an expert cites for its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub description: String,
    pub impact: f64,
    #[serde(default)]
    pub features_involved: Vec<String>,
}

/// Output of a single expert for a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertDecision {
    pub expert_name: ExpertId,
    /// Fraud likelihood in [0, 1]
    pub score: f64,
    /// Self-reported confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub contributing_factors: Vec<ContributingFactor>,
    #[serde(default)]
    pub model_type: String,
}

impl ExpertDecision {
    /// Clamp score and confidence into [0, 1] and make every number
    /// JSON-representable.
    ///
    /// A non-finite score becomes the uninformative 0.5. A non-finite
    /// confidence or factor impact becomes 0.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        for factor in &mut self.contributing_factors {
            if !factor.impact.is_finite() {
                factor.impact = 0.0;
            }
        }
        self.score = if self.score.is_finite() {
            self.score.clamp(0.0, 1.0)
        } else {
            0.5
        };
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Whether the expert called this transaction fraudulent.
    pub fn predicts_fraud(&self, threshold: f64) -> bool {
        self.score > threshold
    }
}

/// Probability distribution over experts.
///
/// Values are non-negative and sum to 1 for a non-empty distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightDistribution(BTreeMap<ExpertId, f64>);

impl WeightDistribution {
    pub(crate) fn from_map(weights: BTreeMap<ExpertId, f64>) -> Self {
        Self(weights)
    }

    /// Uniform distribution over the given experts.
    pub fn uniform<'a>(experts: impl IntoIterator<Item = &'a ExpertId>) -> Self {
        let experts: Vec<&ExpertId> = experts.into_iter().collect();
        if experts.is_empty() {
            return Self::default();
        }
        let share = 1.0 / experts.len() as f64;
        Self(experts.into_iter().map(|e| (e.clone(), share)).collect())
    }

    /// Weight assigned to `expert`, zero when absent.
    pub fn get(&self, expert: &str) -> f64 {
        self.0.get(expert).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExpertId, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all weights (1.0 up to rounding for a valid distribution).
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }
}

/// A factor cited across experts, ranked by summed impact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryFactor {
    pub description: String,
    pub impact: f64,
    pub experts: Vec<ExpertId>,
}

/// The blended decision for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub transaction_id: String,
    pub final_score: f64,
    pub expert_decisions: DecisionSet,
    pub weights: WeightDistribution,
    pub primary_factors: Vec<PrimaryFactor>,
    pub needs_human_review: bool,
}

/// Decision published on the `alerts` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub transaction: Transaction,
    pub ensemble_decision: EnsembleDecision,
    pub processing_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

impl Payload for Alert {}

/// Ground-truth label for a previously scored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub alert_id: String,
    /// True if the transaction was fraud
    pub correct_label: bool,
    #[serde(default)]
    pub analyst_notes: Option<String>,
    /// When the label became known
    pub feedback_timestamp: DateTime<Utc>,
}

impl Payload for Feedback {
    fn validate(&self) -> Result<()> {
        if self.alert_id.trim().is_empty() {
            return Err(CoreError::InvalidPayload("empty alert_id".into()));
        }
        Ok(())
    }
}

/// Feedback joined with the decision it judges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFeedback {
    pub feedback: Feedback,
    pub transaction: Transaction,
    pub decisions: DecisionSet,
    /// Hours between the transaction and its label, never negative
    pub delay_hours: f64,
    /// Staleness discount in [floor, 1]
    pub importance_weight: f64,
    pub processed_at: DateTime<Utc>,
}

/// Smoothed per-expert accuracy published on `weight_updates`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightUpdateEvent {
    pub accuracies: BTreeMap<ExpertId, f64>,
}

impl WeightUpdateEvent {
    pub fn is_empty(&self) -> bool {
        self.accuracies.is_empty()
    }
}

impl Payload for WeightUpdateEvent {
    fn validate(&self) -> Result<()> {
        match self
            .accuracies
            .iter()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            Some((expert, value)) => Err(CoreError::InvalidPayload(format!(
                "accuracy {value} for {expert} outside [0, 1]"
            ))),
            None => Ok(()),
        }
    }
}

/// Payload on the `kill_switch` topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchCommand {
    #[serde(default)]
    pub active: bool,
}

impl Payload for KillSwitchCommand {}
