//! Configuration for the arbiter engine.
//!
//! Every section has complete defaults, so an empty TOML document yields a
//! working engine. Durations use human-readable strings such as `"60s"` or
//! `"24h"`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub weights: WeightConfig,
    #[serde(default)]
    pub delay: DelayConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

impl EngineConfig {
    /// Reject settings that would break the learning loop.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(CoreError::InvalidConfig(msg.into()))
        }

        if !(self.bandit.alpha.is_finite() && self.bandit.alpha >= 0.0) {
            return invalid("bandit.alpha must be finite and >= 0");
        }
        if !(self.bandit.ridge_epsilon.is_finite() && self.bandit.ridge_epsilon > 0.0) {
            return invalid("bandit.ridge_epsilon must be finite and > 0");
        }
        if self.bandit.confidence_saturation == 0 {
            return invalid("bandit.confidence_saturation must be positive");
        }
        if self.tracker.capacity == 0 || self.tracker.recent_window == 0 {
            return invalid("tracker capacity and recent_window must be positive");
        }
        if !(self.weights.temperature.is_finite() && self.weights.temperature > 0.0) {
            return invalid("weights.temperature must be finite and > 0");
        }
        if !(self.delay.decay_rate.is_finite() && self.delay.decay_rate > 0.0) {
            return invalid("delay.decay_rate must be finite and > 0");
        }
        if !(self.delay.min_weight > 0.0 && self.delay.min_weight <= 1.0) {
            return invalid("delay.min_weight must lie in (0, 1]");
        }
        if self.delay.history_capacity == 0 || self.delay.histogram_bins == 0 {
            return invalid("delay history_capacity and histogram_bins must be positive");
        }
        if self.aggregator.batch_size == 0 {
            return invalid("aggregator.batch_size must be positive");
        }
        if self.aggregator.flush_interval.is_zero() {
            return invalid("aggregator.flush_interval must be non-zero");
        }
        if !(self.aggregator.learning_rate > 0.0 && self.aggregator.learning_rate <= 1.0) {
            return invalid("aggregator.learning_rate must lie in (0, 1]");
        }
        if self.ensemble.review_band_low > self.ensemble.review_band_high {
            return invalid("ensemble review band is inverted");
        }
        if self.control.poll_batch_size == 0 {
            return invalid("control.poll_batch_size must be positive");
        }
        Ok(())
    }
}

/// LinUCB settings shared by every expert's bandit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Exploration strength
    pub alpha: f64,
    /// Ridge term added to the covariance when it cannot be inverted
    pub ridge_epsilon: f64,
    /// Updates after which confidence saturates at 1.0
    pub confidence_saturation: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            ridge_epsilon: 0.01,
            confidence_saturation: 100,
        }
    }
}

/// Rolling reward history per expert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Rewards kept per expert before the oldest is evicted
    pub capacity: usize,
    /// Trailing window for recent performance
    pub recent_window: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            recent_window: 100,
        }
    }
}

/// Softmax settings for turning bandit scores into weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub temperature: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

/// Importance weighting of delayed labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Decay per hour of delay (lambda in e^(-lambda * hours))
    pub decay_rate: f64,
    /// Floor below which a label's weight never drops
    pub min_weight: f64,
    /// Delay observations retained for diagnostics
    pub history_capacity: usize,
    /// Bins in the reported delay histogram
    pub histogram_bins: usize,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.1,
            min_weight: 0.1,
            history_capacity: 10_000,
            histogram_bins: 5,
        }
    }
}

/// Feedback correlation against stored decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Retention for feedback metadata and the processed marker
    #[serde(with = "humantime_serde")]
    pub record_ttl: Duration,
    /// Drop a second feedback for an alert already learned from
    pub deduplicate: bool,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 3600),
            deduplicate: true,
        }
    }
}

/// Batched accuracy estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Buffered records that trigger a flush
    pub batch_size: usize,
    /// Maximum time a record waits before a flush
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Smoothing factor for the accuracy EMA
    pub learning_rate: f64,
    /// Score above which an expert counts as predicting fraud
    pub correct_threshold: f64,
    /// Retention for the persisted learning statistics
    #[serde(with = "humantime_serde")]
    pub stats_ttl: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(60),
            learning_rate: 0.1,
            correct_threshold: 0.5,
            stats_ttl: Duration::from_secs(3600),
        }
    }
}

/// Blending of expert scores into one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Lower edge of the band routed to human review
    pub review_band_low: f64,
    /// Upper edge of the band routed to human review
    pub review_band_high: f64,
    /// Cross-expert factors reported per decision
    pub primary_factor_count: usize,
    /// Retention for stored transactions and decisions
    #[serde(with = "humantime_serde")]
    pub decision_ttl: Duration,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            review_band_low: 0.3,
            review_band_high: 0.7,
            primary_factor_count: 3,
            decision_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Scheduling of the control-loop duties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Consumer group prefix for every subscription
    #[serde(default = "default_group")]
    pub group: String,
    /// Pause between scored transactions
    #[serde(default = "default_transaction_interval", with = "humantime_serde")]
    pub transaction_interval: Duration,
    /// Sleep between kill-switch checks while paused
    #[serde(default = "default_paused_backoff", with = "humantime_serde")]
    pub paused_backoff: Duration,
    /// Maximum messages per poll
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    /// How long a poll waits for the first message
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,
}

fn default_group() -> String {
    "arbiter".to_string()
}

fn default_transaction_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_paused_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_batch_size() -> usize {
    32
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            transaction_interval: default_transaction_interval(),
            paused_backoff: default_paused_backoff(),
            poll_batch_size: default_poll_batch_size(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

impl ControlConfig {
    /// Consumer group name for one duty.
    pub fn group_for(&self, duty: &str) -> String {
        format!("{}-{}", self.group, duty)
    }
}
