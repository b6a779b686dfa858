//! arbiter-core - Adaptive ensemble weighting with delayed feedback
//!
//! Blends independent fraud-scoring experts under weights chosen per
//! transaction by a LinUCB bandit per expert, then closes the loop when
//! ground-truth labels arrive hours or days later:
//!
//! 1. [`context`] turns a transaction into a fixed-length context vector
//! 2. [`weights`] scores each expert's bandit and softmaxes into weights
//! 3. [`ensemble`] blends expert scores and ranks cited factors
//! 4. [`correlator`] joins a late label with the stored decision and
//!    discounts it by delay ([`delay`])
//! 5. [`weights`] updates the bandits immediately; [`aggregator`] batches
//!    the same evidence into a smoothed per-expert accuracy
//! 6. [`control`] runs all of the above as concurrent duties over the bus
//!
//! [`Engine`] owns every piece of learning state.

pub mod aggregator;
pub mod bandit;
pub mod config;
pub mod context;
pub mod control;
pub mod correlator;
pub mod delay;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod keys;
pub mod tracker;
pub mod types;
pub mod weights;

pub use aggregator::{
    BatchPerformance, ExpertAccuracy, LearningStatistics, OnlineAggregator, OnlineLearningStats,
    summarize_batch,
};
pub use bandit::{BanditSnapshot, LinUcb};
pub use config::{
    AggregatorConfig, BanditConfig, ControlConfig, CorrelatorConfig, DelayConfig, EngineConfig,
    EnsembleConfig, TrackerConfig, WeightConfig,
};
pub use context::{CONTEXT_DIM, ContextVector, build_context, normalize, stable_hash};
pub use control::{Channels, ControlHandles, ControlLoop, DutyExit, Topic};
pub use correlator::{CorrelationOutcome, FeedbackCorrelator, FeedbackMetadata};
pub use delay::{DelayBucket, DelayEstimator, DelayStatistics};
pub use engine::{ControlState, Engine, EngineCounters, EngineStatistics, FeedbackOutcome};
pub use ensemble::{Expert, ExpertSet, combine, needs_human_review, primary_factors};
pub use error::{CoreError, Result};
pub use tracker::{PerformanceSummary, PerformanceTracker};
pub use types::*;
pub use weights::{ExpertStatistics, WeightManager, reward_for};
