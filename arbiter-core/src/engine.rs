//! The engine: one explicitly constructed owner of all learning state.
//!
//! Every control-loop duty holds an `Arc<Engine>`. Internal state is
//! guarded per resource (one lock per bandit, per tracker history, the
//! aggregator buffer, the delay history) so duties only contend when they
//! touch the same piece.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use arbiter_bus::KeyValueStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::{LearningStatistics, OnlineAggregator};
use crate::config::EngineConfig;
use crate::context::build_context;
use crate::correlator::{CorrelationOutcome, FeedbackCorrelator};
use crate::delay::{DelayEstimator, DelayStatistics};
use crate::ensemble::{self, ExpertSet};
use crate::error::{CoreError, Result};
use crate::keys;
use crate::types::{Alert, ExpertId, Feedback, Payload, Transaction, WeightUpdateEvent};
use crate::weights::{ExpertStatistics, WeightManager};

/// Whether new transactions are being scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Running,
    /// Kill switch active: no new decisions, learning continues
    Paused,
}

/// What happened to one feedback message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    /// Learned from. Carries the weight update if the aggregator flushed.
    Applied {
        experts_updated: usize,
        weight_update: Option<WeightUpdateEvent>,
    },
    MissingTransaction,
    MissingDecisions,
    Duplicate,
}

/// Running totals across the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub decisions_emitted: u64,
    pub transactions_skipped: u64,
    pub feedback_applied: u64,
    pub feedback_dropped: u64,
    pub feedback_duplicates: u64,
    pub weight_updates_applied: u64,
}

#[derive(Debug, Default)]
struct Counters {
    decisions_emitted: AtomicU64,
    transactions_skipped: AtomicU64,
    feedback_applied: AtomicU64,
    feedback_dropped: AtomicU64,
    feedback_duplicates: AtomicU64,
    weight_updates_applied: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineCounters {
        EngineCounters {
            decisions_emitted: self.decisions_emitted.load(Ordering::Relaxed),
            transactions_skipped: self.transactions_skipped.load(Ordering::Relaxed),
            feedback_applied: self.feedback_applied.load(Ordering::Relaxed),
            feedback_dropped: self.feedback_dropped.load(Ordering::Relaxed),
            feedback_duplicates: self.feedback_duplicates.load(Ordering::Relaxed),
            weight_updates_applied: self.weight_updates_applied.load(Ordering::Relaxed),
        }
    }
}

/// Full diagnostics surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub state: ControlState,
    pub experts: BTreeMap<ExpertId, ExpertStatistics>,
    pub feedback: DelayStatistics,
    pub learning: LearningStatistics,
    pub counters: EngineCounters,
}

/// Adaptive ensemble-weighting engine.
pub struct Engine {
    config: EngineConfig,
    experts: ExpertSet,
    weights: WeightManager,
    correlator: FeedbackCorrelator,
    aggregator: OnlineAggregator,
    store: Arc<dyn KeyValueStore>,
    paused: AtomicBool,
    counters: Counters,
}

impl Engine {
    /// Build an engine for a fixed expert set.
    ///
    /// Fails on an invalid configuration or an empty expert set.
    pub fn new(
        config: EngineConfig,
        experts: ExpertSet,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        if experts.is_empty() {
            return Err(CoreError::NoExperts);
        }

        let names = experts.names();
        let correlator = FeedbackCorrelator::new(
            Arc::clone(&store),
            DelayEstimator::new(config.delay.clone()),
            config.correlator.clone(),
        );

        info!(experts = ?names, "Engine initialized");

        Ok(Self {
            weights: WeightManager::new(&names, &config),
            aggregator: OnlineAggregator::new(config.aggregator.clone()),
            correlator,
            experts,
            store,
            paused: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        })
    }

    /// Score one transaction and persist what feedback will need later.
    ///
    /// Returns `None` while the kill switch is active. Store failures are
    /// logged; the decision is still returned.
    pub async fn score_transaction(&self, transaction: &Transaction) -> Result<Option<Alert>> {
        if self.is_paused() {
            Counters::bump(&self.counters.transactions_skipped);
            debug!(
                transaction_id = %transaction.transaction_id,
                "Kill switch active, skipping transaction"
            );
            return Ok(None);
        }

        let started = Instant::now();
        let id = transaction.transaction_id.as_str();

        let context = build_context(transaction);
        let weights = self.weights.select_weights_for(&context);
        let decisions = self.experts.predict_all(transaction);
        let decision = ensemble::decide(id, decisions, weights, &self.config.ensemble);

        let ttl = self.config.ensemble.decision_ttl;
        let decisions_json = serde_json::to_string(&decision.expert_decisions)?;
        if let Err(e) = self.store.put(&keys::decisions(id), decisions_json, ttl).await {
            warn!(transaction_id = %id, error = %e, "Failed to store decisions");
        }
        if let Err(e) = self
            .store
            .put(&keys::transaction(id), transaction.encode()?, ttl)
            .await
        {
            warn!(transaction_id = %id, error = %e, "Failed to store transaction");
        }

        Counters::bump(&self.counters.decisions_emitted);
        debug!(
            transaction_id = %id,
            score = decision.final_score,
            review = decision.needs_human_review,
            "Scored transaction"
        );

        Ok(Some(Alert {
            alert_id: id.to_string(),
            transaction: transaction.clone(),
            ensemble_decision: decision,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            created_at: Utc::now(),
        }))
    }

    /// Correlate a label and learn from it.
    ///
    /// The bandits are updated immediately; the record is also queued for
    /// the batched accuracy estimate.
    pub async fn handle_feedback(&self, feedback: &Feedback) -> Result<FeedbackOutcome> {
        let record = match self.correlator.process(feedback).await? {
            CorrelationOutcome::Enriched(record) => *record,
            CorrelationOutcome::MissingTransaction => {
                Counters::bump(&self.counters.feedback_dropped);
                return Ok(FeedbackOutcome::MissingTransaction);
            }
            CorrelationOutcome::MissingDecisions => {
                Counters::bump(&self.counters.feedback_dropped);
                return Ok(FeedbackOutcome::MissingDecisions);
            }
            CorrelationOutcome::Duplicate => {
                Counters::bump(&self.counters.feedback_duplicates);
                return Ok(FeedbackOutcome::Duplicate);
            }
        };

        let context = build_context(&record.transaction);
        let experts_updated = self.weights.apply_feedback(
            context.as_slice(),
            &record.decisions,
            record.feedback.correct_label,
            record.importance_weight,
        );

        let weight_update = self.aggregator.accept(record);
        if weight_update.is_some() {
            self.persist_learning_stats().await;
        }

        Counters::bump(&self.counters.feedback_applied);
        Ok(FeedbackOutcome::Applied {
            experts_updated,
            weight_update,
        })
    }

    /// Record a batched accuracy event in the performance tracker.
    pub fn apply_weight_update(&self, event: &WeightUpdateEvent) -> usize {
        let applied = self.weights.apply_weight_update(event);
        Counters::bump(&self.counters.weight_updates_applied);
        debug!(experts = applied, "Applied batch weight update");
        applied
    }

    /// Flush the aggregator regardless of buffer size.
    pub async fn flush(&self) -> Option<WeightUpdateEvent> {
        let event = self.aggregator.flush()?;
        self.persist_learning_stats().await;
        Some(event)
    }

    async fn persist_learning_stats(&self) {
        let snapshot = self.aggregator.snapshot();
        let value = match serde_json::to_string(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode online learning statistics");
                return;
            }
        };
        match self
            .store
            .put(
                keys::ONLINE_LEARNING_STATS,
                value,
                self.config.aggregator.stats_ttl,
            )
            .await
        {
            Ok(()) => debug!("Persisted online learning statistics"),
            Err(e) => warn!(error = %e, "Failed to persist online learning statistics"),
        }
    }

    /// Set the kill switch. Returns the previous value.
    pub fn set_kill_switch(&self, active: bool) -> bool {
        let previous = self.paused.swap(active, Ordering::SeqCst);
        if previous != active {
            if active {
                warn!("Kill switch activated, pausing new decisions");
            } else {
                info!("Kill switch deactivated, resuming decisions");
            }
        }
        previous
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ControlState {
        if self.is_paused() {
            ControlState::Paused
        } else {
            ControlState::Running
        }
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            state: self.state(),
            experts: self.weights.statistics(),
            feedback: self.correlator.delay().statistics(),
            learning: self.aggregator.statistics(),
            counters: self.counters.snapshot(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightManager {
        &self.weights
    }

    pub fn aggregator(&self) -> &OnlineAggregator {
        &self.aggregator
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use arbiter_bus::InMemoryKeyValueStore;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::ensemble::Expert;
    use crate::types::ExpertDecision;

    struct Constant(&'static str, f64);

    impl Expert for Constant {
        fn name(&self) -> &str {
            self.0
        }

        fn predict(&self, _transaction: &Transaction) -> ExpertDecision {
            ExpertDecision {
                expert_name: self.0.into(),
                score: self.1,
                confidence: 0.8,
                contributing_factors: vec![],
                model_type: "constant".into(),
            }
        }
    }

    fn experts() -> ExpertSet {
        ExpertSet::new()
            .with(Arc::new(Constant("high", 0.9)))
            .with(Arc::new(Constant("low", 0.1)))
    }

    fn transaction(id: &str) -> Transaction {
        Transaction {
            transaction_id: id.into(),
            timestamp: Utc::now(),
            amount: 250.0,
            customer_id: "cust_7".into(),
            merchant_id: "merch_3".into(),
            location: "SFO".into(),
            device_id: "dev_9".into(),
            transaction_type: "purchase".into(),
            features: BTreeMap::from([("v1".to_string(), 0.5)]),
        }
    }

    fn engine_with(config: EngineConfig) -> (Engine, Arc<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let engine = Engine::new(config, experts(), store.clone()).unwrap();
        (engine, store)
    }

    fn feedback(tx: &Transaction, label: bool) -> Feedback {
        Feedback {
            alert_id: tx.transaction_id.clone(),
            correct_label: label,
            analyst_notes: Some("confirmed".into()),
            feedback_timestamp: tx.timestamp + ChronoDuration::hours(1),
        }
    }

    #[test]
    fn empty_expert_set_is_rejected() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let result = Engine::new(EngineConfig::default(), ExpertSet::new(), store);
        assert!(matches!(result, Err(CoreError::NoExperts)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.aggregator.batch_size = 0;
        let store = Arc::new(InMemoryKeyValueStore::new());
        assert!(matches!(
            Engine::new(config, experts(), store),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn scoring_persists_transaction_and_decisions() {
        let (engine, store) = engine_with(EngineConfig::default());
        let tx = transaction("txn_1");

        let alert = engine.score_transaction(&tx).await.unwrap().unwrap();
        assert_eq!(alert.alert_id, "txn_1");
        // Fresh bandits give equal weight, so the blend is the plain mean
        assert!((alert.ensemble_decision.final_score - 0.5).abs() < 1e-9);
        assert!(alert.ensemble_decision.needs_human_review);

        assert!(store.get(&keys::transaction("txn_1")).await.unwrap().is_some());
        assert!(store.get(&keys::decisions("txn_1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kill_switch_skips_scoring_and_resumes() {
        let (engine, _store) = engine_with(EngineConfig::default());

        assert!(!engine.set_kill_switch(true));
        assert_eq!(engine.state(), ControlState::Paused);
        assert!(engine.score_transaction(&transaction("a")).await.unwrap().is_none());

        assert!(engine.set_kill_switch(false));
        assert_eq!(engine.state(), ControlState::Running);
        assert!(engine.score_transaction(&transaction("b")).await.unwrap().is_some());

        let counters = engine.statistics().counters;
        assert_eq!(counters.transactions_skipped, 1);
        assert_eq!(counters.decisions_emitted, 1);
    }

    #[tokio::test]
    async fn feedback_is_learned_while_paused() {
        let (engine, _store) = engine_with(EngineConfig::default());
        let tx = transaction("txn_1");
        engine.score_transaction(&tx).await.unwrap();

        engine.set_kill_switch(true);
        let outcome = engine.handle_feedback(&feedback(&tx, true)).await.unwrap();
        assert!(matches!(
            outcome,
            FeedbackOutcome::Applied {
                experts_updated: 2,
                weight_update: None
            }
        ));
        assert_eq!(engine.weights().bandit("high").unwrap().updates(), 1);
        assert_eq!(engine.aggregator().pending_len(), 1);
    }

    struct NanFactor;

    impl Expert for NanFactor {
        fn name(&self) -> &str {
            "nan_factor"
        }

        fn predict(&self, _transaction: &Transaction) -> ExpertDecision {
            ExpertDecision {
                expert_name: "nan_factor".into(),
                score: 0.7,
                confidence: 0.5,
                contributing_factors: vec![crate::types::ContributingFactor {
                    description: "unstable model output".into(),
                    impact: f64::NAN,
                    features_involved: vec!["v1".into()],
                }],
                model_type: "static".into(),
            }
        }
    }

    #[tokio::test]
    async fn non_finite_factor_impact_does_not_lose_feedback() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let engine = Engine::new(
            EngineConfig::default(),
            experts().with(Arc::new(NanFactor)),
            store,
        )
        .unwrap();
        let tx = transaction("txn_nan");

        let alert = engine.score_transaction(&tx).await.unwrap().unwrap();
        assert_eq!(
            alert.ensemble_decision.expert_decisions["nan_factor"].contributing_factors[0].impact,
            0.0
        );

        let outcome = engine.handle_feedback(&feedback(&tx, true)).await.unwrap();
        assert!(matches!(
            outcome,
            FeedbackOutcome::Applied {
                experts_updated: 3,
                ..
            }
        ));
        assert_eq!(engine.weights().bandit("nan_factor").unwrap().updates(), 1);
    }

    #[tokio::test]
    async fn duplicate_feedback_is_applied_once() {
        let (engine, _store) = engine_with(EngineConfig::default());
        let tx = transaction("txn_1");
        engine.score_transaction(&tx).await.unwrap();

        engine.handle_feedback(&feedback(&tx, true)).await.unwrap();
        let second = engine.handle_feedback(&feedback(&tx, true)).await.unwrap();

        assert_eq!(second, FeedbackOutcome::Duplicate);
        assert_eq!(engine.weights().bandit("high").unwrap().updates(), 1);
        assert_eq!(engine.statistics().counters.feedback_duplicates, 1);
    }

    #[tokio::test]
    async fn unknown_feedback_is_dropped() {
        let (engine, _store) = engine_with(EngineConfig::default());
        let outcome = engine
            .handle_feedback(&feedback(&transaction("ghost"), false))
            .await
            .unwrap();
        assert_eq!(outcome, FeedbackOutcome::MissingTransaction);
        assert_eq!(engine.statistics().counters.feedback_dropped, 1);
    }

    #[tokio::test]
    async fn full_batch_emits_weight_update_and_persists_stats() {
        let mut config = EngineConfig::default();
        config.aggregator.batch_size = 2;
        let (engine, store) = engine_with(config);

        let mut last = None;
        for id in ["a", "b"] {
            let tx = transaction(id);
            engine.score_transaction(&tx).await.unwrap();
            last = Some(engine.handle_feedback(&feedback(&tx, true)).await.unwrap());
        }

        let Some(FeedbackOutcome::Applied {
            weight_update: Some(event),
            ..
        }) = last
        else {
            panic!("expected a weight update, got {last:?}");
        };
        assert_eq!(event.accuracies["high"], 1.0);
        assert_eq!(event.accuracies["low"], 0.0);
        assert!(
            store
                .get(keys::ONLINE_LEARNING_STATS)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop() {
        let (engine, store) = engine_with(EngineConfig::default());
        assert!(engine.flush().await.is_none());
        assert!(
            store
                .get(keys::ONLINE_LEARNING_STATS)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn weight_update_feeds_tracker() {
        let (engine, _store) = engine_with(EngineConfig::default());
        let mut event = WeightUpdateEvent::default();
        event.accuracies.insert("high".into(), 0.75);
        event.accuracies.insert("retired".into(), 0.2);

        assert_eq!(engine.apply_weight_update(&event), 1);
        let stats = engine.statistics();
        assert_eq!(stats.experts["high"].recent_performance, 0.75);
        assert_eq!(stats.experts["low"].recent_performance, 0.5);
    }

    #[tokio::test]
    async fn statistics_report_delays() {
        let (engine, _store) = engine_with(EngineConfig::default());
        let tx = transaction("txn_1");
        engine.score_transaction(&tx).await.unwrap();
        engine.handle_feedback(&feedback(&tx, false)).await.unwrap();

        let stats = engine.statistics();
        assert_eq!(stats.feedback.total_feedbacks, 1);
        assert!((stats.feedback.mean_delay - 1.0).abs() < 1e-6);
        assert_eq!(stats.feedback.delay_histogram.len(), 1);
        assert_eq!(stats.learning.pending_updates, 1);
    }
}
