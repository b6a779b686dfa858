//! Long-running control loop.
//!
//! Five independent duties share one [`Engine`]:
//!
//! | Duty | Input | Effect |
//! |------|-------|--------|
//! | transactions | `transactions` topic | score, publish on `alerts` |
//! | feedback | `feedback` topic | correlate, update bandits, queue for batch |
//! | weight updates | `weight_updates` topic | record accuracies in the tracker |
//! | kill switch | `kill_switch` topic | pause or resume scoring |
//! | flush | timer | flush the aggregator, publish on `weight_updates` |
//!
//! The kill switch gates only the transaction duty. While paused it stops
//! polling, and a transaction already polled is rewound so it is scored
//! after the switch is released.
//!
//! A malformed or failing message is logged and skipped. Only a failing
//! poll stops a duty.

use std::sync::Arc;

use arbiter_bus::{EventConsumer, EventLog, InMemoryEventLog, Offset, SeekPosition};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::ControlConfig;
use crate::engine::{Engine, FeedbackOutcome};
use crate::types::{Feedback, KillSwitchCommand, Payload, Transaction, WeightUpdateEvent};

/// Shared handle to one topic carrying JSON payloads.
pub type Topic = Arc<dyn EventLog<String>>;

/// Topics the control loop reads and writes.
#[derive(Clone)]
pub struct Channels {
    pub transactions: Topic,
    pub alerts: Topic,
    pub feedback: Topic,
    pub weight_updates: Topic,
    pub kill_switch: Topic,
}

impl Channels {
    /// Fresh in-memory topics.
    pub fn in_memory() -> Self {
        Self {
            transactions: Arc::new(InMemoryEventLog::<String>::new("transactions")),
            alerts: Arc::new(InMemoryEventLog::<String>::new("alerts")),
            feedback: Arc::new(InMemoryEventLog::<String>::new("feedback")),
            weight_updates: Arc::new(InMemoryEventLog::<String>::new("weight_updates")),
            kill_switch: Arc::new(InMemoryEventLog::<String>::new("kill_switch")),
        }
    }
}

/// Why a duty stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DutyExit {
    /// Stopped due to the shutdown signal.
    Shutdown,
    /// Stopped due to an unrecoverable error.
    Error(String),
}

/// Builder for the running duties.
pub struct ControlLoop {
    engine: Arc<Engine>,
    channels: Channels,
}

impl ControlLoop {
    pub fn new(engine: Arc<Engine>, channels: Channels) -> Self {
        Self { engine, channels }
    }

    /// Subscribe to every topic and start all duties.
    ///
    /// Each duty stops when `shutdown` is cancelled, after finishing the
    /// message it is working on.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<ControlHandles> {
        let config = self.engine.config().control.clone();
        let channels = &self.channels;

        let transactions = channels
            .transactions
            .consumer(&config.group_for("transactions"))
            .await?;
        let feedback = channels
            .feedback
            .consumer(&config.group_for("feedback"))
            .await?;
        let weight_updates = channels
            .weight_updates
            .consumer(&config.group_for("weight-updates"))
            .await?;
        let kill_switch = channels
            .kill_switch
            .consumer(&config.group_for("kill-switch"))
            .await?;

        info!(group = %config.group, "Starting control loop");

        let handles = ControlHandles {
            transactions: tokio::spawn(transaction_duty(
                Arc::clone(&self.engine),
                transactions,
                Arc::clone(&channels.alerts),
                config.clone(),
                shutdown.clone(),
            )),
            feedback: tokio::spawn(feedback_duty(
                Arc::clone(&self.engine),
                feedback,
                Arc::clone(&channels.weight_updates),
                config.clone(),
                shutdown.clone(),
            )),
            weight_updates: tokio::spawn(weight_update_duty(
                Arc::clone(&self.engine),
                weight_updates,
                config.clone(),
                shutdown.clone(),
            )),
            kill_switch: tokio::spawn(kill_switch_duty(
                Arc::clone(&self.engine),
                kill_switch,
                config,
                shutdown.clone(),
            )),
            flush: tokio::spawn(flush_duty(
                Arc::clone(&self.engine),
                Arc::clone(&channels.weight_updates),
                shutdown,
            )),
        };

        Ok(handles)
    }
}

/// Join handles for the running duties.
pub struct ControlHandles {
    transactions: JoinHandle<DutyExit>,
    feedback: JoinHandle<DutyExit>,
    weight_updates: JoinHandle<DutyExit>,
    kill_switch: JoinHandle<DutyExit>,
    flush: JoinHandle<DutyExit>,
}

impl ControlHandles {
    /// Wait for every duty to stop, in a fixed order.
    pub async fn join(self) -> Vec<(&'static str, DutyExit)> {
        let duties = [
            ("transactions", self.transactions),
            ("feedback", self.feedback),
            ("weight_updates", self.weight_updates),
            ("kill_switch", self.kill_switch),
            ("flush", self.flush),
        ];

        let mut exits = Vec::with_capacity(duties.len());
        for (name, handle) in duties {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => DutyExit::Error(format!("Task failed: {e}")),
            };
            if let DutyExit::Error(ref reason) = exit {
                error!(duty = name, reason = %reason, "Duty stopped with error");
            }
            exits.push((name, exit));
        }
        exits
    }
}

/// Publish a payload, logging instead of failing.
async fn publish<P: Payload>(topic: &Topic, payload: &P, what: &str) {
    let raw = match payload.encode() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(payload = what, error = %e, "Failed to encode payload");
            return;
        }
    };
    if let Err(e) = topic.append(raw).await {
        warn!(payload = what, error = %e, "Failed to publish payload");
    }
}

async fn commit(consumer: &mut Box<dyn EventConsumer<String>>, offset: Offset) {
    if let Err(e) = consumer.commit(offset).await {
        warn!(group = consumer.group(), error = %e, "Failed to commit offset");
    }
}

async fn rewind(consumer: &mut Box<dyn EventConsumer<String>>, offset: Offset) -> Option<DutyExit> {
    if let Err(e) = consumer.seek(SeekPosition::Offset(offset)).await {
        error!(offset, error = %e, "Failed to rewind paused transaction");
        return Some(DutyExit::Error(format!("Seek failed: {e}")));
    }
    None
}

async fn transaction_duty(
    engine: Arc<Engine>,
    mut consumer: Box<dyn EventConsumer<String>>,
    alerts: Topic,
    config: ControlConfig,
    shutdown: CancellationToken,
) -> DutyExit {
    info!(group = consumer.group(), "Transaction duty starting");

    loop {
        if engine.is_paused() {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Transaction duty received shutdown signal");
                    return DutyExit::Shutdown;
                }
                _ = tokio::time::sleep(config.paused_backoff) => {}
            }
            continue;
        }

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Transaction duty received shutdown signal");
                return DutyExit::Shutdown;
            }

            poll_result = consumer.poll(config.poll_batch_size, config.poll_timeout) => {
                let batch = match poll_result {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(error = %e, "Transaction poll error");
                        return DutyExit::Error(format!("Poll failed: {e}"));
                    }
                };

                for (offset, raw) in batch {
                    let transaction = match Transaction::decode(&raw) {
                        Ok(transaction) => transaction,
                        Err(e) => {
                            warn!(offset, error = %e, "Skipping malformed transaction");
                            commit(&mut consumer, offset).await;
                            continue;
                        }
                    };

                    match engine.score_transaction(&transaction).await {
                        Ok(Some(alert)) => publish(&alerts, &alert, "alert").await,
                        Ok(None) => {
                            // Paused between poll and scoring: rewind, keep the rest
                            debug!(offset, "Kill switch active, rewinding transaction");
                            if let Some(exit) = rewind(&mut consumer, offset).await {
                                return exit;
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(
                                transaction_id = %transaction.transaction_id,
                                error = %e,
                                "Failed to score transaction"
                            );
                        }
                    }
                    commit(&mut consumer, offset).await;

                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => {
                            info!("Transaction duty received shutdown signal");
                            return DutyExit::Shutdown;
                        }
                        _ = tokio::time::sleep(config.transaction_interval) => {}
                    }
                }
            }
        }
    }
}

async fn feedback_duty(
    engine: Arc<Engine>,
    mut consumer: Box<dyn EventConsumer<String>>,
    weight_updates: Topic,
    config: ControlConfig,
    shutdown: CancellationToken,
) -> DutyExit {
    info!(group = consumer.group(), "Feedback duty starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Feedback duty received shutdown signal");
                return DutyExit::Shutdown;
            }

            poll_result = consumer.poll(config.poll_batch_size, config.poll_timeout) => {
                let batch = match poll_result {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(error = %e, "Feedback poll error");
                        return DutyExit::Error(format!("Poll failed: {e}"));
                    }
                };

                debug!(count = batch.len(), "Processing feedback batch");
                let last_offset = batch.last_offset();

                for (offset, raw) in batch {
                    let feedback = match Feedback::decode(&raw) {
                        Ok(feedback) => feedback,
                        Err(e) => {
                            warn!(offset, error = %e, "Skipping malformed feedback");
                            continue;
                        }
                    };

                    match engine.handle_feedback(&feedback).await {
                        Ok(FeedbackOutcome::Applied { experts_updated, weight_update }) => {
                            debug!(
                                alert_id = %feedback.alert_id,
                                experts_updated,
                                "Applied feedback"
                            );
                            if let Some(event) = weight_update {
                                publish(&weight_updates, &event, "weight_update").await;
                            }
                        }
                        Ok(outcome) => {
                            debug!(alert_id = %feedback.alert_id, ?outcome, "Feedback not applied");
                        }
                        Err(e) => {
                            warn!(
                                alert_id = %feedback.alert_id,
                                error = %e,
                                "Failed to process feedback"
                            );
                        }
                    }
                }

                if let Some(offset) = last_offset {
                    commit(&mut consumer, offset).await;
                }
            }
        }
    }
}

async fn weight_update_duty(
    engine: Arc<Engine>,
    mut consumer: Box<dyn EventConsumer<String>>,
    config: ControlConfig,
    shutdown: CancellationToken,
) -> DutyExit {
    info!(group = consumer.group(), "Weight update duty starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Weight update duty received shutdown signal");
                return DutyExit::Shutdown;
            }

            poll_result = consumer.poll(config.poll_batch_size, config.poll_timeout) => {
                let batch = match poll_result {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(error = %e, "Weight update poll error");
                        return DutyExit::Error(format!("Poll failed: {e}"));
                    }
                };

                let last_offset = batch.last_offset();
                for (offset, raw) in batch {
                    match WeightUpdateEvent::decode(&raw) {
                        Ok(event) => {
                            engine.apply_weight_update(&event);
                        }
                        Err(e) => warn!(offset, error = %e, "Skipping malformed weight update"),
                    }
                }

                if let Some(offset) = last_offset {
                    commit(&mut consumer, offset).await;
                }
            }
        }
    }
}

async fn kill_switch_duty(
    engine: Arc<Engine>,
    mut consumer: Box<dyn EventConsumer<String>>,
    config: ControlConfig,
    shutdown: CancellationToken,
) -> DutyExit {
    info!(group = consumer.group(), "Kill switch duty starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Kill switch duty received shutdown signal");
                return DutyExit::Shutdown;
            }

            poll_result = consumer.poll(config.poll_batch_size, config.poll_timeout) => {
                let batch = match poll_result {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(error = %e, "Kill switch poll error");
                        return DutyExit::Error(format!("Poll failed: {e}"));
                    }
                };

                let last_offset = batch.last_offset();
                for (offset, raw) in batch {
                    match KillSwitchCommand::decode(&raw) {
                        Ok(command) => {
                            engine.set_kill_switch(command.active);
                        }
                        Err(e) => warn!(offset, error = %e, "Skipping malformed kill switch command"),
                    }
                }

                if let Some(offset) = last_offset {
                    commit(&mut consumer, offset).await;
                }
            }
        }
    }
}

async fn flush_duty(engine: Arc<Engine>, weight_updates: Topic, shutdown: CancellationToken) -> DutyExit {
    let period = engine.config().aggregator.flush_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval = ?period, "Flush duty starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                if let Some(event) = engine.flush().await {
                    info!(experts = event.accuracies.len(), "Final flush on shutdown");
                    publish(&weight_updates, &event, "weight_update").await;
                }
                return DutyExit::Shutdown;
            }

            _ = ticker.tick() => {
                if let Some(event) = engine.flush().await {
                    debug!(experts = event.accuracies.len(), "Timer flush");
                    publish(&weight_updates, &event, "weight_update").await;
                }
            }
        }
    }
}
