//! `arbiter run`: drive the engine against a simulated stream.
//!
//! Transactions are generated up front and appended to the in-memory
//! `transactions` topic. A simulated analyst consumes `alerts`, labels a
//! share of them with the true outcome after a random delay, and posts the
//! labels on `feedback`. The control loop does the rest.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arbiter_bus::{EventConsumer, InMemoryKeyValueStore, KeyValueStore};
use arbiter_core::{
    Alert, Channels, ControlLoop, DutyExit, Engine, EngineConfig, EngineStatistics,
    KillSwitchCommand, Payload, Topic,
};
use chrono::Utc;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigLoader;
use crate::simulation::{Analyst, MAX_DELAY_HOURS, TransactionGenerator, demo_experts};

/// Consumer group for the simulated analysts.
const ANALYST_GROUP: &str = "analyst";

/// How long to wait for posted feedback to be learned from.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct RunArgs {
    /// Transactions to generate
    #[arg(short = 'n', long, default_value_t = 500)]
    pub transactions: u64,

    /// Share of transactions that are fraudulent
    #[arg(long, default_value_t = 0.05)]
    pub fraud_rate: f64,

    /// Share of alerts that receive an analyst label
    #[arg(long, default_value_t = 0.8)]
    pub feedback_rate: f64,

    /// Upper bound on label delay, in hours
    #[arg(long, default_value_t = 24.0)]
    pub max_delay_hours: f64,

    /// Random seed for the stream and the analysts
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Milliseconds between scored transactions (overrides config)
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Activate the kill switch after this many alerts
    #[arg(long)]
    pub pause_after: Option<u64>,

    /// How long the kill switch stays active, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub pause_for_ms: u64,

    /// Extra config file layered on top of user and project config
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the final statistics as JSON
    #[arg(long)]
    pub json: bool,
}

/// What the simulated analysts saw.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalystReport {
    pub alerts_seen: u64,
    pub feedback_sent: u64,
    pub flagged_for_review: u64,
    /// Alerts where `final_score > 0.5` matched the true label
    pub correct_decisions: u64,
    pub fraud_seen: u64,
    pub fraud_caught: u64,
}

impl AnalystReport {
    fn record(&mut self, alert: &Alert, is_fraud: bool) {
        let decision = &alert.ensemble_decision;
        let predicted_fraud = decision.final_score > 0.5;

        self.alerts_seen += 1;
        if decision.needs_human_review {
            self.flagged_for_review += 1;
        }
        if predicted_fraud == is_fraud {
            self.correct_decisions += 1;
        }
        if is_fraud {
            self.fraud_seen += 1;
            if predicted_fraud {
                self.fraud_caught += 1;
            }
        }
    }

    pub fn accuracy(&self) -> Option<f64> {
        (self.alerts_seen > 0).then(|| self.correct_decisions as f64 / self.alerts_seen as f64)
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    analyst: &'a AnalystReport,
    engine: &'a EngineStatistics,
}

/// Kill-switch toggling driven by alert count.
#[derive(Debug, Clone, Copy)]
struct PausePlan {
    after_alerts: u64,
    duration: Duration,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;

    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let channels = Channels::in_memory();
    let engine = Arc::new(Engine::new(config, demo_experts(), store)?);

    let shutdown = CancellationToken::new();
    let handles = ControlLoop::new(Arc::clone(&engine), channels.clone())
        .spawn(shutdown.clone())
        .await?;

    // Subscribe before producing so no alert is missed
    let alerts = channels
        .alerts
        .consumer(ANALYST_GROUP)
        .await
        .context("Failed to subscribe to alerts")?;

    let truth = produce(&channels.transactions, &args).await?;
    info!(transactions = truth.len(), "Simulated stream published");

    let mut analyst = tokio::spawn(analyst_duty(
        alerts,
        channels.feedback.clone(),
        channels.kill_switch.clone(),
        truth,
        Analyst::new(
            args.seed.wrapping_add(1),
            args.feedback_rate,
            args.max_delay_hours,
        ),
        args.transactions,
        args.pause_after.map(|after_alerts| PausePlan {
            after_alerts,
            duration: Duration::from_millis(args.pause_for_ms),
        }),
        shutdown.clone(),
    ));

    let report = tokio::select! {
        joined = &mut analyst => joined.context("Analyst task failed")??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            shutdown.cancel();
            analyst.await.context("Analyst task failed")??
        }
    };

    settle(&engine, report.feedback_sent).await;

    shutdown.cancel();
    for (duty, exit) in handles.join().await {
        match exit {
            DutyExit::Shutdown => debug!(duty, "Duty stopped"),
            DutyExit::Error(reason) => warn!(duty, reason = %reason, "Duty failed"),
        }
    }

    let statistics = engine.statistics();
    if args.json {
        let summary = RunSummary {
            analyst: &report,
            engine: &statistics,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&report, &statistics);
    }

    Ok(())
}

fn build_config(args: &RunArgs) -> Result<EngineConfig> {
    validate_args(args)?;
    let mut config = ConfigLoader::load_with(args.config.as_deref())?;
    if let Some(ms) = args.interval_ms {
        config.control.transaction_interval = Duration::from_millis(ms);
    }
    Ok(config)
}

fn validate_args(args: &RunArgs) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.fraud_rate),
        "--fraud-rate must lie in [0, 1]"
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.feedback_rate),
        "--feedback-rate must lie in [0, 1]"
    );
    anyhow::ensure!(
        (0.0..=MAX_DELAY_HOURS).contains(&args.max_delay_hours),
        "--max-delay-hours must lie in [0, {MAX_DELAY_HOURS}]"
    );
    Ok(())
}

/// Publish the whole stream, returning the ground truth by transaction id.
async fn produce(topic: &Topic, args: &RunArgs) -> Result<HashMap<String, bool>> {
    let mut generator = TransactionGenerator::new(args.seed, args.fraud_rate, Utc::now())?;
    let mut truth = HashMap::with_capacity(args.transactions as usize);

    for _ in 0..args.transactions {
        let labeled = generator.next_transaction();
        let raw = labeled.transaction.encode()?;
        topic
            .append(raw)
            .await
            .context("Failed to publish transaction")?;
        truth.insert(labeled.transaction.transaction_id, labeled.is_fraud);
    }

    Ok(truth)
}

#[allow(clippy::too_many_arguments)]
async fn analyst_duty(
    mut consumer: Box<dyn EventConsumer<String>>,
    feedback: Topic,
    kill_switch: Topic,
    truth: HashMap<String, bool>,
    mut analyst: Analyst,
    expected: u64,
    pause: Option<PausePlan>,
    shutdown: CancellationToken,
) -> Result<AnalystReport> {
    let mut report = AnalystReport::default();

    while report.alerts_seen < expected {
        let batch = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            polled = consumer.poll(32, Duration::from_millis(200)) => {
                polled.context("Alert poll failed")?
            }
        };

        if batch.is_empty() {
            continue;
        }

        let last_offset = batch.last_offset();
        for (offset, raw) in batch {
            let alert = match Alert::decode(&raw) {
                Ok(alert) => alert,
                Err(e) => {
                    warn!(offset, error = %e, "Skipping malformed alert");
                    continue;
                }
            };
            let Some(&is_fraud) = truth.get(&alert.transaction.transaction_id) else {
                warn!(alert_id = %alert.alert_id, "Alert for unknown transaction");
                continue;
            };

            report.record(&alert, is_fraud);

            if let Some(label) = analyst.review(&alert, is_fraud) {
                feedback
                    .append(label.encode()?)
                    .await
                    .context("Failed to publish feedback")?;
                report.feedback_sent += 1;
            }

            if let Some(plan) = pause
                && report.alerts_seen == plan.after_alerts
            {
                toggle_kill_switch(&kill_switch, plan.duration).await?;
            }
        }

        if let Some(offset) = last_offset {
            consumer.commit(offset).await?;
        }
    }

    info!(
        alerts = report.alerts_seen,
        feedback = report.feedback_sent,
        "Analysts finished"
    );
    Ok(report)
}

/// Activate the kill switch now and release it after `duration`.
async fn toggle_kill_switch(topic: &Topic, duration: Duration) -> Result<()> {
    topic
        .append(KillSwitchCommand { active: true }.encode()?)
        .await?;
    info!(?duration, "Kill switch engaged by simulation");

    let topic = Arc::clone(topic);
    let release = KillSwitchCommand { active: false }.encode()?;
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        if let Err(e) = topic.append(release).await {
            warn!(error = %e, "Failed to release kill switch");
        }
    });
    Ok(())
}

/// Wait until every posted label has been handled, or give up.
async fn settle(engine: &Engine, sent: u64) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let counters = engine.statistics().counters;
        let handled =
            counters.feedback_applied + counters.feedback_dropped + counters.feedback_duplicates;
        if handled >= sent {
            return;
        }
        if Instant::now() >= deadline {
            warn!(handled, sent, "Timed out waiting for feedback");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn print_summary(report: &AnalystReport, statistics: &EngineStatistics) {
    println!("Simulation");
    println!("  Alerts:             {}", report.alerts_seen);
    println!("  Feedback sent:      {}", report.feedback_sent);
    println!("  Flagged for review: {}", report.flagged_for_review);
    if let Some(accuracy) = report.accuracy() {
        println!("  Decision accuracy:  {:.1}%", accuracy * 100.0);
    }
    println!(
        "  Fraud caught:       {}/{}",
        report.fraud_caught, report.fraud_seen
    );

    let counters = &statistics.counters;
    println!();
    println!("Engine ({:?})", statistics.state);
    println!("  Decisions:          {}", counters.decisions_emitted);
    println!("  Feedback applied:   {}", counters.feedback_applied);
    println!("  Feedback dropped:   {}", counters.feedback_dropped);
    println!("  Duplicates:         {}", counters.feedback_duplicates);
    println!("  Weight updates:     {}", counters.weight_updates_applied);
    println!(
        "  Mean label delay:   {:.2}h over {} labels",
        statistics.feedback.mean_delay, statistics.feedback.total_feedbacks
    );
    for bucket in &statistics.feedback.delay_histogram {
        println!("    {:>12}  {}", bucket.label, bucket.count);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Expert").fg(Color::Cyan),
        Cell::new("Recent").fg(Color::Cyan),
        Cell::new("Accuracy").fg(Color::Cyan),
        Cell::new("Updates").fg(Color::Cyan),
        Cell::new("Confidence").fg(Color::Cyan),
    ]);

    for (name, expert) in &statistics.experts {
        let accuracy = statistics
            .learning
            .expert_stats
            .get(name)
            .map(|s| format!("{:.3}", s.accuracy))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(name),
            Cell::new(format!("{:.3}", expert.recent_performance)),
            Cell::new(accuracy),
            Cell::new(expert.updates),
            Cell::new(format!("{:.2}", expert.confidence)),
        ]);
    }

    println!();
    println!("{table}");
}
