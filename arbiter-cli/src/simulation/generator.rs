//! Synthetic card-transaction stream with ground truth.

use std::collections::BTreeMap;

use arbiter_core::Transaction;
use chrono::{DateTime, Duration, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{LogNormal, Normal};

/// Number of anonymized `V` features per transaction.
pub const FEATURE_COUNT: usize = 28;

/// Seconds between consecutive transactions.
const SPACING_SECS: i64 = 10;

/// A transaction plus whether it was really fraud.
#[derive(Debug, Clone)]
pub struct LabeledTransaction {
    pub transaction: Transaction,
    pub is_fraud: bool,
}

/// Seeded generator. The same seed yields the same stream.
pub struct TransactionGenerator {
    rng: StdRng,
    base_time: DateTime<Utc>,
    fraud_rate: f64,
    next_index: u64,
    legit_amount: LogNormal<f64>,
    fraud_amount: LogNormal<f64>,
    feature: Normal<f64>,
}

impl TransactionGenerator {
    /// Fraudulent transactions draw larger amounts and shifted features.
    pub fn new(seed: u64, fraud_rate: f64, base_time: DateTime<Utc>) -> anyhow::Result<Self> {
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            base_time,
            fraud_rate: fraud_rate.clamp(0.0, 1.0),
            next_index: 0,
            legit_amount: LogNormal::new(4.0, 1.0)?,
            fraud_amount: LogNormal::new(6.5, 0.8)?,
            feature: Normal::new(0.0, 1.0)?,
        })
    }

    pub fn next_transaction(&mut self) -> LabeledTransaction {
        let idx = self.next_index;
        self.next_index += 1;

        let is_fraud = self.rng.gen_bool(self.fraud_rate);
        let amount = if is_fraud {
            self.fraud_amount.sample(&mut self.rng)
        } else {
            self.legit_amount.sample(&mut self.rng)
        };
        let shift = if is_fraud { 2.0 } else { 0.0 };

        let features: BTreeMap<String, f64> = (1..=FEATURE_COUNT)
            .map(|i| {
                let value = self.feature.sample(&mut self.rng);
                // Fraud pushes the first few components away from the origin
                let value = if i <= 4 { value + shift } else { value };
                (format!("V{i}"), value)
            })
            .collect();

        let transaction = Transaction {
            transaction_id: format!("txn_{idx}"),
            timestamp: self.base_time + Duration::seconds(idx as i64 * SPACING_SECS),
            amount: (amount * 100.0).round() / 100.0,
            customer_id: format!("cust_{}", self.rng.gen_range(0..1000)),
            merchant_id: format!("merch_{}", self.rng.gen_range(0..100)),
            location: format!("loc_{}", self.rng.gen_range(1..50)),
            device_id: format!("device_{}", self.rng.gen_range(1..10)),
            transaction_type: "purchase".to_string(),
            features,
        };

        LabeledTransaction {
            transaction,
            is_fraud,
        }
    }
}
