//! Context vectors for expert selection.
//!
//! A transaction is summarised as a fixed ten-dimensional vector. Categorical
//! fields go through a stable hash so the same merchant maps to the same
//! coordinate in every process.

use chrono::{Datelike, Timelike};
use nalgebra::SVector;

use crate::types::Transaction;

/// Dimension of every context vector.
pub const CONTEXT_DIM: usize = 10;

/// Fixed-length context vector.
pub type ContextVector = SVector<f64, CONTEXT_DIM>;

/// Fit an arbitrary-length slice to [`CONTEXT_DIM`].
///
/// Longer input is truncated, shorter input is zero-padded, and non-finite
/// entries become zero.
pub fn normalize(raw: &[f64]) -> ContextVector {
    ContextVector::from_fn(|i, _| {
        let v = raw.get(i).copied().unwrap_or(0.0);
        if v.is_finite() { v } else { 0.0 }
    })
}

/// Build the context vector for a transaction.
pub fn build_context(tx: &Transaction) -> ContextVector {
    let feature_magnitude: f64 = tx
        .features
        .values()
        .filter(|v| v.is_finite())
        .map(|v| v.abs())
        .sum();

    normalize(&[
        tx.amount / 1000.0,
        (tx.customer_id.len() % 100) as f64 / 100.0,
        bucket(&tx.merchant_id),
        bucket(&tx.location),
        bucket(&tx.device_id),
        f64::from(tx.timestamp.hour()) / 24.0,
        f64::from(tx.timestamp.weekday().num_days_from_monday()) / 7.0,
        tx.features.len() as f64 / 30.0,
        feature_magnitude / 100.0,
        if tx.transaction_type == "purchase" { 1.0 } else { 0.0 },
    ])
}

/// Map a categorical value to [0, 1) in steps of 0.01.
fn bucket(value: &str) -> f64 {
    (stable_hash(value) % 100) as f64 / 100.0
}

/// FNV-1a hash, identical across platforms and runs.
pub fn stable_hash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn transaction() -> Transaction {
        Transaction {
            transaction_id: "txn_1".into(),
            // A Wednesday
            timestamp: Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap(),
            amount: 2500.0,
            customer_id: "cust_42".into(),
            merchant_id: "merch_7".into(),
            location: "loc_3".into(),
            device_id: "device_1".into(),
            transaction_type: "purchase".into(),
            features: BTreeMap::from([("V1".into(), -2.0), ("V2".into(), 3.0)]),
        }
    }

    #[test]
    fn test_normalize_pads_short_input() {
        let v = normalize(&[1.0, 2.0]);
        assert_eq!(v[0], 1.0);
        assert_eq!(v[1], 2.0);
        assert!(v.iter().skip(2).all(|x| *x == 0.0));
    }

    #[test]
    fn test_normalize_truncates_long_input() {
        let raw: Vec<f64> = (0..15).map(f64::from).collect();
        let v = normalize(&raw);
        assert_eq!(v.len(), CONTEXT_DIM);
        assert_eq!(v[9], 9.0);
    }

    #[test]
    fn test_normalize_zeroes_non_finite() {
        let v = normalize(&[f64::NAN, f64::INFINITY, 0.5]);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[1], 0.0);
        assert_eq!(v[2], 0.5);
    }

    #[test]
    fn test_build_context_fields() {
        let v = build_context(&transaction());
        assert_eq!(v[0], 2.5);
        assert_eq!(v[1], 0.07);
        assert_eq!(v[5], 0.5);
        assert!((v[6] - 2.0 / 7.0).abs() < 1e-12);
        assert!((v[7] - 2.0 / 30.0).abs() < 1e-12);
        assert!((v[8] - 0.05).abs() < 1e-12);
        assert_eq!(v[9], 1.0);
        for i in 2..5 {
            assert!((0.0..1.0).contains(&v[i]));
        }
    }

    #[test]
    fn test_build_context_is_deterministic() {
        let tx = transaction();
        assert_eq!(build_context(&tx), build_context(&tx));
    }

    #[test]
    fn test_stable_hash_known_value() {
        // FNV-1a 64-bit of the empty string is the offset basis
        assert_eq!(stable_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(stable_hash("merch_1"), stable_hash("merch_2"));
    }
}
