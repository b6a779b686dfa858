//! Key layout in the shared key-value store.

/// Latest aggregator statistics snapshot.
pub const ONLINE_LEARNING_STATS: &str = "online_learning_stats";

/// Scored transaction, written at decision time.
pub fn transaction(id: &str) -> String {
    format!("transaction:{id}")
}

/// Per-expert decisions for a transaction, written at decision time.
pub fn decisions(id: &str) -> String {
    format!("decisions:{id}")
}

/// Correlated feedback record, written by the correlator.
pub fn feedback_metadata(id: &str) -> String {
    format!("feedback_metadata:{id}")
}

/// Idempotency marker claimed the first time feedback is applied.
pub fn feedback_processed(id: &str) -> String {
    format!("feedback_processed:{id}")
}
