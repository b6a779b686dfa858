//! Local simulation: demo experts, a synthetic labelled stream and the
//! analysts who label it.

mod analyst;
mod experts;
mod generator;

pub use analyst::{Analyst, MAX_DELAY_HOURS};
pub use experts::{AmountExpert, AnomalyExpert, RuleExpert};
pub use generator::TransactionGenerator;

use std::sync::Arc;

use arbiter_core::ExpertSet;

/// The three demo experts.
pub fn demo_experts() -> ExpertSet {
    ExpertSet::new()
        .with(Arc::new(RuleExpert::new()))
        .with(Arc::new(AmountExpert))
        .with(Arc::new(AnomalyExpert::default()))
}
