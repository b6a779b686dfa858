//! Linear upper-confidence-bound bandit, one per expert.
//!
//! Each bandit keeps a ridge-regression estimate of the reward an expert
//! earns as a linear function of context:
//!
//! - `A` starts at the identity and accumulates `x xᵀ` per update
//! - `b` accumulates `reward · x`
//! - `θ = A⁻¹ b` is the point estimate
//!
//! The score adds an exploration bonus `α · sqrt(xᵀ A⁻¹ x)` that shrinks as
//! the context region is observed more often.
//!
//! `A`, `A⁻¹`, `b`, `θ` and the update counter live behind one lock so a
//! reader always sees a matched set.

use std::sync::{PoisonError, RwLock};

use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BanditConfig;
use crate::context::{CONTEXT_DIM, ContextVector};

/// Square matrix matching the context dimension.
pub type CovarianceMatrix = SMatrix<f64, CONTEXT_DIM, CONTEXT_DIM>;

#[derive(Debug, Clone)]
struct BanditState {
    a: CovarianceMatrix,
    a_inv: CovarianceMatrix,
    b: ContextVector,
    theta: ContextVector,
    updates: u64,
}

impl BanditState {
    fn new() -> Self {
        Self {
            a: CovarianceMatrix::identity(),
            a_inv: CovarianceMatrix::identity(),
            b: ContextVector::zeros(),
            theta: ContextVector::zeros(),
            updates: 0,
        }
    }
}

/// Point-in-time view of a bandit for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditSnapshot {
    pub theta: Vec<f64>,
    pub updates: u64,
    pub confidence: f64,
}

/// Per-expert LinUCB estimator.
#[derive(Debug)]
pub struct LinUcb {
    alpha: f64,
    ridge_epsilon: f64,
    confidence_saturation: u64,
    state: RwLock<BanditState>,
}

impl LinUcb {
    /// Create a bandit with identity covariance and zero reward history.
    pub fn new(config: &BanditConfig) -> Self {
        Self {
            alpha: config.alpha,
            ridge_epsilon: config.ridge_epsilon,
            confidence_saturation: config.confidence_saturation.max(1),
            state: RwLock::new(BanditState::new()),
        }
    }

    /// Upper confidence bound for `context`. Does not mutate state.
    pub fn score(&self, context: &ContextVector) -> f64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mean = state.theta.dot(context);
        let variance = context.dot(&(state.a_inv * context)).max(0.0);
        mean + self.alpha * variance.sqrt()
    }

    /// Fold one observed reward into the estimate.
    ///
    /// Rewards are clamped into [0, 1]. Returns `false` if the update was
    /// discarded because the context was non-finite or the covariance could
    /// not be inverted even after regularization; state is unchanged then.
    pub fn update(&self, context: &ContextVector, reward: f64) -> bool {
        if !context.iter().all(|v| v.is_finite()) {
            warn!("Discarding bandit update with non-finite context");
            return false;
        }
        let reward = clamp01(reward);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let a = state.a + context * context.transpose();
        let b = state.b + context * reward;

        let Some(a_inv) = invert(&a, self.ridge_epsilon) else {
            warn!(
                updates = state.updates,
                "Covariance not invertible after regularization, keeping previous estimate"
            );
            return false;
        };

        state.theta = a_inv * b;
        state.a = a;
        state.a_inv = a_inv;
        state.b = b;
        state.updates += 1;
        true
    }

    /// Confidence in [0, 1], growing linearly with updates until saturation.
    pub fn confidence(&self) -> f64 {
        let updates = self.updates();
        (updates as f64 / self.confidence_saturation as f64).min(1.0)
    }

    /// Number of applied updates.
    pub fn updates(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .updates
    }

    /// Current parameter estimate θ.
    pub fn theta(&self) -> ContextVector {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .theta
    }

    /// Current covariance `A`.
    pub fn covariance(&self) -> CovarianceMatrix {
        self.state.read().unwrap_or_else(PoisonError::into_inner).a
    }

    pub fn snapshot(&self) -> BanditSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        BanditSnapshot {
            theta: state.theta.iter().copied().collect(),
            updates: state.updates,
            confidence: (state.updates as f64 / self.confidence_saturation as f64).min(1.0),
        }
    }
}

/// Invert `a`, falling back to `(a + εI)⁻¹`.
fn invert(a: &CovarianceMatrix, epsilon: f64) -> Option<CovarianceMatrix> {
    let finite = |m: &CovarianceMatrix| m.iter().all(|v| v.is_finite());

    if let Some(inv) = a.try_inverse()
        && finite(&inv)
    {
        return Some(inv);
    }

    let regularized = a + CovarianceMatrix::identity() * epsilon;
    regularized.try_inverse().filter(finite)
}

fn clamp01(r: f64) -> f64 {
    if !r.is_finite() {
        return 0.0;
    }
    r.clamp(0.0, 1.0)
}
