//! Server-side aggregation strategies.
//!
//! A closed registry maps aggregator names to implementations with a fixed
//! parameter schema per variant; resolution happens once at session start.
//! `combine` itself is pure: no storage, no network, no clocks.

use serde::{Deserialize, Serialize};

use crate::error::{AggregateError, ConfigError};

/// One participant's contribution to a combine step: a delta vector and its
/// sample-count weight. Shard-level partials reuse the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedDelta {
    pub delta: Vec<f32>,
    pub weight: u64,
}

/// Hyperparameters for the server-side Adam strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FedAdamParams {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_tau")]
    pub tau: f32,
}

fn default_learning_rate() -> f32 {
    1e-3
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.99
}

fn default_tau() -> f32 {
    1e-4
}

impl Default for FedAdamParams {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            tau: default_tau(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationMethod {
    /// Sample-count weighted average of client deltas.
    WeightedAverage,
    /// Weighted-average delta treated as a pseudo-gradient fed into a
    /// server-side Adam step (no bias correction).
    FedAdam(FedAdamParams),
}

impl AggregationMethod {
    /// Resolve an aggregator name + params blob from a session config.
    pub fn from_config(name: &str, params: &serde_json::Value) -> Result<Self, ConfigError> {
        match name {
            "fedavg" | "weighted_average" => Ok(Self::WeightedAverage),
            "fedadam" | "fedopt" => {
                let params = if params.is_null() {
                    serde_json::json!({})
                } else {
                    params.clone()
                };
                let p: FedAdamParams = serde_json::from_value(params)
                    .map_err(|e| ConfigError::InvalidParams(e.to_string()))?;
                if !p.learning_rate.is_finite() || p.learning_rate <= 0.0 {
                    return Err(ConfigError::InvalidParams("learning_rate must be positive".into()));
                }
                for (name, beta) in [("beta1", p.beta1), ("beta2", p.beta2)] {
                    if !(0.0..1.0).contains(&beta) {
                        return Err(ConfigError::InvalidParams(format!("{name} must be in [0, 1)")));
                    }
                }
                if !p.tau.is_finite() || p.tau < 0.0 {
                    return Err(ConfigError::InvalidParams("tau must be non-negative".into()));
                }
                Ok(Self::FedAdam(p))
            }
            other => Err(ConfigError::UnknownAggregator(other.to_string())),
        }
    }

    pub fn initial_state(&self) -> AggregatorState {
        match self {
            Self::WeightedAverage => AggregatorState::Stateless,
            Self::FedAdam(_) => AggregatorState::Adam(AdamState::default()),
        }
    }
}

/// Optimizer state carried across rounds. Owned by the session orchestrator,
/// threaded by value through each round's combine.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorState {
    Stateless,
    Adam(AdamState),
}

impl AggregatorState {
    pub fn step(&self) -> u64 {
        match self {
            Self::Stateless => 0,
            Self::Adam(s) => s.t,
        }
    }
}

/// First/second moment estimates and step counter. Moments are sized lazily
/// on the first combine of a session (zero-initialized).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdamState {
    pub m: Vec<f32>,
    pub v: Vec<f32>,
    pub t: u64,
}

/// Reduce a non-empty update set into one delta, evolving the carried state.
///
/// Deterministic and commutative for the weighted average: the result does
/// not depend on submission order.
pub fn combine(
    method: &AggregationMethod,
    updates: &[WeightedDelta],
    prior: AggregatorState,
) -> Result<(Vec<f32>, AggregatorState), AggregateError> {
    let g = weighted_average(updates)?;
    match method {
        AggregationMethod::WeightedAverage => Ok((g, AggregatorState::Stateless)),
        AggregationMethod::FedAdam(p) => {
            let mut st = match prior {
                AggregatorState::Adam(s) => s,
                AggregatorState::Stateless => AdamState::default(),
            };
            if st.m.is_empty() {
                st.m = vec![0.0; g.len()];
                st.v = vec![0.0; g.len()];
            }
            if st.m.len() != g.len() {
                return Err(AggregateError::ShapeMismatch {
                    expected: st.m.len(),
                    got: g.len(),
                });
            }
            st.t += 1;
            let mut delta = Vec::with_capacity(g.len());
            for (i, gi) in g.iter().enumerate() {
                st.m[i] = p.beta1 * st.m[i] + (1.0 - p.beta1) * gi;
                st.v[i] = p.beta2 * st.v[i] + (1.0 - p.beta2) * gi * gi;
                delta.push(p.learning_rate * st.m[i] / (st.v[i].sqrt() + p.tau));
            }
            if !delta.iter().all(|x| x.is_finite()) {
                return Err(AggregateError::NonFinite);
            }
            Ok((delta, AggregatorState::Adam(st)))
        }
    }
}

/// `Σ(wᵢ·Δᵢ) / Σwᵢ`, accumulated in f64.
fn weighted_average(updates: &[WeightedDelta]) -> Result<Vec<f32>, AggregateError> {
    let first = updates.first().ok_or(AggregateError::NoUpdates)?;
    let len = first.delta.len();
    let mut acc = vec![0f64; len];
    let mut total = 0f64;
    for u in updates {
        if u.delta.len() != len {
            return Err(AggregateError::ShapeMismatch {
                expected: len,
                got: u.delta.len(),
            });
        }
        let w = u.weight as f64;
        total += w;
        for (a, d) in acc.iter_mut().zip(&u.delta) {
            *a += w * (*d as f64);
        }
    }
    if total <= 0.0 {
        return Err(AggregateError::NoUpdates);
    }
    let g: Vec<f32> = acc.iter().map(|a| (a / total) as f32).collect();
    if !g.iter().all(|x| x.is_finite()) {
        return Err(AggregateError::NonFinite);
    }
    Ok(g)
}
