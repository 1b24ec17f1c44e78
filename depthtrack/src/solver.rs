//! # Damped pose update solver

use crate::config::IterationType;
use crate::normal_equations::NormalEquations;
use crate::pose::Twist;
use anyhow::{bail, Result};
use log::*;
use nalgebra as na;

/// Smallest accepted ratio between the squared smallest and largest Cholesky pivots.
const MIN_PIVOT_RATIO: f64 = 1e-12;

/// Damping schedule for near-singular systems.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SolverConfig {
    /// First damping factor, relative to the mean diagonal of the system.
    pub initial_damping: f64,
    /// Multiplier applied to damping after each failed attempt.
    pub damping_factor: f64,
    /// Damping at which the system is declared singular.
    pub max_damping: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            initial_damping: 1e-6,
            damping_factor: 10.0,
            max_damping: 1e3,
        }
    }
}

impl SolverConfig {
    pub fn initial_damping(self, initial_damping: f64) -> Self {
        Self {
            initial_damping,
            ..self
        }
    }

    pub fn max_damping(self, max_damping: f64) -> Self {
        Self {
            max_damping,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial_damping > 0.0) {
            bail!("initial damping must be positive");
        }

        if !(self.damping_factor > 1.0) {
            bail!("damping factor must be greater than 1");
        }

        if !(self.max_damping >= self.initial_damping) {
            bail!("maximum damping must not be below initial damping");
        }

        Ok(())
    }
}

/// Solved pose increment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Step {
    pub delta: Twist,
    /// Relative damping that was needed to solve the system (0 if none).
    pub damping: f64,
}

fn try_cholesky(h: &na::Matrix6<f64>, g: &na::Vector6<f64>) -> Option<na::Vector6<f64>> {
    let chol = na::Cholesky::new(*h)?;

    let diag = chol.l_dirty().diagonal();
    let (min, max) = diag
        .iter()
        .fold((f64::INFINITY, 0.0f64), |(min, max), &d| {
            (min.min(d), max.max(d))
        });

    if !(min * min >= max * max * MIN_PIVOT_RATIO) {
        return None;
    }

    let delta = chol.solve(&-g);

    if delta.iter().all(|v| v.is_finite()) {
        Some(delta)
    } else {
        None
    }
}

/// Solve `H * delta = -g` within the active pose subspace.
///
/// The system is normalised by the total correspondence weight. Inactive twist components are
/// pinned to zero. If the system can not be factorised, the diagonal is progressively inflated
/// until it can be, or the damping ceiling is hit.
///
/// Returns `None` if the system is empty or singular.
///
/// # Arguments
///
/// * `eq` - accumulated normal equations.
/// * `iteration_type` - active pose subspace.
/// * `config` - damping schedule.
pub fn solve(
    eq: &NormalEquations,
    iteration_type: IterationType,
    config: &SolverConfig,
) -> Option<Step> {
    let mask = iteration_type.mask();

    if !mask.iter().any(|&m| m) {
        return None;
    }

    let (mut h, mut g) = eq.normalised()?;

    if h.iter().chain(g.iter()).any(|v| !v.is_finite()) {
        return None;
    }

    for (i, _) in mask.iter().enumerate().filter(|(_, &m)| !m) {
        h.row_mut(i).fill(0.0);
        h.column_mut(i).fill(0.0);
        h[(i, i)] = 1.0;
        g[i] = 0.0;
    }

    let to_step = |delta: na::Vector6<f64>, damping| Step {
        delta: delta.cast::<f32>(),
        damping,
    };

    if let Some(delta) = try_cholesky(&h, &g) {
        return Some(to_step(delta, 0.0));
    }

    let active = mask.iter().filter(|&&m| m).count() as f64;
    let mean_diag = mask
        .iter()
        .enumerate()
        .filter(|(_, &m)| m)
        .map(|(i, _)| h[(i, i)].abs())
        .sum::<f64>()
        / active;
    let scale = if mean_diag > 0.0 { mean_diag } else { 1.0 };

    let mut damping = config.initial_damping;

    while damping <= config.max_damping {
        let mut damped = h;

        for (i, _) in mask.iter().enumerate().filter(|(_, &m)| m) {
            damped[(i, i)] += damping * scale;
        }

        if let Some(delta) = try_cholesky(&damped, &g) {
            debug!("Solved with damping {:e}", damping);
            return Some(to_step(delta, damping));
        }

        damping *= config.damping_factor;
    }

    warn!("Damping ceiling {:e} reached", config.max_damping);

    None
}
