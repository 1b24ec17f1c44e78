//! # Gauss-Newton normal equations

use nalgebra as na;
use std::ops::{Add, AddAssign};

/// Weighted 6x6 Gauss-Newton system of a single accumulation pass.
///
/// Values are accumulated in double precision, so that summing partial systems of different rows
/// in a fixed order produces bit-identical results between runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalEquations {
    /// `J^T W J`.
    pub hessian: na::Matrix6<f64>,
    /// `J^T W r`.
    pub gradient: na::Vector6<f64>,
    /// Sum of weighted squared residuals.
    pub residual: f64,
    /// Sum of weights of all accepted correspondences.
    pub weight_sum: f64,
    /// Number of accepted correspondences.
    pub valid: usize,
    /// Number of frame points that had a valid depth sample.
    pub candidates: usize,
}

impl Default for NormalEquations {
    fn default() -> Self {
        Self {
            hessian: na::Matrix6::zeros(),
            gradient: na::Vector6::zeros(),
            residual: 0.0,
            weight_sum: 0.0,
            valid: 0,
            candidates: 0,
        }
    }
}

impl NormalEquations {
    /// Accumulate a single scalar residual row.
    ///
    /// # Arguments
    ///
    /// * `jacobian` - derivative of the residual with respect to the pose twist.
    /// * `residual` - residual value.
    /// * `weight` - robustness weight of the row.
    pub fn add_row(&mut self, jacobian: &na::Vector6<f32>, residual: f32, weight: f32) {
        let j = jacobian.cast::<f64>();
        let r = residual as f64;
        let w = weight as f64;

        self.hessian.ger(w, &j, &j, 1.0);
        self.gradient.axpy(w * r, &j, 1.0);
        self.residual += w * r * r;
    }

    /// Record an accepted correspondence with given weight.
    ///
    /// A correspondence may consist of multiple residual rows (point-to-point), but counts once.
    pub fn add_correspondence(&mut self, weight: f32) {
        self.valid += 1;
        self.weight_sum += weight as f64;
    }

    /// Record a frame point that was considered for association.
    pub fn add_candidate(&mut self) {
        self.candidates += 1;
    }

    /// Mean weighted squared residual of accepted correspondences.
    pub fn mean_residual(&self) -> f64 {
        if self.weight_sum > 0.0 {
            self.residual / self.weight_sum
        } else {
            0.0
        }
    }

    /// Fraction of candidates that got accepted.
    pub fn valid_fraction(&self) -> f32 {
        if self.candidates == 0 {
            0.0
        } else {
            self.valid as f32 / self.candidates as f32
        }
    }

    /// Hessian and gradient divided by the total weight.
    ///
    /// Returns `None` if nothing with positive weight was accumulated.
    pub fn normalised(&self) -> Option<(na::Matrix6<f64>, na::Vector6<f64>)> {
        if self.weight_sum > 0.0 {
            let inv = 1.0 / self.weight_sum;
            Some((self.hessian * inv, self.gradient * inv))
        } else {
            None
        }
    }
}

impl AddAssign for NormalEquations {
    fn add_assign(&mut self, rhs: Self) {
        self.hessian += rhs.hessian;
        self.gradient += rhs.gradient;
        self.residual += rhs.residual;
        self.weight_sum += rhs.weight_sum;
        self.valid += rhs.valid;
        self.candidates += rhs.candidates;
    }
}

impl Add for NormalEquations {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl std::iter::Sum for NormalEquations {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}
