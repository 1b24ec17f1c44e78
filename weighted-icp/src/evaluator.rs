//! # Point-to-model residuals

use depthtrack::pose::skew;
use depthtrack::prelude::v1::*;
use nalgebra as na;

/// Scalar residual with its derivative with respect to the pose twist.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResidualRow {
    pub jacobian: na::Vector6<f32>,
    pub residual: f32,
}

/// Residual formulation of a single correspondence.
///
/// Derivatives are taken with respect to a twist `delta` applied on the left of the current
/// pose, so that the frame point `q` in model coordinates moves as `exp(delta) * q`.
pub trait PointEvaluator: Send + Sync {
    type Rows: AsRef<[ResidualRow]>;

    /// Evaluate residual rows of a correspondence.
    ///
    /// # Arguments
    ///
    /// * `point` - frame point, transformed into model coordinates.
    /// * `sample` - corresponding model surface sample.
    fn evaluate(&self, point: &na::Point3<f32>, sample: &SurfaceSample) -> Self::Rows;
}

/// Distance of the point to the tangent plane of the sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct PointToPlane;

impl PointEvaluator for PointToPlane {
    type Rows = [ResidualRow; 1];

    fn evaluate(&self, point: &na::Point3<f32>, sample: &SurfaceSample) -> Self::Rows {
        let n = sample.normal;
        let q = point.coords;

        let rot = q.cross(&n);

        [ResidualRow {
            jacobian: na::Vector6::new(rot.x, rot.y, rot.z, n.x, n.y, n.z),
            residual: n.dot(&(point - sample.point)),
        }]
    }
}

/// Full 3D offset between the point and the sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct PointToPoint;

impl PointEvaluator for PointToPoint {
    type Rows = [ResidualRow; 3];

    fn evaluate(&self, point: &na::Point3<f32>, sample: &SurfaceSample) -> Self::Rows {
        let diff = point - sample.point;
        let rot = -skew(&point.coords);

        let row = |i: usize| {
            let mut jacobian = na::Vector6::zeros();
            jacobian
                .fixed_rows_mut::<3>(0)
                .copy_from(&rot.row(i).transpose());
            jacobian[3 + i] = 1.0;
            ResidualRow {
                jacobian,
                residual: diff[i],
            }
        };

        [row(0), row(1), row(2)]
    }
}
