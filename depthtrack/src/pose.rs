//! # Rigid camera pose

use anyhow::{bail, Result};
use nalgebra as na;

/// Incremental pose update in the tangent space.
///
/// The first three components are rotation (axis-angle), the last three are translation.
pub type Twist = na::Vector6<f32>;

const SMALL_ANGLE: f32 = 1e-4;

/// Rigid camera-to-model transform.
///
/// The rotation is stored as a unit quaternion and is renormalised after every composition, so it
/// never drifts away from orthonormality.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    iso: na::Isometry3<f32>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<na::Isometry3<f32>> for Pose {
    fn from(iso: na::Isometry3<f32>) -> Self {
        Self { iso }
    }
}

impl std::ops::Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        let mut iso = self.iso * rhs.iso;
        iso.rotation.renormalize();
        Self { iso }
    }
}

/// Skew-symmetric matrix `[v]x`, such that `[v]x * u = v x u`.
pub fn skew(v: &na::Vector3<f32>) -> na::Matrix3<f32> {
    na::matrix![
        0.0, -v.z, v.y;
        v.z, 0.0, -v.x;
        -v.y, v.x, 0.0
    ]
}

/// Left jacobian of SO(3), mapping twist translation to pose translation.
fn left_jacobian(omega: &na::Vector3<f32>) -> na::Matrix3<f32> {
    let theta = omega.norm();
    let w = skew(omega);
    let w2 = w * w;

    if theta < SMALL_ANGLE {
        na::Matrix3::identity() + w * 0.5 + w2 * (1.0 / 6.0)
    } else {
        let theta2 = theta * theta;
        na::Matrix3::identity()
            + w * ((1.0 - theta.cos()) / theta2)
            + w2 * ((theta - theta.sin()) / (theta2 * theta))
    }
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            iso: na::Isometry3::identity(),
        }
    }

    /// Create a pose from translation and rotation.
    pub fn from_parts(translation: na::Vector3<f32>, rotation: na::UnitQuaternion<f32>) -> Self {
        Self {
            iso: na::Isometry3::from_parts(translation.into(), rotation),
        }
    }

    /// Exponential map of a twist onto SE(3).
    ///
    /// # Arguments
    ///
    /// * `twist` - `[omega; v]` tangent vector.
    pub fn exp(twist: &Twist) -> Self {
        let omega = twist.fixed_rows::<3>(0).into_owned();
        let v = twist.fixed_rows::<3>(3).into_owned();

        let rotation = na::UnitQuaternion::from_scaled_axis(omega);
        let translation = left_jacobian(&omega) * v;

        Self::from_parts(translation, rotation)
    }

    /// Logarithm map of the pose, inverse of [`Pose::exp`].
    pub fn log(&self) -> Twist {
        let omega = self.iso.rotation.scaled_axis();
        let t = self.iso.translation.vector;

        let v = left_jacobian(&omega)
            .try_inverse()
            .map(|inv| inv * t)
            .unwrap_or(t);

        Twist::new(omega.x, omega.y, omega.z, v.x, v.y, v.z)
    }

    /// Apply an incremental update on the left: `exp(delta) * self`.
    ///
    /// # Examples
    ///
    /// ```
    /// use depthtrack::pose::{Pose, Twist};
    /// use nalgebra as na;
    ///
    /// let pose = Pose::from_parts(
    ///     na::Vector3::new(0.1, 0.2, 0.3),
    ///     na::UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
    /// );
    ///
    /// assert!(pose.retract(&Twist::zeros()).distance_to(&pose) < 1e-6);
    /// ```
    pub fn retract(&self, delta: &Twist) -> Self {
        Self::exp(delta) * *self
    }

    pub fn isometry(&self) -> &na::Isometry3<f32> {
        &self.iso
    }

    pub fn rotation(&self) -> &na::UnitQuaternion<f32> {
        &self.iso.rotation
    }

    pub fn translation(&self) -> na::Vector3<f32> {
        self.iso.translation.vector
    }

    pub fn inverse(&self) -> Self {
        Self {
            iso: self.iso.inverse(),
        }
    }

    pub fn transform_point(&self, point: &na::Point3<f32>) -> na::Point3<f32> {
        self.iso.transform_point(point)
    }

    pub fn transform_vector(&self, vector: &na::Vector3<f32>) -> na::Vector3<f32> {
        self.iso.transform_vector(vector)
    }

    /// Get the 4x4 homogeneous matrix of the pose.
    pub fn to_matrix(&self) -> na::Matrix4<f32> {
        self.iso.to_homogeneous()
    }

    /// Create a pose from a 4x4 homogeneous matrix.
    ///
    /// The rotation block is projected onto the closest rotation. Matrices that are not rigid
    /// transforms within a small tolerance are rejected.
    pub fn from_matrix(m: &na::Matrix4<f32>) -> Result<Self> {
        const EPS: f32 = 1e-3;

        if m.iter().any(|v| !v.is_finite()) {
            bail!("pose matrix contains non-finite values");
        }

        let bottom = m.fixed_slice::<1, 4>(3, 0);
        if (bottom - na::RowVector4::new(0.0, 0.0, 0.0, 1.0)).amax() > EPS {
            bail!("pose matrix has an invalid homogeneous row: {}", bottom);
        }

        let r = m.fixed_slice::<3, 3>(0, 0).into_owned();
        if (r.transpose() * r - na::Matrix3::identity()).amax() > EPS || r.determinant() <= 0.0 {
            bail!("pose matrix rotation block is not a rotation");
        }

        let rotation = na::Rotation3::from_matrix(&r);
        let translation = m.fixed_slice::<3, 1>(0, 3).into_owned();

        Ok(Self::from_parts(
            translation,
            na::UnitQuaternion::from_rotation_matrix(&rotation),
        ))
    }

    /// Rotation angle between two poses (in radians).
    pub fn angle_to(&self, other: &Self) -> f32 {
        // atan2 form stays accurate for nearly identical rotations, unlike acos of the scalar.
        let q = self.iso.rotation.rotation_to(&other.iso.rotation);
        let q = q.quaternion();
        2.0 * q.imag().norm().atan2(q.scalar().abs())
    }

    /// Translation distance between two poses.
    pub fn distance_to(&self, other: &Self) -> f32 {
        (self.translation() - other.translation()).norm()
    }
}
