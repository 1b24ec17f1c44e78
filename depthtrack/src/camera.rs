//! # Camera abstraction

use nalgebra as na;

/// Pinhole camera intrinsics.
///
/// Pixel centres lie at integer coordinates, so the top-left pixel covers `[-0.5; 0.5]` on both
/// axis.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Create intrinsics from image size and vertical field-of-view.
    ///
    /// The principal point is placed at the image centre.
    ///
    /// # Arguments
    ///
    /// * `width` - image width in pixels.
    /// * `height` - image height in pixels.
    /// * `fov_y` - vertical field-of-view (in degrees).
    pub fn from_fov(width: usize, height: usize, fov_y: f32) -> Self {
        let f = 0.5 * height as f32 / (fov_y.to_radians() / 2.0).tan();

        Self {
            fx: f,
            fy: f,
            cx: (width as f32 - 1.0) * 0.5,
            cy: (height as f32 - 1.0) * 0.5,
        }
    }

    /// Project a camera-space point into pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, point: &na::Point3<f32>) -> Option<na::Point2<f32>> {
        if point.z <= 0.0 {
            return None;
        }

        let inv_z = 1.0 / point.z;

        Some(na::Point2::new(
            self.fx * point.x * inv_z + self.cx,
            self.fy * point.y * inv_z + self.cy,
        ))
    }

    /// Lift a pixel with known depth back into camera space.
    ///
    /// # Arguments
    ///
    /// * `pixel` - pixel coordinates.
    /// * `depth` - distance along the optical axis.
    pub fn unproject(&self, pixel: na::Point2<f32>, depth: f32) -> na::Point3<f32> {
        na::Point3::new(
            depth * (pixel.x - self.cx) / self.fx,
            depth * (pixel.y - self.cy) / self.fy,
            depth,
        )
    }

    /// Get ray direction (with unit depth) passing through a pixel.
    pub fn ray(&self, pixel: na::Point2<f32>) -> na::Vector3<f32> {
        self.unproject(pixel, 1.0).coords
    }

    /// Intrinsics of an image subsampled by a factor of two.
    ///
    /// Focal lengths are halved, and the principal point is moved so that it stays consistent
    /// with averaging of 2x2 pixel blocks.
    ///
    /// # Examples
    ///
    /// ```
    /// # use assert_approx_eq::assert_approx_eq;
    /// use depthtrack::camera::Intrinsics;
    ///
    /// let k = Intrinsics::new(100.0, 100.0, 63.5, 47.5).half();
    ///
    /// assert_approx_eq!(k.fx, 50.0f32);
    /// assert_approx_eq!(k.cx, 31.5f32);
    /// ```
    pub fn half(&self) -> Self {
        Self {
            fx: self.fx * 0.5,
            fy: self.fy * 0.5,
            cx: (self.cx - 0.5) * 0.5,
            cy: (self.cy - 0.5) * 0.5,
        }
    }

    /// Check whether two sets of intrinsics describe the same camera.
    pub fn is_compatible(&self, other: &Self) -> bool {
        const EPS: f32 = 1e-3;

        (self.fx - other.fx).abs() <= EPS * self.fx.abs().max(1.0)
            && (self.fy - other.fy).abs() <= EPS * self.fy.abs().max(1.0)
            && (self.cx - other.cx).abs() <= EPS * self.cx.abs().max(1.0)
            && (self.cy - other.cy).abs() <= EPS * self.cy.abs().max(1.0)
    }

    /// Check that focal lengths are positive and finite.
    pub fn is_valid(&self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
    }
}
