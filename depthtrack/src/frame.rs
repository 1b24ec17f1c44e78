//! # Tracker inputs
//!
//! A [`Frame`] is the calibrated sensor data of the current timestep, and a [`Prediction`] is the
//! surface of the reconstructed model rendered from the previous pose estimate. Both are owned by
//! the surrounding pipeline; the tracker only reads them.

use crate::camera::Intrinsics;
use crate::image::Image;
use crate::pose::Pose;
use anyhow::{anyhow, bail, Result};
use bytemuck::{Pod, Zeroable};
use nalgebra as na;

/// RGBA colour structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Calibrated depth frame with optional colour.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Depth along the optical axis, in metres. Values `<= 0` (or non-finite) mark missing data.
    pub depth: Image<f32>,
    pub colour: Option<Image<Rgba>>,
    /// Per-pixel sensor reliability in `[0; 1]`.
    pub reliability: Option<Image<f32>>,
    pub intrinsics: Intrinsics,
}

impl Frame {
    pub fn new(depth: Image<f32>, intrinsics: Intrinsics) -> Self {
        Self {
            depth,
            colour: None,
            reliability: None,
            intrinsics,
        }
    }

    /// Attach a colour image of the same size as the depth image.
    pub fn with_colour(mut self, colour: Image<Rgba>) -> Result<Self> {
        if colour.dim() != self.depth.dim() {
            bail!(
                "colour image {:?} does not match depth image {:?}",
                colour.dim(),
                self.depth.dim()
            );
        }
        self.colour = Some(colour);
        Ok(self)
    }

    /// Attach colour from a packed row-major RGBA byte buffer.
    pub fn with_colour_bytes(self, rgba: &[u8]) -> Result<Self> {
        let (w, h) = self.depth.dim();
        let pixels: &[Rgba] = bytemuck::try_cast_slice(rgba)
            .map_err(|e| anyhow!("invalid RGBA buffer: {:?}", e))?;
        let colour = Image::from_vec(w, h, pixels.to_vec())?;
        self.with_colour(colour)
    }

    /// Attach per-pixel depth reliability.
    pub fn with_reliability(mut self, reliability: Image<f32>) -> Result<Self> {
        if reliability.dim() != self.depth.dim() {
            bail!(
                "reliability image {:?} does not match depth image {:?}",
                reliability.dim(),
                self.depth.dim()
            );
        }
        self.reliability = Some(reliability);
        Ok(self)
    }

    pub fn dim(&self) -> (usize, usize) {
        self.depth.dim()
    }

    /// Count depth samples that lie within `(near; far)`.
    pub fn count_valid_depths(&self, (near, far): (f32, f32)) -> usize {
        self.depth
            .as_slice()
            .iter()
            .filter(|&&d| is_valid_depth(d, near, far))
            .count()
    }
}

/// Check whether a depth sample is usable within the given frustum.
pub fn is_valid_depth(depth: f32, near: f32, far: f32) -> bool {
    depth.is_finite() && depth > 0.0 && depth >= near && depth <= far
}

/// A single rendered surface sample of the model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceSample {
    /// Surface point in model coordinates.
    pub point: na::Point3<f32>,
    /// Unit surface normal in model coordinates.
    pub normal: na::Vector3<f32>,
}

/// Rendered point and normal map of the model.
#[derive(Clone, Debug)]
pub struct Prediction {
    pub surface: Image<Option<SurfaceSample>>,
    pub intrinsics: Intrinsics,
    /// Camera-to-model pose the prediction was rendered from.
    pub pose: Pose,
}

impl Prediction {
    pub fn new(surface: Image<Option<SurfaceSample>>, intrinsics: Intrinsics, pose: Pose) -> Self {
        Self {
            surface,
            intrinsics,
            pose,
        }
    }

    /// Create a prediction without a single valid sample.
    pub fn empty(width: usize, height: usize, intrinsics: Intrinsics, pose: Pose) -> Self {
        Self::new(Image::new(width, height, None), intrinsics, pose)
    }

    pub fn dim(&self) -> (usize, usize) {
        self.surface.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.surface.as_slice().iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> Intrinsics {
        Intrinsics::from_fov(4, 2, 60.0)
    }

    #[test]
    fn colour_from_bytes() {
        let frame = Frame::new(Image::new(4, 2, 1.0), intrinsics());
        let bytes = (0..32).map(|v| v as u8).collect::<Vec<_>>();
        let frame = frame.with_colour_bytes(&bytes).unwrap();
        let colour = frame.colour.as_ref().unwrap();

        let rgba = |r, g, b, a| Rgba { r, g, b, a };

        assert_eq!(*colour.get(1, 0), rgba(4, 5, 6, 7));
        assert_eq!(*colour.get(0, 1), rgba(16, 17, 18, 19));
    }

    #[test]
    fn colour_size_mismatch() {
        let frame = Frame::new(Image::new(4, 2, 1.0), intrinsics());
        assert!(frame.clone().with_colour_bytes(&[0u8; 31]).is_err());
        assert!(frame.clone().with_colour_bytes(&[0u8; 16]).is_err());
        assert!(frame.with_reliability(Image::new(2, 2, 1.0)).is_err());
    }

    #[test]
    fn valid_depths() {
        let depth =
            Image::from_vec(4, 2, vec![0.0, -1.0, f32::NAN, 0.5, 1.0, 2.0, 9.0, 3.0]).unwrap();
        let frame = Frame::new(depth, intrinsics());
        assert_eq!(frame.count_valid_depths((0.2, 3.0)), 4);
        assert_eq!(frame.count_valid_depths((0.8, 2.5)), 2);
    }
}
