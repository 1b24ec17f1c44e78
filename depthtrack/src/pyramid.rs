//! # Image pyramids
//!
//! Multi-resolution views of the current frame and the model prediction. Level 0 is the input
//! resolution, every next level halves both dimensions by averaging 2x2 blocks of valid samples.
//! Buffers are allocated once and reused for every frame.

use crate::camera::Intrinsics;
use crate::config::TrackerConfig;
use crate::frame::{is_valid_depth, Frame, Prediction, SurfaceSample};
use crate::image::Image;
use anyhow::{bail, Result};
use nalgebra as na;
use rayon::prelude::*;

/// Per-pixel prior reliability in `[0; 1]`.
pub type WeightMap = Image<f32>;

/// Single level of the frame pyramid.
#[derive(Clone, Debug)]
pub struct FrameLevel {
    /// Depth in metres, 0 where invalid.
    pub depth: Image<f32>,
    pub weights: WeightMap,
    /// Depth gradient magnitude (metres per pixel).
    pub gradient: Image<f32>,
    pub intrinsics: Intrinsics,
}

impl FrameLevel {
    fn new(width: usize, height: usize) -> Self {
        Self {
            depth: Image::new(width, height, 0.0),
            weights: Image::new(width, height, 0.0),
            gradient: Image::new(width, height, 0.0),
            intrinsics: Intrinsics::new(1.0, 1.0, 0.0, 0.0),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.depth.dim()
    }

    /// Number of pixels with valid depth.
    pub fn valid_count(&self) -> usize {
        self.depth.as_slice().iter().filter(|&&d| d > 0.0).count()
    }
}

/// Single level of the prediction pyramid.
#[derive(Clone, Debug)]
pub struct PredictionLevel {
    pub surface: Image<Option<SurfaceSample>>,
    pub intrinsics: Intrinsics,
}

impl PredictionLevel {
    fn new(width: usize, height: usize) -> Self {
        Self {
            surface: Image::new(width, height, None),
            intrinsics: Intrinsics::new(1.0, 1.0, 0.0, 0.0),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.surface.dim()
    }

    /// Get the sample nearest to given pixel coordinates.
    pub fn sample(&self, pixel: &na::Point2<f32>) -> Option<&SurfaceSample> {
        if !pixel.x.is_finite() || !pixel.y.is_finite() {
            return None;
        }

        self.surface
            .get_checked(pixel.x.round() as isize, pixel.y.round() as isize)
            .and_then(Option::as_ref)
    }
}

/// Matched frame and prediction pyramids.
#[derive(Clone, Debug)]
pub struct ImagePyramid {
    frame: Vec<FrameLevel>,
    prediction: Vec<PredictionLevel>,
    depth_range: (f32, f32),
    depth_falloff: bool,
}

impl ImagePyramid {
    /// Allocate a pyramid.
    ///
    /// # Arguments
    ///
    /// * `(width, height)` - resolution of the finest level.
    /// * `levels` - number of levels.
    /// * `depth_range` - valid depth range of the frame.
    /// * `depth_falloff` - whether prior weights fall off with depth.
    pub fn new(
        (width, height): (usize, usize),
        levels: usize,
        depth_range: (f32, f32),
        depth_falloff: bool,
    ) -> Result<Self> {
        if levels == 0 {
            bail!("pyramid needs at least 1 level");
        }

        if (width >> (levels - 1)) == 0 || (height >> (levels - 1)) == 0 {
            bail!(
                "{}x{} image is too small for {} levels",
                width,
                height,
                levels
            );
        }

        let (near, far) = depth_range;
        if !(near >= 0.0 && far > near) {
            bail!("invalid depth range ({}; {})", near, far);
        }

        let dims = (0..levels).map(|l| (width >> l, height >> l));

        Ok(Self {
            frame: dims.clone().map(|(w, h)| FrameLevel::new(w, h)).collect(),
            prediction: dims.map(|(w, h)| PredictionLevel::new(w, h)).collect(),
            depth_range,
            depth_falloff,
        })
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        Self::new(
            config.image_size,
            config.levels.len(),
            config.depth_range,
            config.depth_falloff,
        )
    }

    pub fn num_levels(&self) -> usize {
        self.frame.len()
    }

    pub fn frame_level(&self, level: usize) -> &FrameLevel {
        &self.frame[level]
    }

    pub fn prediction_level(&self, level: usize) -> &PredictionLevel {
        &self.prediction[level]
    }

    /// Check that inputs fit into the pyramid.
    pub fn check_inputs(&self, frame: &Frame, prediction: &Prediction) -> Result<()> {
        let dim = self.frame[0].dim();

        if frame.dim() != dim {
            bail!("frame size {:?} does not match {:?}", frame.dim(), dim);
        }

        let size = prediction.dim();
        if size != dim {
            bail!("prediction size {:?} does not match {:?}", size, dim);
        }

        if let Some(reliability) = &frame.reliability {
            let size = reliability.dim();
            if size != dim {
                bail!("reliability size {:?} does not match {:?}", size, dim);
            }
        }

        if let Some(colour) = &frame.colour {
            if colour.dim() != dim {
                bail!("colour size {:?} does not match {:?}", colour.dim(), dim);
            }
        }

        if !frame.intrinsics.is_valid() {
            bail!("invalid frame intrinsics {:?}", frame.intrinsics);
        }

        if !frame.intrinsics.is_compatible(&prediction.intrinsics) {
            bail!(
                "prediction intrinsics {:?} differ from frame intrinsics {:?}",
                prediction.intrinsics,
                frame.intrinsics
            );
        }

        Ok(())
    }

    /// Fill all levels from the inputs.
    pub fn build(&mut self, frame: &Frame, prediction: &Prediction) -> Result<()> {
        self.check_inputs(frame, prediction)?;

        self.build_frame_base(frame);
        self.prediction[0]
            .surface
            .as_mut_slice()
            .copy_from_slice(prediction.surface.as_slice());
        self.prediction[0].intrinsics = prediction.intrinsics;

        for l in 1..self.num_levels() {
            let (fine, coarse) = self.frame.split_at_mut(l);
            downsample_frame(&fine[l - 1], &mut coarse[0]);

            let (fine, coarse) = self.prediction.split_at_mut(l);
            downsample_prediction(&fine[l - 1], &mut coarse[0]);
        }

        for level in &mut self.frame {
            compute_gradient(&level.depth, &mut level.gradient);
        }

        Ok(())
    }

    fn build_frame_base(&mut self, frame: &Frame) {
        let (near, far) = self.depth_range;
        let falloff = self.depth_falloff;
        let level = &mut self.frame[0];
        let width = level.depth.width();

        level.intrinsics = frame.intrinsics;

        level
            .depth
            .as_mut_slice()
            .par_chunks_mut(width)
            .zip(level.weights.as_mut_slice().par_chunks_mut(width))
            .enumerate()
            .for_each(|(y, (depth_row, weight_row))| {
                let src = frame.depth.row(y);
                let reliability = frame.reliability.as_ref().map(|r| r.row(y));

                for x in 0..width {
                    let d = src[x];

                    if !is_valid_depth(d, near, far) {
                        depth_row[x] = 0.0;
                        weight_row[x] = 0.0;
                        continue;
                    }

                    let mut w = reliability
                        .map(|r| r[x])
                        .filter(|r| r.is_finite())
                        .map(|r| r.clamp(0.0, 1.0))
                        .unwrap_or(1.0);

                    if falloff {
                        w *= depth_falloff(d, near, far);
                    }

                    depth_row[x] = d;
                    weight_row[x] = w;
                }
            });
    }
}

/// Prior weight of a depth sample, falling off quadratically from the near to the far plane.
///
/// # Examples
///
/// ```
/// # use assert_approx_eq::assert_approx_eq;
/// use depthtrack::pyramid::depth_falloff;
///
/// assert_approx_eq!(depth_falloff(0.5, 0.5, 2.5), 1.0);
/// assert_approx_eq!(depth_falloff(1.5, 0.5, 2.5), 0.25);
/// ```
pub fn depth_falloff(depth: f32, near: f32, far: f32) -> f32 {
    let t = ((depth - near) / (far - near)).clamp(0.0, 1.0);
    (1.0 - t) * (1.0 - t)
}

fn downsample_frame(src: &FrameLevel, dst: &mut FrameLevel) {
    let width = dst.depth.width();

    dst.intrinsics = src.intrinsics.half();

    dst.depth
        .as_mut_slice()
        .par_chunks_mut(width)
        .zip(dst.weights.as_mut_slice().par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (depth_row, weight_row))| {
            for x in 0..width {
                let (mut d_sum, mut w_sum, mut cnt) = (0.0, 0.0, 0);

                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (sx, sy) = (2 * x + dx, 2 * y + dy);
                    let d = *src.depth.get(sx, sy);
                    if d > 0.0 {
                        d_sum += d;
                        w_sum += *src.weights.get(sx, sy);
                        cnt += 1;
                    }
                }

                if cnt > 0 {
                    depth_row[x] = d_sum / cnt as f32;
                    weight_row[x] = w_sum / cnt as f32;
                } else {
                    depth_row[x] = 0.0;
                    weight_row[x] = 0.0;
                }
            }
        });
}

fn downsample_prediction(src: &PredictionLevel, dst: &mut PredictionLevel) {
    let width = dst.surface.width();

    dst.intrinsics = src.intrinsics.half();

    dst.surface
        .as_mut_slice()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut point = na::Vector3::zeros();
                let mut normal = na::Vector3::zeros();
                let mut cnt = 0;

                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    if let Some(s) = src.surface.get(2 * x + dx, 2 * y + dy) {
                        point += s.point.coords;
                        normal += s.normal;
                        cnt += 1;
                    }
                }

                *out = if cnt > 0 {
                    normal
                        .try_normalize(1e-6)
                        .map(|normal| SurfaceSample {
                            point: (point / cnt as f32).into(),
                            normal,
                        })
                } else {
                    None
                };
            }
        });
}

fn compute_gradient(depth: &Image<f32>, gradient: &mut Image<f32>) {
    let width = depth.width();

    let derivative = |a: Option<f32>, c: f32, b: Option<f32>| match (a, b) {
        (Some(a), Some(b)) => (b - a) * 0.5,
        (Some(a), None) => c - a,
        (None, Some(b)) => b - c,
        (None, None) => 0.0,
    };

    let valid = |x: isize, y: isize| depth.get_checked(x, y).copied().filter(|&d| d > 0.0);

    gradient
        .as_mut_slice()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as isize;
            for (x, out) in row.iter_mut().enumerate() {
                let x = x as isize;
                let c = *depth.get(x as usize, y as usize);

                *out = if c > 0.0 {
                    let gx = derivative(valid(x - 1, y), c, valid(x + 1, y));
                    let gy = derivative(valid(x, y - 1), c, valid(x, y + 1));
                    (gx * gx + gy * gy).sqrt()
                } else {
                    0.0
                };
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Pose;
    use assert_approx_eq::assert_approx_eq;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(40.0, 40.0, 7.5, 5.5)
    }

    fn flat_inputs(depth: f32) -> (Frame, Prediction) {
        let k = intrinsics();
        let frame = Frame::new(Image::new(16, 12, depth), k);
        let grid = Image::new(16, 12, ());
        let surface = Image::from_vec(
            16,
            12,
            grid.iter()
                .map(|(x, y, _)| {
                    Some(SurfaceSample {
                        point: k.unproject(na::Point2::new(x as f32, y as f32), depth),
                        normal: na::Vector3::new(0.0, 0.0, -1.0),
                    })
                })
                .collect(),
        )
        .unwrap();
        (frame, Prediction::new(surface, k, Pose::identity()))
    }

    #[test]
    fn rejects_bad_setup() {
        assert!(ImagePyramid::new((16, 12), 0, (0.1, 3.0), false).is_err());
        assert!(ImagePyramid::new((16, 12), 5, (0.1, 3.0), false).is_err());
        assert!(ImagePyramid::new((16, 12), 2, (3.0, 3.0), false).is_err());

        let mut pyramid = ImagePyramid::new((16, 12), 3, (0.1, 3.0), false).unwrap();
        let (frame, prediction) = flat_inputs(1.0);

        let small = Frame::new(Image::new(8, 6, 1.0), intrinsics());
        assert!(pyramid.build(&small, &prediction).is_err());

        let mut other = prediction.clone();
        other.intrinsics = intrinsics().half();
        assert!(pyramid.build(&frame, &other).is_err());

        assert!(pyramid.build(&frame, &prediction).is_ok());
    }

    #[test]
    fn rejects_mismatched_frame_layers() {
        let mut pyramid = ImagePyramid::new((16, 12), 3, (0.1, 3.0), false).unwrap();
        let (frame, prediction) = flat_inputs(1.0);

        // Layers assigned directly bypass the checks of the frame builders.
        let mut unreliable = frame.clone();
        unreliable.reliability = Some(Image::new(10, 10, 1.0));
        assert!(pyramid.check_inputs(&unreliable, &prediction).is_err());
        assert!(pyramid.build(&unreliable, &prediction).is_err());

        let mut coloured = frame.clone();
        coloured.colour = Some(Image::new(16, 11, Default::default()));
        assert!(pyramid.build(&coloured, &prediction).is_err());

        let matching = frame
            .with_reliability(Image::new(16, 12, 0.5))
            .unwrap()
            .with_colour(Image::new(16, 12, Default::default()))
            .unwrap();
        assert!(pyramid.build(&matching, &prediction).is_ok());
        assert_eq!(*pyramid.frame_level(0).weights.get(3, 3), 0.5);
    }

    #[test]
    fn level_sizes_and_intrinsics() {
        let mut pyramid = ImagePyramid::new((16, 12), 3, (0.1, 3.0), false).unwrap();
        let (frame, prediction) = flat_inputs(1.0);
        pyramid.build(&frame, &prediction).unwrap();

        assert_eq!(pyramid.frame_level(1).dim(), (8, 6));
        assert_eq!(pyramid.prediction_level(2).dim(), (4, 3));
        let quarter = intrinsics().half().half();
        assert_eq!(pyramid.frame_level(2).intrinsics, quarter);
        assert_eq!(pyramid.prediction_level(2).intrinsics, quarter);

        // Coarse prediction samples still project onto their own pixels.
        let level = pyramid.prediction_level(2);
        for (x, y, s) in level.surface.iter() {
            let s = s.unwrap();
            let px = level.intrinsics.project(&s.point).unwrap();
            assert_approx_eq!(px.x, x as f32, 1e-3);
            assert_approx_eq!(px.y, y as f32, 1e-3);
            assert_approx_eq!(s.normal.z, -1.0);
        }
    }

    #[test]
    fn invalid_samples_are_excluded() {
        let mut pyramid = ImagePyramid::new((16, 12), 2, (0.1, 3.0), false).unwrap();
        let (mut frame, mut prediction) = flat_inputs(2.0);

        frame.depth.set(0, 0, 0.0);
        frame.depth.set(1, 0, -1.0);
        frame.depth.set(0, 1, 50.0);
        frame.depth.set(2, 0, 0.0);
        frame.depth.set(3, 0, 0.0);
        frame.depth.set(2, 1, 0.0);
        frame.depth.set(3, 1, 0.0);
        prediction.surface.set(0, 0, None);

        pyramid.build(&frame, &prediction).unwrap();

        let fine = pyramid.frame_level(0);
        assert_eq!(*fine.depth.get(0, 1), 0.0);
        assert_eq!(*fine.weights.get(1, 0), 0.0);
        assert_eq!(*fine.weights.get(1, 1), 1.0);

        let coarse = pyramid.frame_level(1);
        assert_eq!(*coarse.depth.get(0, 0), 2.0);
        assert_eq!(*coarse.weights.get(0, 0), 1.0);
        assert_eq!(*coarse.depth.get(1, 0), 0.0);
        assert_eq!(coarse.valid_count(), 8 * 6 - 1);

        assert!(pyramid.prediction_level(1).surface.get(0, 0).is_some());
    }

    #[test]
    fn weights_from_reliability_and_falloff() {
        let mut pyramid = ImagePyramid::new((16, 12), 1, (0.5, 2.5), true).unwrap();
        let (frame, prediction) = flat_inputs(1.5);
        let frame = frame.with_reliability(Image::new(16, 12, 0.5)).unwrap();

        pyramid.build(&frame, &prediction).unwrap();

        assert_approx_eq!(*pyramid.frame_level(0).weights.get(3, 3), 0.125);
    }

    #[test]
    fn gradient_of_slope() {
        let mut pyramid = ImagePyramid::new((16, 12), 1, (0.1, 3.0), false).unwrap();
        let (mut frame, prediction) = flat_inputs(1.0);

        for y in 0..12 {
            for x in 0..16 {
                frame.depth.set(x, y, 1.0 + x as f32 * 0.01);
            }
        }

        pyramid.build(&frame, &prediction).unwrap();

        let level = pyramid.frame_level(0);
        assert_approx_eq!(*level.gradient.get(5, 5), 0.01, 1e-5);
        assert_approx_eq!(*level.gradient.get(0, 0), 0.01, 1e-5);
    }

    #[test]
    fn nearest_sample() {
        let mut pyramid = ImagePyramid::new((16, 12), 1, (0.1, 3.0), false).unwrap();
        let (frame, prediction) = flat_inputs(1.0);
        pyramid.build(&frame, &prediction).unwrap();

        let level = pyramid.prediction_level(0);
        let expected = *prediction.surface.get(3, 4);
        assert_eq!(level.sample(&na::Point2::new(3.4, 3.6)).copied(), expected);
        assert!(level.sample(&na::Point2::new(-0.6, 0.0)).is_none());
        assert!(level.sample(&na::Point2::new(15.6, 0.0)).is_none());
        assert!(level.sample(&na::Point2::new(f32::NAN, 0.0)).is_none());
    }
}
