//! # Parallel normal equation accumulation

use crate::evaluator::PointEvaluator;
use depthtrack::prelude::v1::*;
use nalgebra as na;
use rayon::prelude::*;

/// Everything needed to evaluate a single pyramid level.
pub struct LevelInputs<'a> {
    pub frame: &'a FrameLevel,
    pub prediction: &'a PredictionLevel,
    /// Camera-to-model pose the prediction was rendered from.
    pub render_pose: &'a Pose,
    /// Maximum euclidean distance between corresponding points.
    pub distance_threshold: f32,
    /// Correspondences weighted below this are rejected.
    pub min_weight: f32,
    pub weighting: Option<&'a dyn CorrespondenceWeight>,
}

/// Accepted correspondence of a frame point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence {
    /// Frame point in model coordinates.
    pub point: na::Point3<f32>,
    pub sample: SurfaceSample,
    pub weight: f32,
}

impl<'a> LevelInputs<'a> {
    /// Find the correspondence of a single frame pixel.
    ///
    /// # Arguments
    ///
    /// * `x`, `y` - pixel of the frame level.
    /// * `pose` - current camera-to-model estimate.
    /// * `to_render` - model-to-render-camera transform.
    pub fn associate(
        &self,
        x: usize,
        y: usize,
        pose: &Pose,
        to_render: &Pose,
    ) -> Option<Correspondence> {
        let depth = *self.frame.depth.get(x, y);

        if depth <= 0.0 {
            return None;
        }

        let local = self
            .frame
            .intrinsics
            .unproject(na::Point2::new(x as f32, y as f32), depth);
        let point = pose.transform_point(&local);

        let pixel = self
            .prediction
            .intrinsics
            .project(&to_render.transform_point(&point))?;
        let sample = *self.prediction.sample(&pixel)?;

        let offset = point - sample.point;
        let distance = offset.norm();

        // Reject, never clamp. NaN distances are rejected as well.
        if !(distance <= self.distance_threshold) {
            return None;
        }

        let prior = *self.frame.weights.get(x, y);

        let learned = self
            .weighting
            .map(|w| {
                w.weight(&PointFeatures {
                    residual: sample.normal.dot(&offset).abs(),
                    distance,
                    depth,
                    gradient: *self.frame.gradient.get(x, y),
                })
            })
            .unwrap_or(1.0);

        let weight = prior * learned;

        if !weight.is_finite() || weight < self.min_weight {
            return None;
        }

        Some(Correspondence {
            point,
            sample,
            weight,
        })
    }

    /// Accumulate a single row of the level.
    fn accumulate_row<E: PointEvaluator>(
        &self,
        evaluator: &E,
        y: usize,
        pose: &Pose,
        to_render: &Pose,
    ) -> NormalEquations {
        let mut eq = NormalEquations::default();

        for x in 0..self.frame.depth.width() {
            if *self.frame.depth.get(x, y) <= 0.0 {
                continue;
            }

            eq.add_candidate();

            if let Some(c) = self.associate(x, y, pose, to_render) {
                for row in evaluator.evaluate(&c.point, &c.sample).as_ref() {
                    eq.add_row(&row.jacobian, row.residual, c.weight);
                }
                eq.add_correspondence(c.weight);
            }
        }

        eq
    }
}

/// Evaluate every frame pixel of a level and build the normal equations.
///
/// Rows are evaluated in parallel, and their partial systems are summed in row order, therefore
/// the result does not depend on thread scheduling.
///
/// # Arguments
///
/// * `evaluator` - residual formulation.
/// * `inputs` - level data.
/// * `pose` - camera-to-model pose to evaluate at.
pub fn accumulate<E: PointEvaluator>(
    evaluator: &E,
    inputs: &LevelInputs,
    pose: &Pose,
) -> NormalEquations {
    let to_render = inputs.render_pose.inverse();
    let (_, height) = inputs.frame.dim();

    let rows = (0..height)
        .into_par_iter()
        .map(|y| inputs.accumulate_row(evaluator, y, pose, &to_render))
        .collect::<Vec<_>>();

    rows.into_iter().sum()
}

/// Count accepted correspondences of a level without building the system.
pub fn count_correspondences(inputs: &LevelInputs, pose: &Pose) -> usize {
    let to_render = inputs.render_pose.inverse();
    let (width, height) = inputs.frame.dim();

    (0..height)
        .into_par_iter()
        .map(|y| {
            (0..width)
                .filter(|&x| inputs.associate(x, y, pose, &to_render).is_some())
                .count()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{PointToPlane, PointToPoint};
    use assert_approx_eq::assert_approx_eq;
    use depthtrack::synthetic::{add_depth_noise, SyntheticScene};
    use rand::SeedableRng;

    const SIZE: (usize, usize) = (160, 120);

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(120.0, 120.0, 79.5, 59.5)
    }

    fn pyramid(frame: &Frame, prediction: &Prediction) -> ImagePyramid {
        let mut pyramid = ImagePyramid::new(SIZE, 1, (0.2, 3.0), false).unwrap();
        pyramid.build(frame, prediction).unwrap();
        pyramid
    }

    fn inputs<'a>(
        pyramid: &'a ImagePyramid,
        render_pose: &'a Pose,
        distance_threshold: f32,
    ) -> LevelInputs<'a> {
        LevelInputs {
            frame: pyramid.frame_level(0),
            prediction: pyramid.prediction_level(0),
            render_pose,
            distance_threshold,
            min_weight: 0.0,
            weighting: None,
        }
    }

    fn noisy_room(pose: &Pose) -> (Frame, Prediction) {
        let scene = SyntheticScene::room();
        let mut frame = scene.render_frame(&intrinsics(), SIZE, pose);
        add_depth_noise(&mut frame, 0.005, &mut rand::rngs::StdRng::seed_from_u64(5));
        let prediction = scene.render_prediction(&intrinsics(), SIZE, &Pose::identity());
        (frame, prediction)
    }

    /// Plain sequential unweighted ICP accumulation.
    fn reference(
        frame: &Frame,
        prediction: &Prediction,
        pose: &Pose,
        threshold: f32,
    ) -> NormalEquations {
        let mut eq = NormalEquations::default();
        let k = frame.intrinsics;

        for (x, y, &d) in frame.depth.iter() {
            if !(d >= 0.2 && d <= 3.0) {
                continue;
            }
            eq.add_candidate();

            let q = pose.transform_point(&k.unproject(na::Point2::new(x as f32, y as f32), d));
            let px = match k.project(&prediction.pose.inverse().transform_point(&q)) {
                Some(px) => px,
                None => continue,
            };
            let s = match prediction
                .surface
                .get_checked(px.x.round() as isize, px.y.round() as isize)
            {
                Some(Some(s)) => *s,
                _ => continue,
            };

            if (q - s.point).norm() > threshold {
                continue;
            }

            let r = s.normal.dot(&(q - s.point));
            let c = q.coords.cross(&s.normal);
            let j = na::Vector6::new(c.x, c.y, c.z, s.normal.x, s.normal.y, s.normal.z);
            eq.add_row(&j, r, 1.0);
            eq.add_correspondence(1.0);
        }

        eq
    }

    #[test]
    fn uniform_weighting_matches_plain_icp() {
        let truth = Pose::exp(&Twist::new(0.01, -0.02, 0.005, 0.02, 0.01, -0.01));
        let (frame, prediction) = noisy_room(&truth);
        let pyramid = pyramid(&frame, &prediction);
        let render = prediction.pose;

        let identity = Pose::identity();
        let level = inputs(&pyramid, &render, 0.1);
        let eq = accumulate(&PointToPlane, &level, &identity);
        let expected = reference(&frame, &prediction, &identity, 0.1);

        assert_eq!(eq.valid, expected.valid);
        assert_eq!(eq.candidates, expected.candidates);
        let tolerance = 1e-6 * expected.hessian.amax();
        assert!((eq.hessian - expected.hessian).amax() < tolerance);
        assert!((eq.gradient - expected.gradient).amax() < tolerance);
        assert_approx_eq!(eq.residual, expected.residual, 1e-6 * expected.residual);
    }

    #[test]
    fn deterministic() {
        let truth = Pose::exp(&Twist::new(0.0, 0.03, 0.0, 0.05, 0.0, 0.0));
        let (frame, prediction) = noisy_room(&truth);
        let pyramid = pyramid(&frame, &prediction);
        let render = prediction.pose;
        let inputs = inputs(&pyramid, &render, 0.1);

        let a = accumulate(&PointToPoint, &inputs, &Pose::identity());
        let b = accumulate(&PointToPoint, &inputs, &Pose::identity());

        assert_eq!(a, b);
    }

    #[test]
    fn tighter_threshold_never_accepts_more() {
        let truth = Pose::exp(&Twist::new(0.02, -0.03, 0.01, 0.04, -0.02, 0.03));
        let (frame, prediction) = noisy_room(&truth);
        let pyramid = pyramid(&frame, &prediction);
        let render = prediction.pose;

        let mut prev = usize::MAX;

        for threshold in [0.5, 0.2, 0.1, 0.05, 0.02, 0.01, 0.005, 0.001] {
            let inputs = inputs(&pyramid, &render, threshold);
            let count = count_correspondences(&inputs, &Pose::identity());
            let eq = accumulate(&PointToPlane, &inputs, &Pose::identity());

            assert_eq!(count, eq.valid);
            assert!(count <= prev, "{} > {} at {}", count, prev, threshold);
            prev = count;
        }

        assert!(prev < frame.count_valid_depths((0.2, 3.0)));
    }

    struct Constant(f32);

    impl CorrespondenceWeight for Constant {
        fn weight(&self, _: &PointFeatures) -> f32 {
            self.0
        }
    }

    #[test]
    fn weights_and_cutoff() {
        let (frame, prediction) = noisy_room(&Pose::identity());
        let pyramid = pyramid(&frame, &prediction);
        let render = prediction.pose;

        let identity = Pose::identity();
        let plain = accumulate(&PointToPlane, &inputs(&pyramid, &render, 0.1), &identity);

        let half = Constant(0.5);
        let mut weighted = inputs(&pyramid, &render, 0.1);
        weighted.weighting = Some(&half);
        let eq = accumulate(&PointToPlane, &weighted, &identity);

        assert_eq!(eq.valid, plain.valid);
        let expected = plain.weight_sum * 0.5;
        assert_approx_eq!(eq.weight_sum, expected, 1e-6 * plain.weight_sum);
        let tolerance = 1e-6 * plain.hessian.amax();
        assert!((eq.hessian * 2.0 - plain.hessian).amax() < tolerance);

        // Zero weight stays valid unless it falls below the cutoff.
        let zero = Constant(0.0);
        weighted.weighting = Some(&zero);
        let eq = accumulate(&PointToPlane, &weighted, &identity);
        assert_eq!(eq.valid, plain.valid);
        assert_eq!(eq.weight_sum, 0.0);

        weighted.min_weight = 0.6;
        weighted.weighting = Some(&half);
        let eq = accumulate(&PointToPlane, &weighted, &identity);
        assert_eq!(eq.valid, 0);
        assert_eq!(eq.candidates, plain.candidates);
    }

    #[test]
    fn empty_prediction() {
        let frame =
            SyntheticScene::flat_wall(1.0).render_frame(&intrinsics(), SIZE, &Pose::identity());
        let prediction = Prediction::empty(SIZE.0, SIZE.1, intrinsics(), Pose::identity());
        let pyramid = pyramid(&frame, &prediction);
        let render = prediction.pose;

        let level = inputs(&pyramid, &render, 0.1);
        let eq = accumulate(&PointToPlane, &level, &Pose::identity());

        assert_eq!(eq.valid, 0);
        assert_eq!(eq.candidates, SIZE.0 * SIZE.1);
    }
}
