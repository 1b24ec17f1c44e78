//! # Synthetic scenes
//!
//! Ray-cast scenes made of planes and boxes. They produce depth frames and model predictions that
//! are exactly consistent with each other for any camera pose, which makes tracker behaviour
//! testable against known ground truth.

use crate::camera::Intrinsics;
use crate::frame::{Frame, Prediction, SurfaceSample};
use crate::image::Image;
use crate::pose::Pose;
use nalgebra as na;
use rand::Rng;
use rayon::prelude::*;

const MIN_T: f32 = 1e-4;

/// Single primitive of a scene, in model coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Shape {
    /// Infinite plane of points `p` where `normal . p = offset`.
    Plane {
        normal: na::Vector3<f32>,
        offset: f32,
    },
    /// Axis aligned solid box.
    Cuboid {
        min: na::Point3<f32>,
        max: na::Point3<f32>,
    },
}

impl Shape {
    /// Intersect a ray with the shape.
    ///
    /// Returns distance along the ray and the surface normal.
    fn intersect(
        &self,
        origin: &na::Point3<f32>,
        dir: &na::Vector3<f32>,
    ) -> Option<(f32, na::Vector3<f32>)> {
        match self {
            Self::Plane { normal, offset } => {
                let denom = normal.dot(dir);
                if denom.abs() < 1e-9 {
                    return None;
                }
                let t = (offset - normal.dot(&origin.coords)) / denom;
                (t > MIN_T).then(|| (t, *normal))
            }
            Self::Cuboid { min, max } => {
                let (mut t_near, mut t_far) = (f32::NEG_INFINITY, f32::INFINITY);
                let mut axis = 0;

                for i in 0..3 {
                    if dir[i].abs() < 1e-9 {
                        if origin[i] < min[i] || origin[i] > max[i] {
                            return None;
                        }
                        continue;
                    }

                    let t1 = (min[i] - origin[i]) / dir[i];
                    let t2 = (max[i] - origin[i]) / dir[i];
                    let (t1, t2) = if t1 < t2 { (t1, t2) } else { (t2, t1) };

                    if t1 > t_near {
                        t_near = t1;
                        axis = i;
                    }
                    t_far = t_far.min(t2);
                }

                if t_near > t_far || t_near <= MIN_T {
                    return None;
                }

                let mut normal = na::Vector3::zeros();
                normal[axis] = 1.0;
                Some((t_near, normal))
            }
        }
    }
}

/// Collection of shapes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyntheticScene {
    pub shapes: Vec<Shape>,
}

impl SyntheticScene {
    pub fn new(shapes: Vec<Shape>) -> Self {
        Self { shapes }
    }

    /// Single wall facing the camera at identity pose.
    ///
    /// # Arguments
    ///
    /// * `distance` - distance of the wall along the optical axis.
    pub fn flat_wall(distance: f32) -> Self {
        Self::new(vec![Shape::Plane {
            normal: na::Vector3::z(),
            offset: distance,
        }])
    }

    /// Closed room with a couple of boxes inside.
    ///
    /// The camera at identity pose sits inside the room, looking at the back wall which is 2.5m
    /// away. Every depth sample stays within 3m for moderate camera motion.
    pub fn room() -> Self {
        let wall = |x: f32, y: f32, z: f32, offset: f32| Shape::Plane {
            normal: na::Vector3::new(x, y, z),
            offset,
        };

        Self::new(vec![
            wall(1.0, 0.0, 0.0, 1.5),
            wall(1.0, 0.0, 0.0, -1.5),
            wall(0.0, 1.0, 0.0, 1.0),
            wall(0.0, 1.0, 0.0, -1.0),
            wall(0.0, 0.0, 1.0, 2.5),
            wall(0.0, 0.0, 1.0, -1.0),
            Shape::Cuboid {
                min: na::Point3::new(-0.7, 0.3, 1.6),
                max: na::Point3::new(-0.1, 1.0, 2.1),
            },
            Shape::Cuboid {
                min: na::Point3::new(0.4, -0.4, 1.9),
                max: na::Point3::new(0.8, 0.2, 2.3),
            },
        ])
    }

    /// Closest intersection of a ray with the scene.
    ///
    /// Returns distance along the ray and the surface normal facing the ray origin.
    pub fn cast(
        &self,
        origin: &na::Point3<f32>,
        dir: &na::Vector3<f32>,
    ) -> Option<(f32, na::Vector3<f32>)> {
        self.shapes
            .iter()
            .filter_map(|s| s.intersect(origin, dir))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(t, n)| if n.dot(dir) > 0.0 { (t, -n) } else { (t, n) })
    }

    /// Cast a ray through every pixel.
    fn render<T: Send + Sync + Clone>(
        &self,
        intrinsics: &Intrinsics,
        (width, height): (usize, usize),
        pose: &Pose,
        fill: T,
        hit: impl Fn(f32, &na::Point3<f32>, &na::Vector3<f32>) -> T + Sync,
    ) -> Image<T> {
        let mut image = Image::new(width, height, fill);
        let origin = na::Point3::from(pose.translation());

        if image.is_empty() {
            return image;
        }

        image
            .as_mut_slice()
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let pixel = na::Point2::new(x as f32, y as f32);
                    // Unit depth ray, so that ray distance equals depth.
                    let dir = pose.transform_vector(&intrinsics.ray(pixel));

                    if let Some((t, normal)) = self.cast(&origin, &dir) {
                        *out = hit(t, &(origin + dir * t), &normal);
                    }
                }
            });

        image
    }

    /// Render a depth frame seen from the given camera-to-model pose.
    pub fn render_frame(
        &self,
        intrinsics: &Intrinsics,
        size: (usize, usize),
        pose: &Pose,
    ) -> Frame {
        let depth = self.render(intrinsics, size, pose, 0.0, |t, _, _| t);
        Frame::new(depth, *intrinsics)
    }

    /// Render the model surface seen from the given camera-to-model pose.
    pub fn render_prediction(
        &self,
        intrinsics: &Intrinsics,
        size: (usize, usize),
        pose: &Pose,
    ) -> Prediction {
        let surface = self.render(intrinsics, size, pose, None, |_, point, normal| {
            Some(SurfaceSample {
                point: *point,
                normal: *normal,
            })
        });
        Prediction::new(surface, *intrinsics, *pose)
    }
}

/// Add uniform noise to valid depth samples.
///
/// # Arguments
///
/// * `frame` - frame to modify.
/// * `amplitude` - maximum absolute depth error (in metres).
/// * `rng` - random number generator. Use a seeded one for reproducible sequences.
pub fn add_depth_noise(frame: &mut Frame, amplitude: f32, rng: &mut impl Rng) {
    if amplitude <= 0.0 {
        return;
    }

    for d in frame.depth.as_mut_slice() {
        if *d > 0.0 {
            *d = (*d + rng.gen_range(-amplitude..amplitude)).max(0.0);
        }
    }
}

/// Remove a rectangular region of depth samples, like a sensor dropout.
pub fn drop_region(frame: &mut Frame, (x0, y0): (usize, usize), (x1, y1): (usize, usize)) {
    let (w, h) = frame.dim();

    for y in y0.min(h)..y1.min(h) {
        for x in x0.min(w)..x1.min(w) {
            frame.depth.set(x, y, 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    fn camera() -> (Intrinsics, (usize, usize)) {
        (Intrinsics::new(120.0, 120.0, 79.5, 59.5), (160, 120))
    }

    #[test]
    fn flat_wall_depth() {
        let (k, size) = camera();
        let frame = SyntheticScene::flat_wall(1.0).render_frame(&k, size, &Pose::identity());

        let depth = frame.depth.as_slice();
        assert!(depth.iter().all(|&d| (d - 1.0).abs() < 1e-5));
    }

    #[test]
    fn prediction_matches_frame() {
        let (k, size) = camera();
        let scene = SyntheticScene::room();
        let pose = Pose::exp(&crate::pose::Twist::new(0.05, -0.1, 0.02, 0.1, 0.05, -0.2));

        let frame = scene.render_frame(&k, size, &pose);
        let prediction = scene.render_prediction(&k, size, &pose);

        assert_eq!(prediction.valid_count(), size.0 * size.1);

        for (x, y, s) in prediction.surface.iter().step_by(37) {
            let s = s.unwrap();
            let local = pose.inverse().transform_point(&s.point);
            assert_approx_eq!(local.z, *frame.depth.get(x, y), 1e-4);
            assert_approx_eq!(s.normal.norm(), 1.0);

            // Normals face the camera.
            let view = s.point - na::Point3::from(pose.translation());
            assert!(s.normal.dot(&view) < 0.0);
        }
    }

    #[test]
    fn room_depth_range() {
        let (k, size) = camera();
        let frame = SyntheticScene::room().render_frame(&k, size, &Pose::identity());
        assert_eq!(frame.count_valid_depths((0.2, 3.0)), size.0 * size.1);

        // Boxes are in front of the back wall.
        assert!(*frame.depth.get(50, 80) < 2.5);
    }

    #[test]
    fn cuboid_hit_from_outside() {
        let shape = Shape::Cuboid {
            min: na::Point3::new(-1.0, -1.0, 2.0),
            max: na::Point3::new(1.0, 1.0, 3.0),
        };

        let (t, n) = shape
            .intersect(&na::Point3::origin(), &na::Vector3::z())
            .unwrap();
        assert_approx_eq!(t, 2.0);
        assert_eq!(n, na::Vector3::z());

        assert!(shape
            .intersect(&na::Point3::origin(), &-na::Vector3::z())
            .is_none());
    }

    #[test]
    fn seeded_noise() {
        let (k, size) = camera();
        let scene = SyntheticScene::flat_wall(1.0);

        let mut a = scene.render_frame(&k, size, &Pose::identity());
        let mut b = a.clone();
        add_depth_noise(&mut a, 0.01, &mut rand::rngs::StdRng::seed_from_u64(1));
        add_depth_noise(&mut b, 0.01, &mut rand::rngs::StdRng::seed_from_u64(1));

        assert_eq!(a.depth, b.depth);
        let depth = a.depth.as_slice();
        assert!(depth.iter().all(|&d| (d - 1.0).abs() <= 0.0101));

        drop_region(&mut a, (0, 0), (10, 200));
        assert_eq!(a.count_valid_depths((0.2, 3.0)), (size.0 - 10) * size.1);
    }
}
