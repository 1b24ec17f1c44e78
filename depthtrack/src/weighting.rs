//! # Learned correspondence weighting
//!
//! Raw per-correspondence features are standardised with statistics fitted offline, expanded with
//! a homogeneous kernel map approximating the χ² kernel, and scored by a linear classifier. The
//! classifier margin is squashed into a weight in `[0; 1]`.

use anyhow::{bail, Result};

/// Highest supported kernel map order.
pub const MAX_ORDER: usize = 8;

/// Number of raw features fed to the kernel classifiers.
pub const NUM_FEATURES: usize = 4;

const MAX_DIM: usize = NUM_FEATURES * (2 * MAX_ORDER + 1);

/// Homogeneous kernel map of the χ² kernel.
///
/// Maps a scalar into `2 * order + 1` values, such that the dot product of two mapped scalars
/// approximates `2xy / (x + y)`.
#[derive(Clone, Debug)]
pub struct HomkerMap {
    order: usize,
    /// Sampling step of the kernel signature.
    step: f32,
    /// `sqrt(step * kappa(j * step))` for every frequency.
    coeffs: [f32; MAX_ORDER + 1],
}

/// Spectrum of the χ² kernel.
fn chi2_signature(lambda: f32) -> f32 {
    1.0 / (std::f32::consts::PI * lambda).cosh()
}

impl HomkerMap {
    /// Create a new kernel map.
    ///
    /// # Examples
    ///
    /// ```
    /// use depthtrack::weighting::HomkerMap;
    ///
    /// let map = HomkerMap::new(2).unwrap();
    /// assert_eq!(map.dim(), 5);
    /// ```
    pub fn new(order: usize) -> Result<Self> {
        if order > MAX_ORDER {
            bail!("kernel map order {} exceeds {}", order, MAX_ORDER);
        }

        let period = 5.86 * (order as f32).sqrt() + 3.65;
        let step = 2.0 * std::f32::consts::PI / period;

        let mut coeffs = [0.0; MAX_ORDER + 1];

        for (j, c) in coeffs.iter_mut().enumerate().take(order + 1) {
            *c = (step * chi2_signature(j as f32 * step)).sqrt();
        }

        Ok(Self {
            order,
            step,
            coeffs,
        })
    }

    /// Number of output values per input value.
    pub fn dim(&self) -> usize {
        2 * self.order + 1
    }

    /// Map a single value into `out`.
    ///
    /// # Panics
    ///
    /// If `out` is shorter than [`HomkerMap::dim`].
    pub fn map_into(&self, x: f32, out: &mut [f32]) {
        let out = &mut out[..self.dim()];

        if x == 0.0 || !x.is_finite() {
            out.fill(0.0);
            return;
        }

        let sign = x.signum();
        let x = x.abs();
        let sqrt_x = x.sqrt();
        let log_x = x.ln();

        out[0] = sign * sqrt_x * self.coeffs[0];

        for j in 1..=self.order {
            let amp = sign * sqrt_x * std::f32::consts::SQRT_2 * self.coeffs[j];
            let (sin, cos) = (j as f32 * self.step * log_x).sin_cos();
            out[2 * j - 1] = amp * cos;
            out[2 * j] = amp * sin;
        }
    }
}

/// Offline fitted parameters of a kernel classifier.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct KernelClassifierParams {
    pub mean: [f32; NUM_FEATURES],
    pub std_dev: [f32; NUM_FEATURES],
    /// Kernel map order.
    pub order: usize,
    /// Linear weights over the mapped features, channel after channel.
    pub weights: Vec<f32>,
    pub bias: f32,
}

/// Feature standardisation, kernel map and linear classifier.
#[derive(Clone, Debug)]
pub struct KernelClassifier {
    params: KernelClassifierParams,
    map: HomkerMap,
}

impl KernelClassifier {
    pub fn new(params: KernelClassifierParams) -> Result<Self> {
        let map = HomkerMap::new(params.order)?;

        for (i, (m, s)) in params.mean.iter().zip(&params.std_dev).enumerate() {
            if !m.is_finite() {
                bail!("channel {} mean is not finite", i);
            }
            if !(s.is_finite() && *s > 0.0) {
                bail!(
                    "channel {} standard deviation must be positive, got {}",
                    i,
                    s
                );
            }
        }

        let expected = NUM_FEATURES * map.dim();

        if params.weights.len() != expected {
            bail!(
                "classifier has {} weights, kernel map of order {} needs {}",
                params.weights.len(),
                params.order,
                expected
            );
        }

        if params.weights.iter().any(|w| !w.is_finite()) || !params.bias.is_finite() {
            bail!("classifier weights must be finite");
        }

        Ok(Self { params, map })
    }

    /// Signed classifier margin of a raw feature vector.
    pub fn margin(&self, features: &[f32; NUM_FEATURES]) -> f32 {
        let dim = self.map.dim();
        let mut mapped = [0.0f32; MAX_DIM];

        for (i, f) in features.iter().enumerate() {
            let x = (f - self.params.mean[i]) / self.params.std_dev[i];
            self.map.map_into(x, &mut mapped[i * dim..]);
        }

        mapped
            .iter()
            .zip(&self.params.weights)
            .map(|(a, b)| a * b)
            .sum::<f32>()
            + self.params.bias
    }
}

/// Raw features of a single correspondence.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointFeatures {
    /// Absolute point-to-plane residual.
    pub residual: f32,
    /// Euclidean distance between the corresponding points.
    pub distance: f32,
    /// Frame depth of the point.
    pub depth: f32,
    /// Local depth gradient magnitude.
    pub gradient: f32,
}

impl PointFeatures {
    pub fn to_array(&self) -> [f32; NUM_FEATURES] {
        [self.residual, self.distance, self.depth, self.gradient]
    }
}

/// Per-correspondence robustness weight.
pub trait CorrespondenceWeight: Send + Sync {
    /// Compute weight in `[0; 1]` of a correspondence.
    fn weight(&self, features: &PointFeatures) -> f32;
}

/// Serialisable weighting model.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct WeightingModelParams {
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub classifier: KernelClassifierParams,
    /// Slope of the logistic squashing of the margin.
    pub scale: f32,
}

/// Kernel classifier based correspondence weighting.
#[derive(Clone, Debug)]
pub struct WeightingModel {
    classifier: KernelClassifier,
    scale: f32,
}

impl WeightingModel {
    pub fn new(params: WeightingModelParams) -> Result<Self> {
        if !(params.scale.is_finite() && params.scale > 0.0) {
            bail!("weighting scale must be positive, got {}", params.scale);
        }

        Ok(Self {
            classifier: KernelClassifier::new(params.classifier)?,
            scale: params.scale,
        })
    }

    pub fn margin(&self, features: &PointFeatures) -> f32 {
        self.classifier.margin(&features.to_array())
    }
}

impl CorrespondenceWeight for WeightingModel {
    fn weight(&self, features: &PointFeatures) -> f32 {
        let w = 1.0 / (1.0 + (-self.scale * self.margin(features)).exp());

        if w.is_finite() {
            w
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn map(map: &HomkerMap, x: f32) -> Vec<f32> {
        let mut out = vec![0.0; map.dim()];
        map.map_into(x, &mut out);
        out
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn approximates_chi2() {
        let m = HomkerMap::new(3).unwrap();

        for (x, y) in [(1.0, 1.0), (0.5, 1.0), (2.0, 0.7), (0.1, 0.3), (3.0, 3.5)] {
            let k = 2.0 * x * y / (x + y);
            let approx = dot(&map(&m, x), &map(&m, y));
            assert_approx_eq!(approx, k, 0.05 * k);
        }
    }

    #[test]
    fn sign_symmetric() {
        let m = HomkerMap::new(2).unwrap();
        let pos = map(&m, 0.8);
        let neg = map(&m, -0.8);

        for (p, n) in pos.iter().zip(&neg) {
            assert_approx_eq!(*p, -*n);
        }

        assert!(map(&m, 0.0).iter().all(|&v| v == 0.0));
        assert!(HomkerMap::new(MAX_ORDER + 1).is_err());
    }

    fn params(weights: Vec<f32>, bias: f32) -> WeightingModelParams {
        WeightingModelParams {
            classifier: KernelClassifierParams {
                mean: [0.0; 4],
                std_dev: [1.0; 4],
                order: 2,
                weights,
                bias,
            },
            scale: 1.0,
        }
    }

    #[test]
    fn bias_only_model() {
        let model = WeightingModel::new(params(vec![0.0; 20], 0.0)).unwrap();
        assert_approx_eq!(model.weight(&PointFeatures::default()), 0.5);

        let model = WeightingModel::new(params(vec![0.0; 20], 50.0)).unwrap();
        assert_approx_eq!(model.weight(&PointFeatures::default()), 1.0);

        let model = WeightingModel::new(params(vec![0.0; 20], -200.0)).unwrap();
        assert!(model.weight(&PointFeatures::default()) < 1e-6);
    }

    #[test]
    fn residual_sensitive_model() {
        // Negative weight on the first component of the residual channel.
        let mut weights = vec![0.0; 20];
        weights[0] = -4.0;
        let model = WeightingModel::new(params(weights, 2.0)).unwrap();

        let small = PointFeatures {
            residual: 0.01,
            ..Default::default()
        };
        let large = PointFeatures {
            residual: 2.0,
            ..Default::default()
        };

        let (ws, wl) = (model.weight(&small), model.weight(&large));
        assert!(ws > 0.5 && wl < 0.5, "{} {}", ws, wl);
        assert!((0.0..=1.0).contains(&ws) && (0.0..=1.0).contains(&wl));
    }

    #[test]
    fn rejects_bad_params() {
        assert!(WeightingModel::new(params(vec![0.0; 19], 0.0)).is_err());

        let mut p = params(vec![0.0; 20], 0.0);
        p.classifier.std_dev[2] = 0.0;
        assert!(WeightingModel::new(p).is_err());

        let mut p = params(vec![0.0; 20], 0.0);
        p.scale = 0.0;
        assert!(WeightingModel::new(p).is_err());
    }
}
