//! # Tracker configuration

use crate::properties::{Properties, PropertyMut};
use crate::quality::QualityConfig;
use crate::solver::SolverConfig;
use crate::weighting::WeightingModelParams;
use anyhow::{anyhow, bail, Result};

/// Pose subspace optimised at a pyramid level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum IterationType {
    /// Only the 3 rotational degrees of freedom.
    Rotation,
    /// Only the 3 translational degrees of freedom.
    Translation,
    /// Full 6 degrees of freedom.
    Both,
    /// Level is not evaluated at all.
    None,
}

impl IterationType {
    /// Which twist components are optimised.
    pub fn mask(&self) -> [bool; 6] {
        match self {
            Self::Rotation => [true, true, true, false, false, false],
            Self::Translation => [false, false, false, true, true, true],
            Self::Both => [true; 6],
            Self::None => [false; 6],
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::Both
    }

    /// Parse a single regime character.
    ///
    /// `r` - rotation, `t` - translation, `b` - both, `n` - none.
    pub fn from_char(c: char) -> Result<Self> {
        match c.to_ascii_lowercase() {
            'r' => Ok(Self::Rotation),
            't' => Ok(Self::Translation),
            'b' => Ok(Self::Both),
            'n' => Ok(Self::None),
            c => Err(anyhow!("unknown iteration type '{}'", c)),
        }
    }
}

/// Residual formulation used by the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum Metric {
    PointToPlane,
    PointToPoint,
}

impl Default for Metric {
    fn default() -> Self {
        Self::PointToPlane
    }
}

/// Per pyramid level settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct LevelConfig {
    /// Maximum number of Gauss-Newton iterations.
    pub iterations: usize,
    /// Maximum euclidean distance (in metres) between corresponding points.
    pub distance_threshold: f32,
    pub iteration_type: IterationType,
}

impl LevelConfig {
    /// Whether the level runs any iterations at all.
    pub fn is_evaluated(&self) -> bool {
        self.iteration_type != IterationType::None && self.iterations > 0
    }
}

/// Static tracker configuration.
///
/// Levels are indexed finest first: `levels[0]` is full resolution.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct TrackerConfig {
    /// Full resolution image size `(width, height)`.
    pub image_size: (usize, usize),
    pub levels: Vec<LevelConfig>,
    /// Finest level that gets evaluated. Finer levels are skipped.
    #[cfg_attr(feature = "serde", serde(default))]
    pub run_till_level: usize,
    /// Convergence threshold on the norm of the pose update.
    pub termination_threshold: f32,
    /// Relative residual increase that is treated as divergence.
    pub divergence_tolerance: f32,
    /// Correspondences weighted below this value are rejected.
    #[cfg_attr(feature = "serde", serde(default))]
    pub min_weight: f32,
    /// Usable depth range `(near, far)` in metres.
    pub depth_range: (f32, f32),
    /// Down-weight points quadratically with their distance inside the depth range.
    #[cfg_attr(feature = "serde", serde(default))]
    pub depth_falloff: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metric: Metric,
    #[cfg_attr(feature = "serde", serde(default))]
    pub solver: SolverConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub quality: QualityConfig,
    /// Pretrained correspondence weighting model.
    #[cfg_attr(feature = "serde", serde(default))]
    pub weighting: Option<WeightingModelParams>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let (r, b) = (IterationType::Rotation, IterationType::Both);

        Self::with_levels(
            (640, 480),
            interpolate_levels(&[r, r, r, b, b], (0.1, 0.045), (10, 2)),
            1e-4,
        )
    }
}

/// Build finest-first levels out of coarse-to-fine iteration types.
fn interpolate_levels(
    types: &[IterationType],
    (distance_coarse, distance_fine): (f32, f32),
    (iterations_coarse, iterations_fine): (usize, usize),
) -> Vec<LevelConfig> {
    let coarsest = types.len().saturating_sub(1);

    // Interpolation factor is 0 at the coarsest level, and 1 at the finest one.
    let lerp = |level: usize| {
        if coarsest == 0 {
            1.0
        } else {
            (coarsest - level) as f32 / coarsest as f32
        }
    };

    types
        .iter()
        .rev()
        .enumerate()
        .map(|(level, &iteration_type)| {
            let t = lerp(level);
            let iterations =
                iterations_coarse as f32 + (iterations_fine as f32 - iterations_coarse as f32) * t;
            LevelConfig {
                iterations: iterations.round() as usize,
                distance_threshold: distance_coarse + (distance_fine - distance_coarse) * t,
                iteration_type,
            }
        })
        .collect()
}

impl TrackerConfig {
    /// Build a configuration from a compact tracking regime.
    ///
    /// Outlier thresholds and iteration counts are linearly interpolated from the coarsest level
    /// to the finest one.
    ///
    /// # Arguments
    ///
    /// * `image_size` - full resolution image size.
    /// * `regime` - iteration type per level, written from the coarsest level to the finest one.
    /// * `distances` - coarsest and finest correspondence distance thresholds.
    /// * `iterations` - coarsest and finest iteration budgets.
    /// * `termination_threshold` - convergence threshold on update norm.
    ///
    /// # Examples
    ///
    /// ```
    /// use depthtrack::config::{IterationType, TrackerConfig};
    ///
    /// let config = TrackerConfig::from_regime((320, 240), "rrb", (0.1, 0.02), (10, 4), 1e-4)
    ///     .unwrap();
    ///
    /// assert_eq!(config.levels.len(), 3);
    /// assert_eq!(config.levels[0].iteration_type, IterationType::Both);
    /// assert_eq!(config.levels[1].iterations, 7);
    /// assert_eq!(config.levels[2].iteration_type, IterationType::Rotation);
    /// ```
    pub fn from_regime(
        image_size: (usize, usize),
        regime: &str,
        distances: (f32, f32),
        iterations: (usize, usize),
        termination_threshold: f32,
    ) -> Result<Self> {
        let types = regime
            .chars()
            .map(IterationType::from_char)
            .collect::<Result<Vec<_>>>()?;

        if types.is_empty() {
            bail!("tracking regime must contain at least one level");
        }

        let config = Self::with_levels(
            image_size,
            interpolate_levels(&types, distances, iterations),
            termination_threshold,
        );

        config.validate()?;

        Ok(config)
    }

    /// Configuration with default thresholds around the given levels.
    ///
    /// The result is not validated.
    fn with_levels(
        image_size: (usize, usize),
        levels: Vec<LevelConfig>,
        termination_threshold: f32,
    ) -> Self {
        Self {
            image_size,
            levels,
            run_till_level: 0,
            termination_threshold,
            divergence_tolerance: 0.1,
            min_weight: 0.0,
            depth_range: (0.2, 3.0),
            depth_falloff: false,
            metric: Metric::PointToPlane,
            solver: Default::default(),
            quality: Default::default(),
            weighting: None,
        }
    }

    /// Parse the configuration from JSON and validate it.
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn coarsest_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Check the configuration for errors.
    ///
    /// Nothing is clamped - any invalid value is reported as an error.
    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.image_size;

        if width == 0 || height == 0 {
            bail!("image size must be non-zero, got {}x{}", width, height);
        }

        if self.levels.is_empty() {
            bail!("hierarchy depth must be at least 1");
        }

        let coarsest = self.coarsest_level();

        if (width >> coarsest) == 0 || (height >> coarsest) == 0 {
            bail!(
                "{}x{} image vanishes before reaching {} pyramid levels",
                width,
                height,
                self.levels.len()
            );
        }

        if self.run_till_level > coarsest {
            bail!(
                "run till level {} is beyond the coarsest level {}",
                self.run_till_level,
                coarsest
            );
        }

        for (i, level) in self.levels.iter().enumerate() {
            if !(level.distance_threshold > 0.0) {
                bail!(
                    "level {} distance threshold must be positive, got {}",
                    i,
                    level.distance_threshold
                );
            }
        }

        if !self.levels[self.run_till_level..]
            .iter()
            .any(LevelConfig::is_evaluated)
        {
            bail!("no pyramid level is evaluated");
        }

        if !(self.termination_threshold > 0.0) {
            bail!("termination threshold must be positive");
        }

        if !(self.divergence_tolerance >= 0.0) {
            bail!("divergence tolerance must not be negative");
        }

        if !(self.min_weight >= 0.0 && self.min_weight <= 1.0) {
            bail!("minimum weight must lie within [0; 1]");
        }

        let (near, far) = self.depth_range;
        if !(near >= 0.0 && far > near) {
            bail!("invalid depth range ({}; {})", near, far);
        }

        self.solver.validate()?;
        self.quality.validate()?;

        Ok(())
    }
}

impl Properties for TrackerConfig {
    fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
        let coarsest = self.coarsest_level();
        vec![
            (
                "Termination threshold",
                PropertyMut::float(&mut self.termination_threshold, 1e-8, 1e-1),
            ),
            (
                "Divergence tolerance",
                PropertyMut::float(&mut self.divergence_tolerance, 0.0, 10.0),
            ),
            (
                "Min weight",
                PropertyMut::float(&mut self.min_weight, 0.0, 1.0),
            ),
            (
                "Run till level",
                PropertyMut::usize(&mut self.run_till_level, 0, coarsest),
            ),
            ("Depth falloff", PropertyMut::bool(&mut self.depth_falloff)),
        ]
    }
}
