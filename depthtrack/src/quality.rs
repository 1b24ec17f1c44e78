//! # Convergence and tracking quality

use crate::properties::{Properties, PropertyMut};
use crate::weighting::{KernelClassifier, KernelClassifierParams};
use anyhow::{bail, Result};
use nalgebra as na;

/// Verdict of a tracked frame.
///
/// Variants are ordered from best to worst, so that verdicts of multiple classifiers can be
/// combined with `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum TrackingQuality {
    /// Pose is accepted and the frame may be fused.
    Good,
    /// Pose is accepted, but should be treated with caution.
    Poor,
    /// Pose is rejected.
    Lost,
}

impl Default for TrackingQuality {
    fn default() -> Self {
        Self::Good
    }
}

impl std::fmt::Display for TrackingQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Good => "GOOD",
            Self::Poor => "POOR",
            Self::Lost => "LOST",
        };
        f.write_str(s)
    }
}

/// Quality thresholds.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct QualityConfig {
    /// Valid fraction below which the frame can not be good.
    pub min_valid_fraction: f32,
    /// Valid fraction below which tracking is lost.
    pub lost_valid_fraction: f32,
    /// Relative residual increase between the last two iterations treated as not improving.
    pub residual_tolerance: f32,
    /// RMS residual (in metres) above which the frame can not be good.
    pub max_rms_residual: f32,
    /// Learned classifier score above which the frame is poor rather than lost.
    pub poor_margin: f32,
    /// Optional learned quality classifier.
    pub model: Option<KernelClassifierParams>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_valid_fraction: 0.5,
            lost_valid_fraction: 0.1,
            residual_tolerance: 0.05,
            max_rms_residual: 0.02,
            poor_margin: -10.0,
            model: None,
        }
    }
}

impl QualityConfig {
    pub fn min_valid_fraction(self, min_valid_fraction: f32) -> Self {
        Self {
            min_valid_fraction,
            ..self
        }
    }

    pub fn lost_valid_fraction(self, lost_valid_fraction: f32) -> Self {
        Self {
            lost_valid_fraction,
            ..self
        }
    }

    pub fn max_rms_residual(self, max_rms_residual: f32) -> Self {
        Self {
            max_rms_residual,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);

        if !in_unit(self.min_valid_fraction) || !in_unit(self.lost_valid_fraction) {
            bail!("valid fractions must lie within [0; 1]");
        }

        if self.lost_valid_fraction > self.min_valid_fraction {
            bail!(
                "lost fraction {} is above the minimum valid fraction {}",
                self.lost_valid_fraction,
                self.min_valid_fraction
            );
        }

        if !(self.residual_tolerance >= 0.0) {
            bail!("residual tolerance must not be negative");
        }

        if !(self.max_rms_residual > 0.0) {
            bail!("maximum RMS residual must be positive");
        }

        if !(self.poor_margin <= 0.0) {
            bail!("poor margin must not be positive");
        }

        if let Some(model) = &self.model {
            KernelClassifier::new(model.clone())?;
        }

        Ok(())
    }
}

impl Properties for QualityConfig {
    fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
        vec![
            (
                "Min valid fraction",
                PropertyMut::float(&mut self.min_valid_fraction, 0.0, 1.0),
            ),
            (
                "Lost valid fraction",
                PropertyMut::float(&mut self.lost_valid_fraction, 0.0, 1.0),
            ),
            (
                "Residual tolerance",
                PropertyMut::float(&mut self.residual_tolerance, 0.0, 10.0),
            ),
            (
                "Max RMS residual",
                PropertyMut::float(&mut self.max_rms_residual, 1e-6, 1.0),
            ),
            (
                "Poor margin",
                PropertyMut::float(&mut self.poor_margin, -100.0, 0.0),
            ),
        ]
    }
}

/// Statistics of the finest evaluated level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityEvidence {
    /// Accepted correspondences of the last evaluation.
    pub valid: usize,
    /// Frame points considered in the last evaluation.
    pub candidates: usize,
    /// Number of pixels of the level.
    pub total_pixels: usize,
    /// Mean weighted squared residual of the last evaluation.
    pub mean_residual: f64,
    /// Mean residual of the evaluation before the last one, if any.
    pub previous_residual: Option<f64>,
    /// Correspondence distance threshold of the level.
    pub distance_threshold: f32,
    /// Normalised hessian of the last evaluation.
    pub hessian: na::Matrix6<f64>,
    /// Whether all 6 degrees of freedom were optimised.
    pub full_dof: bool,
    /// Whether the last solve failed.
    pub singular: bool,
    /// Coarser levels that ran out of correspondences or hit a singular system.
    pub failed_levels: usize,
}

impl Default for QualityEvidence {
    fn default() -> Self {
        Self {
            valid: 0,
            candidates: 0,
            total_pixels: 0,
            mean_residual: 0.0,
            previous_residual: None,
            distance_threshold: 0.0,
            hessian: na::Matrix6::zeros(),
            full_dof: false,
            singular: false,
            failed_levels: 0,
        }
    }
}

impl QualityEvidence {
    pub fn valid_fraction(&self) -> f32 {
        if self.candidates == 0 {
            0.0
        } else {
            self.valid as f32 / self.candidates as f32
        }
    }

    pub fn rms_residual(&self) -> f32 {
        self.mean_residual.max(0.0).sqrt() as f32
    }

    /// Tracker score.
    ///
    /// RMS residual, where every rejected candidate is charged the distance threshold.
    pub fn score(&self) -> f32 {
        if self.candidates == 0 {
            return self.distance_threshold;
        }

        let valid = self.valid as f64;
        let rejected = self.candidates.saturating_sub(self.valid) as f64;
        let thr = self.distance_threshold as f64;

        ((valid * self.mean_residual + rejected * thr * thr) / self.candidates as f64).sqrt() as f32
    }

    /// Features of the learned quality classifier.
    pub fn features(&self) -> [f32; 4] {
        let det = if self.full_dof {
            let det = self.hessian.determinant();
            if det > 0.0 {
                det.ln() as f32
            } else {
                0.0
            }
        } else {
            0.0
        };

        let pixel_fraction = if self.total_pixels == 0 {
            0.0
        } else {
            self.valid as f32 / self.total_pixels as f32
        };

        [det, self.valid_fraction(), self.rms_residual(), pixel_fraction]
    }
}

/// Check whether a pose update is small enough to stop iterating.
///
/// # Arguments
///
/// * `step_norm` - norm of the solved twist.
/// * `threshold` - termination threshold.
pub fn has_converged(step_norm: f32, threshold: f32) -> bool {
    step_norm < threshold
}

/// Check whether the residual grew beyond tolerance.
///
/// Increases within floating point noise are never treated as growth.
pub fn residual_increased(previous: f64, current: f64, tolerance: f32) -> bool {
    const ABS_FLOOR: f64 = 1e-10;

    current > previous * (1.0 + tolerance as f64) && current - previous > ABS_FLOOR
}

/// Final per-frame quality classifier.
#[derive(Clone, Debug)]
pub struct QualityClassifier {
    config: QualityConfig,
    model: Option<KernelClassifier>,
}

impl QualityClassifier {
    pub fn new(config: QualityConfig) -> Result<Self> {
        config.validate()?;

        let model = config.model.clone().map(KernelClassifier::new).transpose()?;

        Ok(Self { config, model })
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Classify based on thresholds only.
    pub fn classify_thresholds(&self, evidence: &QualityEvidence) -> TrackingQuality {
        let fraction = evidence.valid_fraction();

        if evidence.valid == 0 || fraction < self.config.lost_valid_fraction {
            return TrackingQuality::Lost;
        }

        let not_improving = evidence
            .previous_residual
            .map(|prev| {
                residual_increased(prev, evidence.mean_residual, self.config.residual_tolerance)
            })
            .unwrap_or(false);

        if fraction < self.config.min_valid_fraction
            || not_improving
            || evidence.rms_residual() > self.config.max_rms_residual
            || evidence.singular
            || evidence.failed_levels > 0
        {
            TrackingQuality::Poor
        } else {
            TrackingQuality::Good
        }
    }

    /// Classify with the learned model, if there is one.
    pub fn classify_model(&self, evidence: &QualityEvidence) -> Option<TrackingQuality> {
        let model = self.model.as_ref()?;
        let score = model.margin(&evidence.features());

        Some(if score > 0.0 {
            TrackingQuality::Good
        } else if score > self.config.poor_margin {
            TrackingQuality::Poor
        } else {
            TrackingQuality::Lost
        })
    }

    /// Get the worse verdict of both classifiers.
    pub fn classify(&self, evidence: &QualityEvidence) -> TrackingQuality {
        let thresholds = self.classify_thresholds(evidence);

        self.classify_model(evidence)
            .map(|q| q.max(thresholds))
            .unwrap_or(thresholds)
    }
}
