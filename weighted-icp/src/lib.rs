//! # Hierarchical weighted ICP tracker
//!
//! Aligns depth frames against rendered model predictions with iteratively reweighted
//! Gauss-Newton, from the coarsest pyramid level to the finest one. Each correspondence may be
//! weighted by a learned model, and the frame is classified as good, poor or lost at the end.

use depthtrack::prelude::v1::*;
use depthtrack::quality::{has_converged, residual_increased};
use depthtrack::solver::solve;
use log::*;

pub mod accumulate;
pub mod evaluator;

use accumulate::{accumulate, LevelInputs};
pub use evaluator::{PointEvaluator, PointToPlane, PointToPoint};

/// Fewer correspondences than this can not constrain 6 degrees of freedom.
const MIN_CORRESPONDENCES: usize = 6;

/// Progress of the coarse-to-fine loop.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Iterating { level: usize, iteration: usize },
    Converged { level: usize },
    LevelExhausted { level: usize, exit: LevelExit },
    Done(TrackingQuality),
}

/// Per level iteration bookkeeping.
#[derive(Clone, Copy, Debug)]
struct LevelRun {
    /// Last pose whose residual did not diverge.
    accepted: Pose,
    accepted_residual: Option<f64>,
    evaluations: usize,
    last: NormalEquations,
    previous_residual: Option<f64>,
    singular: bool,
}

impl LevelRun {
    fn new(pose: Pose) -> Self {
        Self {
            accepted: pose,
            accepted_residual: None,
            evaluations: 0,
            last: NormalEquations::default(),
            previous_residual: None,
            singular: false,
        }
    }

    fn record(&mut self, eq: NormalEquations) {
        if self.evaluations > 0 {
            self.previous_residual = Some(self.last.mean_residual());
        }
        self.last = eq;
        self.evaluations += 1;
    }
}

/// Hierarchical weighted Gauss-Newton ICP tracker.
///
/// The residual formulation is selected with the `E` parameter.
pub struct WeightedIcpTracker<E> {
    config: TrackerConfig,
    pyramid: ImagePyramid,
    quality: QualityClassifier,
    weighting: Option<Box<dyn CorrespondenceWeight>>,
    evaluator: E,
}

impl<E: PointEvaluator + Default> WeightedIcpTracker<E> {
    /// Create a tracker with pyramid buffers sized for the configured image.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        Self::with_evaluator(config, E::default())
    }
}

impl<E: PointEvaluator> WeightedIcpTracker<E> {
    pub fn with_evaluator(config: TrackerConfig, evaluator: E) -> Result<Self> {
        config.validate()?;

        let pyramid = ImagePyramid::from_config(&config)?;
        let quality = QualityClassifier::new(config.quality.clone())?;

        let weighting = match &config.weighting {
            Some(params) => {
                let model: Box<dyn CorrespondenceWeight> =
                    Box::new(WeightingModel::new(params.clone())?);
                Some(model)
            }
            None => None,
        };

        Ok(Self {
            config,
            pyramid,
            quality,
            weighting,
            evaluator,
        })
    }

    /// Use a custom correspondence weighting.
    pub fn with_weighting(self, weighting: Box<dyn CorrespondenceWeight>) -> Self {
        Self {
            weighting: Some(weighting),
            ..self
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn level_inputs<'a>(&'a self, level: usize, render_pose: &'a Pose) -> LevelInputs<'a> {
        LevelInputs {
            frame: self.pyramid.frame_level(level),
            prediction: self.pyramid.prediction_level(level),
            render_pose,
            distance_threshold: self.config.levels[level].distance_threshold,
            min_weight: self.config.min_weight,
            weighting: self.weighting.as_deref(),
        }
    }

    /// Perform a single Gauss-Newton iteration.
    fn iterate(
        &self,
        level: usize,
        iteration: usize,
        pose: &mut Pose,
        run: &mut LevelRun,
        render_pose: &Pose,
    ) -> Phase {
        let level_config = &self.config.levels[level];

        if iteration >= level_config.iterations {
            return Phase::LevelExhausted {
                level,
                exit: LevelExit::BudgetExhausted,
            };
        }

        let eq = accumulate(
            &self.evaluator,
            &self.level_inputs(level, render_pose),
            pose,
        );
        run.record(eq);

        let mean = eq.mean_residual();

        trace!(
            "Level {} iteration {}: residual {:e}, valid {}/{}",
            level,
            iteration,
            mean,
            eq.valid,
            eq.candidates
        );

        if eq.valid < MIN_CORRESPONDENCES
            || eq.valid_fraction() < self.config.quality.lost_valid_fraction
        {
            *pose = run.accepted;
            return Phase::LevelExhausted {
                level,
                exit: LevelExit::NoCorrespondences,
            };
        }

        if let Some(prev) = run.accepted_residual {
            if residual_increased(prev, mean, self.config.divergence_tolerance) {
                *pose = run.accepted;
                return Phase::LevelExhausted {
                    level,
                    exit: LevelExit::Diverged,
                };
            }
        }

        run.accepted = *pose;
        run.accepted_residual = Some(mean);

        let step = match solve(&eq, level_config.iteration_type, &self.config.solver) {
            Some(step) => step,
            None => {
                run.singular = true;
                return Phase::LevelExhausted {
                    level,
                    exit: LevelExit::Singular,
                };
            }
        };

        *pose = pose.retract(&step.delta);

        let norm = step.delta.norm();
        trace!("Step norm {:e}, damping {:e}", norm, step.damping);

        if has_converged(norm, self.config.termination_threshold) {
            Phase::Converged { level }
        } else {
            Phase::Iterating {
                level,
                iteration: iteration + 1,
            }
        }
    }

    /// Build quality evidence out of the last evaluation of a level.
    ///
    /// `failed_levels` counts coarser levels that ended without a usable solution.
    fn evidence(&self, level: usize, run: &LevelRun, failed_levels: usize) -> QualityEvidence {
        let level_config = &self.config.levels[level];
        let (width, height) = self.pyramid.frame_level(level).dim();

        QualityEvidence {
            valid: run.last.valid,
            candidates: run.last.candidates,
            total_pixels: width * height,
            mean_residual: run.last.mean_residual(),
            previous_residual: run.previous_residual,
            distance_threshold: level_config.distance_threshold,
            hessian: run
                .last
                .normalised()
                .map(|(h, _)| h)
                .unwrap_or_else(nalgebra::Matrix6::zeros),
            full_dof: level_config.iteration_type.is_full(),
            singular: run.singular,
            failed_levels,
        }
    }

    /// Level to continue with after the given one, or `None` if the hierarchy is done.
    fn next_level(&self, level: usize) -> Option<usize> {
        (level > self.config.run_till_level).then(|| level - 1)
    }
}

impl<E: PointEvaluator> Tracker for WeightedIcpTracker<E> {
    fn estimate(
        &mut self,
        state: &TrackingState,
        frame: &Frame,
        prediction: &Prediction,
    ) -> Result<TrackingOutcome> {
        self.pyramid.build(frame, prediction)?;

        let render_pose = prediction.pose;
        let mut pose = *state.pose();
        let mut run = LevelRun::new(pose);
        let mut evidence = None;
        let mut failed_levels = 0;
        let mut report = FrameReport::default();

        let mut phase = Phase::Iterating {
            level: self.config.coarsest_level(),
            iteration: 0,
        };

        let quality = loop {
            phase = match phase {
                Phase::Iterating { level, iteration } => {
                    let level_config = &self.config.levels[level];

                    if iteration == 0 {
                        run = LevelRun::new(pose);
                    }

                    if !level_config.is_evaluated() {
                        Phase::LevelExhausted {
                            level,
                            exit: LevelExit::Skipped,
                        }
                    } else {
                        self.iterate(level, iteration, &mut pose, &mut run, &render_pose)
                    }
                }
                Phase::Converged { level } | Phase::LevelExhausted { level, .. } => {
                    let exit = match phase {
                        Phase::LevelExhausted { exit, .. } => exit,
                        _ => LevelExit::Converged,
                    };

                    let level_config = &self.config.levels[level];

                    debug!(
                        "Level {} ({:?}): {:?} after {} iterations",
                        level, level_config.iteration_type, exit, run.evaluations
                    );

                    if exit != LevelExit::Skipped {
                        evidence = Some(self.evidence(level, &run, failed_levels));
                    }

                    if matches!(exit, LevelExit::NoCorrespondences | LevelExit::Singular) {
                        failed_levels += 1;
                    }

                    report.levels.push(LevelReport {
                        level,
                        iteration_type: level_config.iteration_type,
                        iterations: run.evaluations,
                        exit,
                        mean_residual: run.last.mean_residual(),
                        valid: run.last.valid,
                        candidates: run.last.candidates,
                    });

                    match self.next_level(level) {
                        Some(level) => Phase::Iterating {
                            level,
                            iteration: 0,
                        },
                        None => Phase::Done(
                            evidence
                                .as_ref()
                                .map(|e| self.quality.classify(e))
                                .unwrap_or(TrackingQuality::Lost),
                        ),
                    }
                }
                Phase::Done(quality) => break quality,
            };
        };

        let score = evidence
            .map(|e| e.score())
            .unwrap_or(self.config.levels[0].distance_threshold);

        Ok(TrackingOutcome {
            pose,
            quality,
            score,
            report,
        })
    }
}

/// Create a tracker for the configured residual metric.
///
/// # Examples
///
/// ```
/// use depthtrack::prelude::v1::*;
///
/// let config = TrackerConfig::from_regime((64, 48), "rb", (0.1, 0.05), (6, 3), 1e-4).unwrap();
/// let tracker = weighted_icp::create_tracker(config).unwrap();
/// ```
pub fn create_tracker(config: TrackerConfig) -> Result<Box<dyn Tracker + Send>> {
    Ok(match config.metric {
        Metric::PointToPlane => Box::new(WeightedIcpTracker::<PointToPlane>::new(config)?),
        Metric::PointToPoint => Box::new(WeightedIcpTracker::<PointToPoint>::new(config)?),
    })
}
