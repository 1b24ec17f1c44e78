//! # Camera pose tracker

use crate::config::IterationType;
use crate::frame::{Frame, Prediction};
use crate::pose::Pose;
use crate::quality::TrackingQuality;
use anyhow::Result;
use log::*;

/// Reason a pyramid level stopped iterating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LevelExit {
    /// Pose update fell below the termination threshold.
    Converged,
    /// Iteration budget was used up.
    BudgetExhausted,
    /// Too few correspondences to constrain the pose.
    NoCorrespondences,
    /// System could not be solved even with maximum damping.
    Singular,
    /// Residual increased, and the pose was reverted.
    Diverged,
    /// Level is configured not to run.
    Skipped,
}

/// Summary of a single pyramid level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevelReport {
    pub level: usize,
    pub iteration_type: IterationType,
    /// Number of evaluations performed.
    pub iterations: usize,
    pub exit: LevelExit,
    /// Mean weighted squared residual of the last evaluation.
    pub mean_residual: f64,
    pub valid: usize,
    pub candidates: usize,
}

/// Summary of a tracked frame, ordered from the coarsest level to the finest one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub levels: Vec<LevelReport>,
}

impl FrameReport {
    pub fn total_iterations(&self) -> usize {
        self.levels.iter().map(|l| l.iterations).sum()
    }

    /// Report of the finest level that was evaluated.
    pub fn finest_evaluated(&self) -> Option<&LevelReport> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.exit != LevelExit::Skipped)
    }

    pub fn level(&self, level: usize) -> Option<&LevelReport> {
        self.levels.iter().find(|l| l.level == level)
    }
}

/// Result of tracking a single frame, before it gets committed.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackingOutcome {
    pub pose: Pose,
    pub quality: TrackingQuality,
    pub score: f32,
    pub report: FrameReport,
}

/// Persistent tracking record shared with the rest of the pipeline.
///
/// The state only changes through [`TrackingState::commit`], so intermediate poses are never
/// observable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackingState {
    pose: Pose,
    quality: TrackingQuality,
    score: f32,
    frames_tracked: usize,
    last_report: FrameReport,
}

impl TrackingState {
    /// Start tracking from a known pose.
    pub fn new(pose: Pose) -> Self {
        Self {
            pose,
            ..Default::default()
        }
    }

    /// Camera-to-model pose.
    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn quality(&self) -> TrackingQuality {
        self.quality
    }

    /// Residual based score of the last frame (lower is better).
    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn frames_tracked(&self) -> usize {
        self.frames_tracked
    }

    pub fn last_report(&self) -> &FrameReport {
        &self.last_report
    }

    /// Restart tracking from an externally recovered pose.
    pub fn reset(&mut self, pose: Pose) {
        info!("Tracking reset");
        self.pose = pose;
        self.quality = TrackingQuality::Good;
    }

    /// Commit results of a tracked frame.
    ///
    /// A lost frame keeps the previous pose.
    pub fn commit(&mut self, outcome: TrackingOutcome) -> TrackingQuality {
        if outcome.quality != self.quality {
            info!("Tracking quality {} -> {}", self.quality, outcome.quality);
        }

        if outcome.quality != TrackingQuality::Lost {
            self.pose = outcome.pose;
        }

        self.quality = outcome.quality;
        self.score = outcome.score;
        self.last_report = outcome.report;
        self.frames_tracked += 1;

        self.quality
    }
}

/// Generic depth frame tracker.
pub trait Tracker {
    /// Estimate the pose of a single frame.
    ///
    /// The state is only read. Errors are returned only for inputs that do not match the
    /// configuration, numerical problems are reflected in the quality of the outcome.
    ///
    /// # Arguments
    ///
    /// * `state` - tracking state of the previous frame.
    /// * `frame` - current depth frame.
    /// * `prediction` - model surface rendered from the previous pose.
    fn estimate(
        &mut self,
        state: &TrackingState,
        frame: &Frame,
        prediction: &Prediction,
    ) -> Result<TrackingOutcome>;

    /// Track a frame and commit the outcome.
    ///
    /// On error the state is left untouched.
    ///
    /// # Arguments
    ///
    /// * `state` - tracking state to update.
    /// * `frame` - current depth frame.
    /// * `prediction` - model surface rendered from the previous pose.
    fn track(
        &mut self,
        state: &mut TrackingState,
        frame: &Frame,
        prediction: &Prediction,
    ) -> Result<TrackingQuality> {
        let outcome = self.estimate(state, frame, prediction)?;
        Ok(state.commit(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Twist;

    fn outcome(pose: Pose, quality: TrackingQuality) -> TrackingOutcome {
        TrackingOutcome {
            pose,
            quality,
            score: 0.01,
            report: FrameReport {
                levels: vec![LevelReport {
                    level: 0,
                    iteration_type: IterationType::Both,
                    iterations: 3,
                    exit: LevelExit::Converged,
                    mean_residual: 1e-6,
                    valid: 10,
                    candidates: 10,
                }],
            },
        }
    }

    #[test]
    fn commit_accepts_good() {
        let mut state = TrackingState::default();
        let pose = Pose::exp(&Twist::new(0.0, 0.1, 0.0, 0.2, 0.0, 0.0));

        let verdict = state.commit(outcome(pose, TrackingQuality::Poor));
        assert_eq!(verdict, TrackingQuality::Poor);
        assert_eq!(*state.pose(), pose);
        assert_eq!(state.frames_tracked(), 1);
        assert_eq!(state.last_report().total_iterations(), 3);
    }

    #[test]
    fn lost_keeps_pose() {
        let start = Pose::exp(&Twist::new(0.0, 0.0, 0.3, 0.0, 0.0, 0.0));
        let mut state = TrackingState::new(start);

        state.commit(outcome(Pose::identity(), TrackingQuality::Lost));

        assert_eq!(*state.pose(), start);
        assert_eq!(state.quality(), TrackingQuality::Lost);
        assert_eq!(state.score(), 0.01);
    }

    #[test]
    fn reset_restarts_tracking() {
        let mut state = TrackingState::default();
        state.commit(outcome(Pose::identity(), TrackingQuality::Lost));

        let recovered = Pose::exp(&Twist::new(0.1, 0.0, 0.0, 0.0, 0.5, 0.0));
        state.reset(recovered);

        assert_eq!(*state.pose(), recovered);
        assert_eq!(state.quality(), TrackingQuality::Good);
        assert_eq!(state.frames_tracked(), 1);
    }

    struct Failing;

    impl Tracker for Failing {
        fn estimate(
            &mut self,
            _: &TrackingState,
            _: &Frame,
            _: &Prediction,
        ) -> Result<TrackingOutcome> {
            Err(anyhow::anyhow!("malformed"))
        }
    }

    #[test]
    fn error_leaves_state() {
        use crate::camera::Intrinsics;
        use crate::image::Image;

        let k = Intrinsics::from_fov(4, 4, 60.0);
        let frame = Frame::new(Image::new(4, 4, 1.0), k);
        let prediction = Prediction::empty(4, 4, k, Pose::identity());

        let mut state = TrackingState::default();
        let before = state.clone();

        assert!(Failing.track(&mut state, &frame, &prediction).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn finest_evaluated() {
        let mut report = outcome(Pose::identity(), TrackingQuality::Good).report;
        let mut skipped = report.levels[0];
        skipped.exit = LevelExit::Skipped;
        skipped.level = 0;
        report.levels[0].level = 1;
        report.levels.push(skipped);

        assert_eq!(report.finest_evaluated().map(|l| l.level), Some(1));
        assert!(report.level(0).is_some());
    }
}
