//! # Depth Tracking Library
//!
//! This library provides the building blocks of a hierarchical, weighted Gauss-Newton camera
//! tracker for dense depth reconstruction pipelines. Each incoming depth frame is aligned against
//! a rendered prediction of the reconstructed model, coarse to fine, and the result is committed
//! to a shared [`TrackingState`](tracker::TrackingState) together with a quality verdict.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use depthtrack::prelude::v1::*;
//! ```
//!
//! You may need [`nalgebra`](https://crates.io/crates/nalgebra) to make use of the functionality.

pub mod camera;
pub mod config;
pub mod frame;
pub mod image;
pub mod normal_equations;
pub mod pose;
pub mod properties;
pub mod pyramid;
pub mod quality;
pub mod solver;
pub mod synthetic;
pub mod tracker;
pub mod weighting;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            camera::Intrinsics,
            config::{IterationType, LevelConfig, Metric, TrackerConfig},
            frame::{Frame, Prediction, Rgba, SurfaceSample},
            image::Image,
            normal_equations::NormalEquations,
            pose::{Pose, Twist},
            properties::{Properties, Property, PropertyMut},
            pyramid::{FrameLevel, ImagePyramid, PredictionLevel, WeightMap},
            quality::{QualityClassifier, QualityConfig, QualityEvidence, TrackingQuality},
            solver::{SolverConfig, Step},
            tracker::{FrameReport, LevelExit, LevelReport, Tracker, TrackingOutcome, TrackingState},
            weighting::{CorrespondenceWeight, PointFeatures, WeightingModel, WeightingModelParams},
        };
        pub use anyhow::{anyhow, bail, Error, Result};
    }
}
