//! Analyse accuracy of depth trackers on a synthetic sequence

use clap::*;
use depthtrack::prelude::v1::{Result, *};
use depthtrack::synthetic::{add_depth_noise, SyntheticScene};
use log::*;
use nalgebra as na;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

/// Per-frame result of a single tracker.
#[derive(Clone, Copy, Debug, Serialize)]
struct FrameRecord {
    frame: usize,
    quality: TrackingQuality,
    score: f32,
    iterations: usize,
    /// Rotation error in degrees.
    rotation_error: f32,
    /// Translation error in metres.
    translation_error: f32,
}

struct AnalysisState {
    name: &'static str,
    tracker: Box<dyn Tracker + Send>,
    state: TrackingState,
    records: Vec<FrameRecord>,
    /// Number of times tracking was restarted from ground truth.
    resets: usize,
}

impl AnalysisState {
    fn new(name: &'static str, config: &TrackerConfig, metric: Metric) -> Result<Self> {
        let config = TrackerConfig {
            metric,
            ..config.clone()
        };

        Ok(Self {
            name,
            tracker: weighted_icp::create_tracker(config)?,
            state: TrackingState::default(),
            records: vec![],
            resets: 0,
        })
    }

    fn on_frame(
        &mut self,
        idx: usize,
        scene: &SyntheticScene,
        frame: &Frame,
        ground_truth: &Pose,
    ) -> Result<()> {
        let pose = self.state.pose();
        let prediction = scene.render_prediction(&frame.intrinsics, frame.dim(), pose);

        let quality = self.tracker.track(&mut self.state, frame, &prediction)?;

        self.records.push(FrameRecord {
            frame: idx,
            quality,
            score: self.state.score(),
            iterations: self.state.last_report().total_iterations(),
            rotation_error: self.state.pose().angle_to(ground_truth).to_degrees(),
            translation_error: self.state.pose().distance_to(ground_truth),
        });

        // Stand in for relocalisation.
        if quality == TrackingQuality::Lost {
            self.state.reset(*ground_truth);
            self.resets += 1;
        }

        Ok(())
    }

    fn summary(&self) -> String {
        let n = self.records.len().max(1) as f32;
        let records = self.records.iter();
        let mean_rot = records.clone().map(|r| r.rotation_error).sum::<f32>() / n;
        let mean_tr = records.clone().map(|r| r.translation_error).sum::<f32>() / n;
        let count = |q| records.clone().filter(|r| r.quality == q).count();

        format!(
            "{}: rotation {:.4} deg, translation {:.5} m, good {}, poor {}, lost {}, resets {}",
            self.name,
            mean_rot,
            mean_tr,
            count(TrackingQuality::Good),
            count(TrackingQuality::Poor),
            count(TrackingQuality::Lost),
            self.resets,
        )
    }
}

/// Smooth camera trajectory inside the room.
fn trajectory(idx: usize) -> Pose {
    let t = idx as f32 * 0.1;

    let rotation = na::UnitQuaternion::from_euler_angles(
        0.04 * (t * 0.7).sin(),
        0.08 * t.sin(),
        0.02 * (t * 1.3).cos() - 0.02,
    );
    let translation = na::Vector3::new(
        0.15 * (t * 0.8).sin(),
        0.05 * (t * 1.1).sin(),
        -0.1 * (1.0 - (t * 0.5).cos()),
    );

    Pose::from_parts(translation, rotation)
}

fn load_config(matches: &ArgMatches) -> Result<TrackerConfig> {
    let mut config = match matches.value_of("config") {
        Some(path) => TrackerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => TrackerConfig::from_regime((160, 120), "rrbb", (0.2, 0.05), (10, 4), 1e-4)?,
    };

    if let Some(values) = matches.values_of("set") {
        for kv in values {
            let (name, value) = kv
                .split_once('=')
                .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{}'", kv))?;

            let in_tracker = config
                .props()
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case(name.trim()));

            if in_tracker {
                config.set_property(name.trim(), value)?;
            } else {
                config.quality.set_property(name.trim(), value)?;
            }
        }
    }

    config.validate()?;

    Ok(config)
}

fn print_props(config: &mut TrackerConfig) {
    for (name, prop) in config.props() {
        println!("{}: {}", name, prop);
    }
    for (name, prop) in config.quality.props() {
        println!("{}: {}", name, prop);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("track-analyser")
        .version(crate_version!())
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .help("JSON tracker configuration"),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .short('f')
                .takes_value(true)
                .default_value("30"),
        )
        .arg(
            Arg::new("noise")
                .long("noise")
                .short('n')
                .takes_value(true)
                .default_value("0.0")
                .help("Uniform depth noise amplitude in metres"),
        )
        .arg(
            Arg::new("metric")
                .long("metric")
                .short('m')
                .takes_value(true)
                .possible_values(["plane", "point", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("set")
                .long("set")
                .short('s')
                .takes_value(true)
                .multiple_occurrences(true)
                .help("Override a tunable property (NAME=VALUE)"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::new("props")
                .long("props")
                .help("List tunable properties"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print per-frame records as JSON"),
        )
        .get_matches();

    let mut config = load_config(&matches)?;

    if matches.is_present("props") {
        print_props(&mut config);
        return Ok(());
    }

    let frames: usize = matches.value_of_t("frames")?;
    let noise: f32 = matches.value_of_t("noise")?;
    let seed: u64 = matches.value_of_t("seed")?;

    let plane = ("point-to-plane", Metric::PointToPlane);
    let point = ("point-to-point", Metric::PointToPoint);
    let metrics = match matches.value_of("metric") {
        Some("plane") => vec![plane],
        Some("point") => vec![point],
        _ => vec![plane, point],
    };

    let mut states = metrics
        .into_iter()
        .map(|(name, metric)| AnalysisState::new(name, &config, metric))
        .collect::<Result<Vec<_>>>()?;

    let (width, height) = config.image_size;
    let intrinsics = Intrinsics::from_fov(width, height, 53.13);
    let scene = SyntheticScene::room();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    for idx in 0..frames {
        let ground_truth = trajectory(idx);
        let mut frame = scene.render_frame(&intrinsics, config.image_size, &ground_truth);
        add_depth_noise(&mut frame, noise, &mut rng);

        states
            .par_iter_mut()
            .map(|s| s.on_frame(idx, &scene, &frame, &ground_truth))
            .collect::<Result<Vec<_>>>()?;

        for s in &states {
            if let Some(r) = s.records.last() {
                info!(
                    "{} frame {}: {} ({:.4} deg, {:.5} m, {} iterations)",
                    s.name, idx, r.quality, r.rotation_error, r.translation_error, r.iterations
                );
            }
        }
    }

    for s in &states {
        if matches.is_present("json") {
            println!("{}", serde_json::to_string(&s.records)?);
        }
        println!("{}", s.summary());
    }

    Ok(())
}
