use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use monoslam::config::Settings;
use monoslam::features::{FeatureExtractor, Features, GrayImage, ScalePyramid};
use monoslam::io::ReplayDataset;
use monoslam::system::SlamSystem;
use monoslam::vocabulary::Vocabulary;

/// Stand-in for the external ORB extractor when frames arrive as
/// pre-extracted features from a replay dataset.
struct ReplayFeatures {
    pyramid: ScalePyramid,
}

impl FeatureExtractor for ReplayFeatures {
    fn extract(&mut self, _image: &GrayImage) -> Features {
        warn!("replay run received a raw image; no extractor is configured");
        Features::default()
    }

    fn pyramid(&self) -> ScalePyramid {
        self.pyramid
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(settings_path), Some(vocabulary_path), Some(dataset_path)) =
        (args.next(), args.next(), args.next())
    else {
        bail!("usage: monoslam <settings.yaml> <vocabulary.txt> <dataset_dir> [output_dir]");
    };
    let output_dir = args.next().unwrap_or_else(|| "generated".to_string());

    let settings = Settings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path))?;
    info!(
        fx = settings.camera.fx,
        fy = settings.camera.fy,
        cx = settings.camera.cx,
        cy = settings.camera.cy,
        fps = settings.fps,
        "camera parameters"
    );
    info!(
        features = settings.orb.n_features,
        levels = settings.orb.n_levels,
        scale = settings.orb.scale_factor,
        "extractor parameters"
    );

    info!("loading vocabulary, this can take a while");
    let vocabulary = Arc::new(
        Vocabulary::load_from_text(&vocabulary_path)
            .with_context(|| format!("loading vocabulary from {}", vocabulary_path))?,
    );
    info!(words = vocabulary.num_words(), "vocabulary loaded");

    let dataset = ReplayDataset::open(&dataset_path)
        .with_context(|| format!("opening replay dataset at {}", dataset_path))?;
    info!(frames = dataset.len(), "replay dataset opened");

    let pyramid = ScalePyramid {
        scale_factor: settings.orb.scale_factor,
        n_levels: settings.orb.n_levels,
    };
    let mut system = SlamSystem::new(
        settings.clone(),
        vocabulary,
        Box::new(ReplayFeatures { pyramid }),
        Box::new(ReplayFeatures { pyramid }),
    )?;

    // Feed at camera rate; the publisher refresh runs in between.
    let frame_period = Duration::from_secs_f64(1.0 / settings.fps);
    for i in 0..dataset.len() {
        let (timestamp, features) = dataset.frame(i)?;
        while !system.track_features(features.clone(), timestamp) {
            // Tracking still busy with the previous frame.
            std::thread::sleep(frame_period / 4);
        }
        system.refresh_publishers();
        std::thread::sleep(frame_period);
    }
    info!(frames = dataset.len(), "replay finished");

    system.shutdown_and_save(&output_dir)?;
    Ok(())
}
