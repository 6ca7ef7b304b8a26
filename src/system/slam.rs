//! SlamSystem - thread orchestration and the image push API.
//!
//! Owns the shared context and the five worker threads (Tracking,
//! LocalMapping, LoopClosing, MapMerging, Relocalization). The caller's
//! thread delivers images (or pre-extracted features) and runs the
//! publisher loop with its 200 Hz reset watchdog; shutdown joins everything
//! and writes the per-map trajectory files.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::features::{FeatureExtractor, Features, GrayImage};
use crate::io;
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{LoopCloser, LoopCloserConfig};
use crate::map::Frame;
use crate::map_merging::MapMerger;
use crate::publish::{FramePublisher, LogPublisher, MapPublisher, PosePublisher};
use crate::relocalization::Relocalizer;
use crate::tracking::{NewKeyFrame, Tracker};
use crate::vocabulary::Vocabulary;

use super::SharedContext;

/// Keyframe queue length between Tracking and LocalMapping.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;
/// Frames the relocalizer will hold while lost (the accept window).
const RELOC_CHANNEL_CAPACITY: usize = 3;

/// One unit of tracking input.
pub enum TrackerInput {
    Image(GrayImage, f64),
    Features(Features, f64),
}

pub struct SlamSystem {
    shared: Arc<SharedContext>,
    settings: Settings,
    input_sender: Sender<TrackerInput>,
    handles: Vec<JoinHandle<()>>,
    frame_publisher: Arc<dyn FramePublisher>,
    map_publisher: Arc<dyn MapPublisher>,
}

impl SlamSystem {
    /// Build the system and spawn all worker threads.
    ///
    /// `extractor` serves WORKING frames; `init_extractor` (denser, finest
    /// scale) serves frames while not initialized.
    pub fn new(
        settings: Settings,
        vocabulary: Arc<Vocabulary>,
        extractor: Box<dyn FeatureExtractor>,
        init_extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self> {
        Self::with_publishers(
            settings,
            vocabulary,
            extractor,
            init_extractor,
            Arc::new(LogPublisher),
            Arc::new(LogPublisher),
            Arc::new(LogPublisher),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_publishers(
        settings: Settings,
        vocabulary: Arc<Vocabulary>,
        mut extractor: Box<dyn FeatureExtractor>,
        mut init_extractor: Box<dyn FeatureExtractor>,
        pose_publisher: Arc<dyn PosePublisher>,
        frame_publisher: Arc<dyn FramePublisher>,
        map_publisher: Arc<dyn MapPublisher>,
    ) -> Result<Self> {
        let shared = SharedContext::new(vocabulary);

        // Exactly one image in flight between the caller and Tracking.
        let (input_sender, input_receiver) = bounded::<TrackerInput>(1);
        let (kf_sender, kf_receiver) = bounded::<NewKeyFrame>(KEYFRAME_CHANNEL_CAPACITY);
        let (loop_sender, loop_receiver) = bounded::<NewKeyFrame>(KEYFRAME_CHANNEL_CAPACITY);
        let (merge_sender, merge_receiver) = bounded::<NewKeyFrame>(KEYFRAME_CHANNEL_CAPACITY);
        let (reloc_sender, reloc_receiver) = bounded::<Frame>(RELOC_CHANNEL_CAPACITY);

        // The relocalizer idles until Tracking loses the camera.
        shared.relocalization_gate.request_stop();

        let mut handles = Vec::new();

        // Tracking thread: extract features, run the per-frame pipeline.
        {
            let shared = Arc::clone(&shared);
            let settings = settings.clone();
            let pyramid = extractor.pyramid();
            let frame_publisher = Arc::clone(&frame_publisher);
            handles.push(
                thread::Builder::new()
                    .name("tracking".into())
                    .spawn(move || {
                        let mut tracker = Tracker::new(
                            Arc::clone(&shared),
                            settings,
                            pyramid,
                            kf_sender,
                            reloc_sender,
                            pose_publisher,
                            frame_publisher,
                        );
                        run_tracking(&shared, &mut tracker, input_receiver, &mut extractor, &mut init_extractor);
                    })?,
            );
        }

        // Local mapping thread.
        {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("local-mapping".into())
                    .spawn(move || {
                        LocalMapper::new(shared, kf_receiver, loop_sender, merge_sender).run();
                    })?,
            );
        }

        // Loop closing thread.
        {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("loop-closing".into())
                    .spawn(move || {
                        LoopCloser::new(shared, loop_receiver, LoopCloserConfig::default()).run();
                    })?,
            );
        }

        // Map merging thread.
        {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("map-merging".into())
                    .spawn(move || {
                        MapMerger::new(shared, merge_receiver).run();
                    })?,
            );
        }

        // Relocalization thread.
        {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("relocalization".into())
                    .spawn(move || {
                        Relocalizer::new(shared, reloc_receiver).run();
                    })?,
            );
        }

        Ok(Self {
            shared,
            settings,
            input_sender,
            handles,
            frame_publisher,
            map_publisher,
        })
    }

    pub fn shared(&self) -> &Arc<SharedContext> {
        &self.shared
    }

    /// Deliver a grayscale image. Returns false when Tracking is still busy
    /// with the previous image (the caller decides whether to drop).
    pub fn track_image(&self, image: GrayImage, timestamp: f64) -> bool {
        !matches!(
            self.input_sender.try_send(TrackerInput::Image(image, timestamp)),
            Err(TrySendError::Full(_))
        )
    }

    /// Deliver raw pixel data of 1 or 3 channels. Malformed channel counts
    /// are logged and skipped, leaving the tracking state unchanged.
    pub fn track_raw(
        &self,
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u32,
        timestamp: f64,
    ) -> bool {
        let pixels = (width as usize) * (height as usize);
        let gray = match channels {
            1 => GrayImage::new(width, height, data),
            3 if data.len() == pixels * 3 => {
                Some(convert_to_gray(&data, width, height, self.settings.rgb))
            }
            3 => None,
            other => {
                error!(channels = other, "unsupported channel count, skipping image");
                return false;
            }
        };
        match gray {
            Some(image) => self.track_image(image, timestamp),
            None => {
                error!("image buffer does not match its dimensions, skipping");
                false
            }
        }
    }

    /// Deliver pre-extracted features (dataset replay).
    pub fn track_features(&self, features: Features, timestamp: f64) -> bool {
        !matches!(
            self.input_sender
                .try_send(TrackerInput::Features(features, timestamp)),
            Err(TrySendError::Full(_))
        )
    }

    /// One publisher refresh: service the reset barrier if Tracking raised
    /// it (stop, clear publisher state, acknowledge), otherwise re-publish
    /// the map.
    pub fn refresh_publishers(&self) {
        use std::sync::atomic::Ordering;

        if self.shared.publisher_reset_requested.load(Ordering::SeqCst) {
            self.shared.publisher_stopped.store(true, Ordering::SeqCst);
            self.frame_publisher.reset();
            self.map_publisher.reset();
            self.shared
                .publisher_reset_requested
                .store(false, Ordering::SeqCst);
            self.shared.publisher_stopped.store(false, Ordering::SeqCst);
            return;
        }
        self.map_publisher.publish_map(&self.shared.map_db);
    }

    /// Publisher loop for a dedicated caller thread: publishes at camera
    /// rate while a 200 Hz watchdog polls the reset barrier in between.
    pub fn publisher_loop(&self) {
        use std::sync::atomic::Ordering;
        let frame_period = Duration::from_secs_f64(1.0 / self.settings.fps);
        let watchdog_period = Duration::from_millis(5);

        while !self.shared.is_shutdown() {
            self.refresh_publishers();
            let mut slept = Duration::ZERO;
            while slept < frame_period && !self.shared.is_shutdown() {
                thread::sleep(watchdog_period);
                slept += watchdog_period;
                if self.shared.publisher_reset_requested.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    /// Signal shutdown, join every worker, and write the trajectory files.
    pub fn shutdown_and_save<P: AsRef<Path>>(&mut self, output_dir: P) -> Result<()> {
        self.shutdown();
        let written = io::save_trajectories(&self.shared.map_db, output_dir.as_ref())?;
        for path in &written {
            info!(path = %path.display(), "saved trajectory");
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_tracking(
    shared: &Arc<SharedContext>,
    tracker: &mut Tracker,
    input: Receiver<TrackerInput>,
    extractor: &mut Box<dyn FeatureExtractor>,
    init_extractor: &mut Box<dyn FeatureExtractor>,
) {
    use crate::tracking::TrackingState;
    info!("tracking thread started");
    loop {
        if shared.is_shutdown() {
            break;
        }
        let item = match input.recv_timeout(Duration::from_millis(100)) {
            Ok(item) => item,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        let (features, timestamp) = match item {
            TrackerInput::Features(features, timestamp) => (features, timestamp),
            TrackerInput::Image(image, timestamp) => {
                // Denser extraction while the map does not exist yet.
                let features = if tracker.state == TrackingState::Working {
                    extractor.extract(&image)
                } else {
                    init_extractor.extract(&image)
                };
                (features, timestamp)
            }
        };
        tracker.process(features, timestamp);
    }
    info!("tracking thread exiting");
}

fn convert_to_gray(data: &[u8], width: u32, height: u32, rgb: bool) -> GrayImage {
    let pixels = (width as usize) * (height as usize);
    let mut gray = vec![0u8; pixels];
    for (i, px) in data.chunks_exact(3).take(pixels).enumerate() {
        let (r, g, b) = if rgb {
            (px[0], px[1], px[2])
        } else {
            (px[2], px[1], px[0])
        };
        gray[i] =
            (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64).round().clamp(0.0, 255.0) as u8;
    }
    GrayImage {
        width,
        height,
        data: gray,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ScalePyramid;
    use crate::test_scene::TestScene;
    use std::time::Instant;

    struct EmptyExtractor;

    impl FeatureExtractor for EmptyExtractor {
        fn extract(&mut self, _image: &GrayImage) -> Features {
            Features::default()
        }

        fn pyramid(&self) -> ScalePyramid {
            ScalePyramid::default()
        }
    }

    /// All five worker threads spin up, featureless frames leave the system
    /// uninitialized, and shutdown joins cleanly.
    #[test]
    fn test_system_cold_start_and_shutdown() {
        let scene = TestScene::new(150, 42);
        let mut system = SlamSystem::new(
            scene.settings(),
            Arc::clone(&scene.vocabulary),
            Box::new(EmptyExtractor),
            Box::new(EmptyExtractor),
        )
        .unwrap();

        for i in 0..3 {
            while !system.track_features(Features::default(), i as f64 / 30.0) {
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        // Wait until the tracker has consumed the frames.
        let start = Instant::now();
        while system.shared().frames_processed.load(std::sync::atomic::Ordering::Relaxed) < 3 {
            if start.elapsed() > Duration::from_secs(5) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        system.refresh_publishers();
        assert_eq!(system.shared().map_db.num_live_maps(), 0);
        system.shutdown();
        assert!(system.shared().is_shutdown());
    }

    #[test]
    fn test_malformed_channel_count_is_skipped() {
        let scene = TestScene::new(150, 43);
        let system = SlamSystem::new(
            scene.settings(),
            Arc::clone(&scene.vocabulary),
            Box::new(EmptyExtractor),
            Box::new(EmptyExtractor),
        )
        .unwrap();

        assert!(!system.track_raw(vec![0u8; 16], 2, 2, 4, 0.0));
        // A well-formed grayscale buffer is accepted.
        assert!(system.track_raw(vec![0u8; 4], 2, 2, 1, 0.1));
    }
}
