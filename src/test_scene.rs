//! Synthetic world for exercising the pipeline in tests.
//!
//! A deterministic 3D point cloud with a stable, unique descriptor per
//! landmark, projected through arbitrary camera poses into `Features`. The
//! vocabulary is flat over the landmark descriptors so BoW retrieval and
//! matching behave like the real thing on clean data.

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{OrbParams, ScoreType, Settings};
use crate::features::{Camera, Descriptor, Features, KeyPoint, DESCRIPTOR_BYTES};
use crate::geometry::SE3;
use crate::vocabulary::Vocabulary;

pub struct TestScene {
    pub camera: Camera,
    pub world: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub vocabulary: Arc<Vocabulary>,
}

impl TestScene {
    /// A cloud of `n_points` in front of the origin, seeded for
    /// reproducibility.
    pub fn new(n_points: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let world: Vec<Vector3<f64>> = (0..n_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(4.0..8.0),
                )
            })
            .collect();
        let descriptors: Vec<Descriptor> = (0..n_points)
            .map(|_| {
                let mut d = [0u8; DESCRIPTOR_BYTES];
                rng.fill(&mut d[..]);
                Descriptor(d)
            })
            .collect();
        let vocabulary = Arc::new(Vocabulary::from_words(descriptors.clone()));

        Self {
            camera: Camera {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
                k1: 0.0,
                k2: 0.0,
                p1: 0.0,
                p2: 0.0,
                width: 640,
                height: 480,
            },
            world,
            descriptors,
            vocabulary,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            camera: self.camera,
            fps: 30.0,
            rgb: true,
            orb: OrbParams {
                n_features: 1000,
                scale_factor: 1.2,
                n_levels: 8,
                fast_threshold: 20,
                score_type: ScoreType::Fast,
            },
            use_motion_model: true,
        }
    }

    /// Project the whole cloud through a pose.
    pub fn features_from_pose(&self, pose: &SE3) -> Features {
        self.features_subset(pose, &(0..self.world.len()).collect::<Vec<_>>())
    }

    /// Project a subset of landmarks (by index) through a pose. Points
    /// behind the camera or outside the image are dropped.
    pub fn features_subset(&self, pose: &SE3, indices: &[usize]) -> Features {
        let mut features = Features::default();
        for &i in indices {
            let pc = pose.transform_point(&self.world[i]);
            let Some(px) = self.camera.project(&pc) else {
                continue;
            };
            if !self.camera.in_image(&px) {
                continue;
            }
            features.keypoints.push(KeyPoint {
                x: px.x,
                y: px.y,
                octave: 0,
                angle: 0.0,
            });
            features.descriptors.push(self.descriptors[i]);
        }
        features
    }

    /// Features with descriptors unrelated to any landmark (a corrupted
    /// frame), deterministic per seed.
    pub fn garbage_features(n: usize, seed: u64) -> Features {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut features = Features::default();
        for _ in 0..n {
            features.keypoints.push(KeyPoint {
                x: rng.gen_range(0.0..640.0),
                y: rng.gen_range(0.0..480.0),
                octave: 0,
                angle: 0.0,
            });
            let mut d = [0u8; DESCRIPTOR_BYTES];
            rng.fill(&mut d);
            features.descriptors.push(Descriptor(d));
        }
        features
    }
}

/// A pose looking at the cloud from a lateral offset along x.
pub fn lateral_pose(offset_x: f64) -> SE3 {
    SE3 {
        rotation: nalgebra::UnitQuaternion::identity(),
        translation: Vector3::new(-offset_x, 0.0, 0.0),
    }
}
