//! Frame - an ephemeral, timestamped image with extracted features.
//!
//! Frames are created once per image and only two are retained by Tracking
//! (the current and the previous one). A Frame promoted to the map becomes a
//! [`KeyFrame`](super::keyframe::KeyFrame).

use std::sync::Arc;

use nalgebra::{Vector2, Vector3};

use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::vocabulary::{BowVector, FeatureVector, Vocabulary};

use super::landmark::Landmark;
use super::types::LandmarkId;

/// Result of projecting a landmark into a frame's frustum.
#[derive(Debug, Clone, Copy)]
pub struct FrustumProjection {
    pub u: f64,
    pub v: f64,
    /// Pyramid level predicted from the viewing distance.
    pub predicted_octave: u32,
    /// Cosine between the viewing ray and the landmark normal.
    pub view_cos: f64,
}

#[derive(Clone)]
pub struct Frame {
    /// Monotonic frame counter.
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub camera: Camera,
    pub pyramid: ScalePyramid,

    /// Current pose estimate (world → camera); `None` until tracking or
    /// relocalization provides one.
    pub pose_cw: Option<SE3>,

    /// Per-keypoint landmark association.
    pub landmarks: Vec<Option<LandmarkId>>,
    /// Per-keypoint outlier flag set by pose optimization.
    pub outliers: Vec<bool>,

    /// Lazily computed Bag-of-Words representation.
    pub bow: Option<BowVector>,
    pub feature_vec: Option<FeatureVector>,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: f64,
        features: Features,
        camera: Camera,
        pyramid: ScalePyramid,
    ) -> Self {
        let n = features.keypoints.len();
        Self {
            id,
            timestamp,
            keypoints: features.keypoints,
            descriptors: features.descriptors,
            camera,
            pyramid,
            pose_cw: None,
            landmarks: vec![None; n],
            outliers: vec![false; n],
            bow: None,
            feature_vec: None,
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    /// Compute the BoW representation if not already present. Idempotent.
    pub fn ensure_bow(&mut self, vocabulary: &Arc<Vocabulary>) {
        if self.bow.is_none() {
            let (bow, fv) = vocabulary.transform(&self.descriptors);
            self.bow = Some(bow);
            self.feature_vec = Some(fv);
        }
    }

    /// Indices of keypoints within `radius` pixels of `(u, v)`, optionally
    /// restricted to a pyramid-level range.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_octave: Option<u32>,
        max_octave: Option<u32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                if let Some(min) = min_octave {
                    if kp.octave < min {
                        return false;
                    }
                }
                if let Some(max) = max_octave {
                    if kp.octave > max {
                        return false;
                    }
                }
                let du = kp.x - u;
                let dv = kp.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Check whether a landmark falls inside the frame's frustum.
    ///
    /// Requires a pose estimate. Rejects points behind the camera, outside
    /// the image, outside the landmark's valid distance range, or viewed too
    /// obliquely relative to its normal.
    pub fn project_in_frustum(
        &self,
        landmark: &Landmark,
        min_view_cos: f64,
    ) -> Option<FrustumProjection> {
        let pose = self.pose_cw.as_ref()?;
        let pc = pose.transform_point(&landmark.position);
        let px = self.camera.project(&pc)?;
        if !self.camera.in_image(&px) {
            return None;
        }

        let center = pose.camera_center();
        let po = landmark.position - center;
        let dist = po.norm();
        if !landmark.is_in_distance_range(dist) {
            return None;
        }

        let view_cos = if landmark.normal.norm() > 1e-12 {
            po.dot(&landmark.normal) / (dist * landmark.normal.norm())
        } else {
            1.0
        };
        if view_cos < min_view_cos {
            return None;
        }

        let predicted_octave = landmark.predict_octave(dist, &self.pyramid);
        Some(FrustumProjection {
            u: px.x,
            v: px.y,
            predicted_octave,
            view_cos,
        })
    }

    /// Normalized image coordinates of a keypoint.
    pub fn normalized(&self, idx: usize) -> Vector2<f64> {
        self.camera.unproject(&self.keypoints[idx].position())
    }

    /// Camera center in world coordinates, if the pose is known.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.as_ref().map(|p| p.camera_center())
    }

    /// Drop associations flagged as outliers by pose optimization.
    pub fn discard_outliers(&mut self) -> usize {
        let mut removed = 0;
        for i in 0..self.landmarks.len() {
            if self.outliers[i] && self.landmarks[i].is_some() {
                self.landmarks[i] = None;
                self.outliers[i] = false;
                removed += 1;
            }
        }
        removed
    }

    /// Number of (non-outlier) landmark associations.
    pub fn num_matches(&self) -> usize {
        self.landmarks
            .iter()
            .zip(self.outliers.iter())
            .filter(|(lm, out)| lm.is_some() && !**out)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DESCRIPTOR_BYTES;

    fn test_camera() -> Camera {
        Camera {
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
        }
    }

    fn frame_with_keypoints(pts: &[(f64, f64)]) -> Frame {
        let features = Features {
            keypoints: pts
                .iter()
                .map(|&(x, y)| KeyPoint {
                    x,
                    y,
                    octave: 0,
                    angle: 0.0,
                })
                .collect(),
            descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES]); pts.len()],
        };
        Frame::new(0, 0.0, features, test_camera(), ScalePyramid::default())
    }

    #[test]
    fn test_features_in_area() {
        let frame = frame_with_keypoints(&[(100.0, 100.0), (105.0, 100.0), (300.0, 300.0)]);
        let near = frame.features_in_area(100.0, 100.0, 10.0, None, None);
        assert_eq!(near, vec![0, 1]);

        let exact = frame.features_in_area(300.0, 300.0, 1.0, None, None);
        assert_eq!(exact, vec![2]);
    }

    #[test]
    fn test_discard_outliers() {
        let mut frame = frame_with_keypoints(&[(0.0, 0.0), (1.0, 1.0)]);
        frame.landmarks[0] = Some(LandmarkId::next());
        frame.landmarks[1] = Some(LandmarkId::next());
        frame.outliers[1] = true;

        assert_eq!(frame.num_matches(), 1);
        assert_eq!(frame.discard_outliers(), 1);
        assert!(frame.landmarks[1].is_none());
        assert_eq!(frame.num_matches(), 1);
    }
}
