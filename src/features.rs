//! Feature-level types shared by the whole pipeline.
//!
//! The ORB extractor itself is an external collaborator: anything that can
//! turn a grayscale image into [`Features`] (keypoints with scale/octave plus
//! 256-bit binary descriptors) plugs in behind the [`FeatureExtractor`]
//! trait. The rest of the system only ever sees these types.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Length of a binary descriptor in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A 256-bit binary feature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Hamming distance between two descriptors.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A detected keypoint, already undistorted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyPoint {
    /// Pixel position in the undistorted image.
    pub x: f64,
    pub y: f64,
    /// Pyramid level the point was detected at.
    pub octave: u32,
    /// Orientation in degrees.
    pub angle: f64,
}

impl KeyPoint {
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

/// Description of the extractor's scale pyramid.
#[derive(Debug, Clone, Copy)]
pub struct ScalePyramid {
    /// Scale factor between consecutive levels (typically 1.2).
    pub scale_factor: f64,
    /// Number of pyramid levels (typically 8).
    pub n_levels: u32,
}

impl ScalePyramid {
    /// Scale of a given pyramid level.
    pub fn scale_of(&self, octave: u32) -> f64 {
        self.scale_factor.powi(octave as i32)
    }

    /// Squared measurement noise of a keypoint at a given level, in pixels².
    pub fn sigma2_of(&self, octave: u32) -> f64 {
        let s = self.scale_of(octave);
        s * s
    }

    /// Ratio between the coarsest and finest level.
    pub fn level_range(&self) -> f64 {
        self.scale_factor.powi(self.n_levels as i32 - 1)
    }

    /// Pyramid level whose scale best matches `ratio = dist / min_dist`.
    pub fn predict_octave(&self, ratio: f64) -> u32 {
        if ratio <= 1.0 {
            return 0;
        }
        let level = (ratio.ln() / self.scale_factor.ln()).ceil() as i64;
        level.clamp(0, self.n_levels as i64 - 1) as u32
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            n_levels: 8,
        }
    }
}

/// Pinhole intrinsics plus radial/tangential distortion.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub width: u32,
    pub height: u32,
}

impl Camera {
    /// Project a camera-frame point to pixel coordinates (no distortion:
    /// keypoints are stored undistorted).
    pub fn project(&self, pc: &nalgebra::Vector3<f64>) -> Option<Vector2<f64>> {
        if pc.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(
            self.fx * pc.x / pc.z + self.cx,
            self.fy * pc.y / pc.z + self.cy,
        ))
    }

    /// Pixel coordinates → normalized image coordinates.
    pub fn unproject(&self, px: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy)
    }

    /// Undistort a raw pixel coordinate by iterating the distortion model.
    pub fn undistort_point(&self, px: &Vector2<f64>) -> Vector2<f64> {
        if self.k1 == 0.0 && self.k2 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0 {
            return *px;
        }
        let xd = (px.x - self.cx) / self.fx;
        let yd = (px.y - self.cy) / self.fy;
        let mut x = xd;
        let mut y = yd;
        for _ in 0..5 {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Vector2::new(self.fx * x + self.cx, self.fy * y + self.cy)
    }

    /// Whether a pixel lies inside the image bounds with a small margin.
    pub fn in_image(&self, px: &Vector2<f64>) -> bool {
        px.x >= 0.0 && px.x < self.width as f64 && px.y >= 0.0 && px.y < self.height as f64
    }
}

/// A single-channel 8-bit image handed in by the caller.
#[derive(Debug, Clone)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GrayImage {
    /// Wrap caller-provided pixel data. Channel counts other than 1 are the
    /// caller's responsibility to convert; 3-channel data is rejected here
    /// and handled as a skip by the system (see error handling design).
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }
}

/// The output of feature extraction on one image.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Contract of the external ORB extractor.
///
/// Implementations must return one descriptor per keypoint, keypoints in
/// undistorted pixel coordinates, and octaves below `pyramid().n_levels`.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> Features;
    fn pyramid(&self) -> ScalePyramid;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_descriptor_distance() {
        let a = Descriptor([0u8; 32]);
        let mut b = Descriptor([0u8; 32]);
        assert_eq!(a.distance(&b), 0);

        b.0[0] = 0b1010_1010;
        b.0[31] = 0xff;
        assert_eq!(a.distance(&b), 12);
    }

    #[test]
    fn test_undistort_identity_without_coefficients() {
        let cam = Camera {
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
        };
        let px = Vector2::new(100.0, 200.0);
        assert_relative_eq!(cam.undistort_point(&px), px, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_octave_monotonic() {
        let pyr = ScalePyramid::default();
        assert_eq!(pyr.predict_octave(1.0), 0);
        assert!(pyr.predict_octave(2.0) >= pyr.predict_octave(1.3));
        assert!(pyr.predict_octave(1e6) < pyr.n_levels);
    }

    #[test]
    fn test_project_unproject() {
        let cam = Camera {
            fx: 450.0,
            fy: 460.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            width: 640,
            height: 480,
        };
        let pc = nalgebra::Vector3::new(0.2, -0.1, 2.0);
        let px = cam.project(&pc).unwrap();
        let xn = cam.unproject(&px);
        assert_relative_eq!(xn.x, pc.x / pc.z, epsilon = 1e-12);
        assert_relative_eq!(xn.y, pc.y / pc.z, epsilon = 1e-12);
    }
}
