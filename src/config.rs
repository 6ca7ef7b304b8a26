//! Settings file loading.
//!
//! The settings use the familiar flat YAML layout with dotted keys
//! (`Camera.fx: 517.3`). An unreadable file or a missing camera key is
//! terminal; the system refuses to start without calibration.

use std::path::Path;

use thiserror::Error;
use yaml_rust::{Yaml, YamlLoader};

use crate::features::Camera;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file: {0}")]
    Io(String),
    #[error("settings parse error: {0}")]
    Parse(String),
    #[error("missing required setting `{0}`")]
    MissingKey(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// ORB extractor parameters, forwarded to the external extractor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbParams {
    pub n_features: u32,
    pub scale_factor: f64,
    pub n_levels: u32,
    pub fast_threshold: u32,
    pub score_type: ScoreType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    Harris,
    Fast,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub camera: Camera,
    pub fps: f64,
    /// Incoming color order (only affects the caller's grayscale conversion).
    pub rgb: bool,
    pub orb: OrbParams,
    pub use_motion_model: bool,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        // Tolerate the OpenCV FileStorage header line.
        let body: String = text
            .lines()
            .filter(|l| !l.trim_start().starts_with("%YAML"))
            .collect::<Vec<_>>()
            .join("\n");
        let docs =
            YamlLoader::load_from_str(&body).map_err(|e| SettingsError::Parse(e.to_string()))?;
        let doc = docs
            .first()
            .ok_or_else(|| SettingsError::Parse("empty settings file".into()))?;

        let fps_raw = get_f64(doc, "Camera.fps").unwrap_or(0.0);
        let fps = if fps_raw == 0.0 { 30.0 } else { fps_raw };

        let score_raw = get_i64(doc, "ORBextractor.nScoreType").unwrap_or(1);
        let score_type = match score_raw {
            0 => ScoreType::Harris,
            1 => ScoreType::Fast,
            other => {
                return Err(SettingsError::InvalidValue {
                    key: "ORBextractor.nScoreType",
                    reason: format!("expected 0 (HARRIS) or 1 (FAST), got {}", other),
                })
            }
        };

        Ok(Self {
            camera: Camera {
                fx: require_f64(doc, "Camera.fx")?,
                fy: require_f64(doc, "Camera.fy")?,
                cx: require_f64(doc, "Camera.cx")?,
                cy: require_f64(doc, "Camera.cy")?,
                k1: get_f64(doc, "Camera.k1").unwrap_or(0.0),
                k2: get_f64(doc, "Camera.k2").unwrap_or(0.0),
                p1: get_f64(doc, "Camera.p1").unwrap_or(0.0),
                p2: get_f64(doc, "Camera.p2").unwrap_or(0.0),
                width: get_i64(doc, "Camera.width").unwrap_or(640) as u32,
                height: get_i64(doc, "Camera.height").unwrap_or(480) as u32,
            },
            fps,
            rgb: get_i64(doc, "Camera.RGB").unwrap_or(1) != 0,
            orb: OrbParams {
                n_features: get_i64(doc, "ORBextractor.nFeatures").unwrap_or(1000) as u32,
                scale_factor: get_f64(doc, "ORBextractor.scaleFactor").unwrap_or(1.2),
                n_levels: get_i64(doc, "ORBextractor.nLevels").unwrap_or(8) as u32,
                fast_threshold: get_i64(doc, "ORBextractor.fastTh").unwrap_or(20) as u32,
                score_type,
            },
            use_motion_model: get_i64(doc, "UseMotionModel").unwrap_or(0) != 0,
        })
    }

    /// Keyframe-insertion and relocalization horizon in frames.
    pub fn max_frames(&self) -> u64 {
        (18.0 * self.fps / 30.0).round() as u64
    }

    pub fn min_frames(&self) -> u64 {
        0
    }
}

fn get_f64(doc: &Yaml, key: &'static str) -> Option<f64> {
    match &doc[key] {
        Yaml::Real(_) => doc[key].as_f64(),
        Yaml::Integer(v) => Some(*v as f64),
        _ => None,
    }
}

fn require_f64(doc: &Yaml, key: &'static str) -> Result<f64, SettingsError> {
    get_f64(doc, key).ok_or(SettingsError::MissingKey(key))
}

fn get_i64(doc: &Yaml, key: &'static str) -> Option<i64> {
    doc[key].as_i64()
}
