//! Feature-replay dataset.
//!
//! Lets the binary drive the pipeline from pre-extracted features: an
//! `index.csv` with one row per frame (`timestamp,features_file`) and one
//! CSV per frame with the keypoints and hex-encoded descriptors. This keeps
//! the core runnable and benchmarkable without a native feature extractor.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::features::{Descriptor, Features, KeyPoint, DESCRIPTOR_BYTES};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("replay csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("bad descriptor hex at {file:?}:{row}")]
    BadDescriptor { file: PathBuf, row: usize },
}

#[derive(Debug, Deserialize)]
struct IndexRow {
    timestamp: f64,
    features_file: String,
}

#[derive(Debug, Deserialize)]
struct FeatureRow {
    x: f64,
    y: f64,
    octave: u32,
    angle: f64,
    descriptor: String,
}

pub struct ReplayDataset {
    root: PathBuf,
    index: Vec<IndexRow>,
}

impl ReplayDataset {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, ReplayError> {
        let root = root.as_ref().to_path_buf();
        let mut reader = csv::Reader::from_path(root.join("index.csv"))?;
        let mut index = Vec::new();
        for row in reader.deserialize() {
            index.push(row?);
        }
        Ok(Self { root, index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Load one frame's timestamp and features.
    pub fn frame(&self, i: usize) -> Result<(f64, Features), ReplayError> {
        let entry = &self.index[i];
        let path = self.root.join(&entry.features_file);
        let mut reader = csv::Reader::from_path(&path)?;

        let mut features = Features::default();
        for (row_idx, row) in reader.deserialize().enumerate() {
            let row: FeatureRow = row?;
            let descriptor = parse_descriptor(&row.descriptor).ok_or_else(|| {
                ReplayError::BadDescriptor {
                    file: path.clone(),
                    row: row_idx,
                }
            })?;
            features.keypoints.push(KeyPoint {
                x: row.x,
                y: row.y,
                octave: row.octave,
                angle: row.angle,
            });
            features.descriptors.push(descriptor);
        }
        Ok((entry.timestamp, features))
    }
}

fn parse_descriptor(hex: &str) -> Option<Descriptor> {
    let hex = hex.trim();
    if hex.len() != DESCRIPTOR_BYTES * 2 {
        return None;
    }
    let mut bytes = [0u8; DESCRIPTOR_BYTES];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(Descriptor(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("replay_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("index.csv"),
            "timestamp,features_file\n0.033000,frame0.csv\n",
        )
        .unwrap();
        let descriptor_hex = "ab".repeat(DESCRIPTOR_BYTES);
        std::fs::write(
            dir.join("frame0.csv"),
            format!(
                "x,y,octave,angle,descriptor\n120.5,80.25,2,45.0,{}\n",
                descriptor_hex
            ),
        )
        .unwrap();

        let dataset = ReplayDataset::open(&dir).unwrap();
        assert_eq!(dataset.len(), 1);
        let (ts, features) = dataset.frame(0).unwrap();
        assert!((ts - 0.033).abs() < 1e-9);
        assert_eq!(features.len(), 1);
        assert_eq!(features.keypoints[0].octave, 2);
        assert_eq!(features.descriptors[0].0[0], 0xab);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bad_descriptor_is_an_error() {
        let dir = std::env::temp_dir().join(format!("replay_bad_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("index.csv"),
            "timestamp,features_file\n0.0,frame0.csv\n",
        )
        .unwrap();
        std::fs::write(dir.join("frame0.csv"), "x,y,octave,angle,descriptor\n1,1,0,0,zz\n").unwrap();

        let dataset = ReplayDataset::open(&dir).unwrap();
        assert!(matches!(
            dataset.frame(0),
            Err(ReplayError::BadDescriptor { .. })
        ));

        std::fs::remove_dir_all(&dir).ok();
    }
}
