//! Keyframe trajectory export.
//!
//! At shutdown every non-erased map is written to
//! `KeyFrameTrajectory_<i>.txt` (index within the database, erased slots
//! skipped but counted), one line per non-bad keyframe sorted by id:
//! `<timestamp> <tx> <ty> <tz> <qx> <qy> <qz> <qw>` with the camera center
//! in world coordinates and the quaternion of the transposed world→camera
//! rotation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::map::MapDatabase;

pub fn save_trajectories(db: &MapDatabase, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for (i, shared_map) in db.all_maps().iter().enumerate() {
        if shared_map.is_erased() {
            continue;
        }
        let path = dir.join(format!("KeyFrameTrajectory_{}.txt", i));
        let mut file = BufWriter::new(File::create(&path)?);

        let map = shared_map.read();
        let mut keyframes: Vec<_> = map.keyframes().collect();
        keyframes.sort_by_key(|kf| kf.id);

        for kf in keyframes {
            let center = kf.pose_cw.camera_center();
            // World→camera rotation transposed = camera→world rotation.
            let q = kf.pose_cw.inverse().quaternion_xyzw();
            writeln!(
                file,
                "{:.6} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7}",
                kf.timestamp, center.x, center.y, center.z, q[0], q[1], q[2], q[3]
            )?;
        }
        file.flush()?;
        written.push(path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Camera, Descriptor, Features, KeyPoint, ScalePyramid, DESCRIPTOR_BYTES};
    use crate::geometry::SE3;
    use crate::map::{Frame, KeyFrame, KeyFrameId};
    use crate::vocabulary::Vocabulary;
    use nalgebra::Vector3;
    use std::sync::Arc;

    #[test]
    fn test_writes_sorted_non_bad_keyframes() {
        let vocab = Arc::new(Vocabulary::from_words(vec![Descriptor(
            [0u8; DESCRIPTOR_BYTES],
        )]));
        let db = MapDatabase::new(vocab);
        let erased = db.create_map();
        db.erase_map(erased.id());
        let live = db.create_map();

        let camera = Camera {
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
        {
            let mut map = live.write();
            for i in 0..3 {
                let features = Features {
                    keypoints: vec![KeyPoint {
                        x: 1.0,
                        y: 1.0,
                        octave: 0,
                        angle: 0.0,
                    }],
                    descriptors: vec![Descriptor([0u8; DESCRIPTOR_BYTES])],
                };
                let mut frame =
                    Frame::new(i, i as f64 * 0.5, features, camera, ScalePyramid::default());
                frame.pose_cw = Some(SE3 {
                    rotation: nalgebra::UnitQuaternion::identity(),
                    translation: Vector3::new(-(i as f64), 0.0, 0.0),
                });
                let kf = KeyFrame::from_frame(KeyFrameId::next(), &frame, map.id);
                map.insert_keyframe(kf);
            }
        }

        let dir = std::env::temp_dir().join(format!("trajectory_test_{}", std::process::id()));
        let written = save_trajectories(&db, &dir).unwrap();

        // The erased map produced no file; the live map kept its index.
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("KeyFrameTrajectory_1.txt"));

        let contents = std::fs::read_to_string(&written[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        // Camera center of Tcw = [I | -i] is +i along x; timestamps at 6
        // decimals, values at 7.
        assert!(lines[0].starts_with("0.000000 0.0000000"));
        assert!(lines[2].starts_with("1.000000 2.0000000"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
