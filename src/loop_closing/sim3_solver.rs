//! Sim(3) estimation between matched 3D point sets.
//!
//! Horn's closed-form absolute orientation inside a RANSAC loop. Monocular
//! maps drift in scale, so the scale is solved for rather than fixed; the
//! refinement step re-fits the transform on the full inlier set.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::geometry::Sim3;

#[derive(Debug, Clone)]
pub struct Sim3SolverConfig {
    pub max_iterations: usize,
    /// Point-to-point inlier threshold; maps are normalized to unit median
    /// depth, so this is a fraction of the scene scale.
    pub inlier_threshold: f64,
    /// Inliers required after refinement for the transform to be accepted.
    pub min_inliers: usize,
    pub probability: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            inlier_threshold: 0.05,
            min_inliers: 20,
            probability: 0.99,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sim3Result {
    pub sim3: Sim3,
    pub inliers: Vec<usize>,
    pub num_inliers: usize,
}

/// Estimate the similarity `points2 ≈ S · points1` with RANSAC.
pub fn compute_sim3_ransac(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    config: &Sim3SolverConfig,
) -> Option<Sim3Result> {
    let n = points1.len();
    if n < config.min_inliers || n != points2.len() {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut best: Option<Sim3Result> = None;
    let mut max_iterations = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iterations {
        iteration += 1;
        let idx = sample_three(&mut rng, n);
        let s1: Vec<_> = idx.iter().map(|&i| points1[i]).collect();
        let s2: Vec<_> = idx.iter().map(|&i| points2[i]).collect();

        let Some(sim3) = horn_sim3(&s1, &s2) else {
            continue;
        };
        let inliers = find_inliers(points1, points2, &sim3, config.inlier_threshold);

        if inliers.len() > best.as_ref().map(|b| b.num_inliers).unwrap_or(0) {
            let num_inliers = inliers.len();
            best = Some(Sim3Result {
                sim3,
                inliers,
                num_inliers,
            });
            if num_inliers >= config.min_inliers {
                let ratio = num_inliers as f64 / n as f64;
                max_iterations =
                    max_iterations.min(iteration + adaptive_iterations(ratio, config.probability));
            }
        }
    }

    // Refine on all inliers and reclassify.
    let mut best = best?;
    if best.num_inliers < config.min_inliers {
        return None;
    }
    let in1: Vec<_> = best.inliers.iter().map(|&i| points1[i]).collect();
    let in2: Vec<_> = best.inliers.iter().map(|&i| points2[i]).collect();
    if let Some(refined) = horn_sim3(&in1, &in2) {
        let inliers = find_inliers(points1, points2, &refined, config.inlier_threshold);
        if inliers.len() >= best.num_inliers {
            best = Sim3Result {
                sim3: refined,
                num_inliers: inliers.len(),
                inliers,
            };
        }
    }

    (best.num_inliers >= config.min_inliers).then_some(best)
}

/// Horn's closed-form similarity: centroid alignment, scale from the point
/// spreads, rotation from the SVD of the cross-covariance.
fn horn_sim3(points1: &[Vector3<f64>], points2: &[Vector3<f64>]) -> Option<Sim3> {
    let n = points1.len();
    if n < 3 {
        return None;
    }

    let c1: Vector3<f64> = points1.iter().sum::<Vector3<f64>>() / n as f64;
    let c2: Vector3<f64> = points2.iter().sum::<Vector3<f64>>() / n as f64;
    let centered1: Vec<_> = points1.iter().map(|p| p - c1).collect();
    let centered2: Vec<_> = points2.iter().map(|p| p - c2).collect();

    let spread1: f64 = centered1.iter().map(|p| p.norm_squared()).sum();
    let spread2: f64 = centered2.iter().map(|p| p.norm_squared()).sum();
    if spread1 < 1e-12 {
        return None;
    }
    let scale = (spread2 / spread1).sqrt();

    let mut h = Matrix3::zeros();
    for i in 0..n {
        h += centered1[i] * centered2[i].transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        rotation = v * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(rotation));
    let translation = c2 - scale * (rotation * c1);
    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

fn find_inliers(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    sim3: &Sim3,
    threshold: f64,
) -> Vec<usize> {
    let threshold_sq = threshold * threshold;
    points1
        .iter()
        .zip(points2.iter())
        .enumerate()
        .filter(|(_, (p1, p2))| (sim3.transform_point(p1) - **p2).norm_squared() < threshold_sq)
        .map(|(i, _)| i)
        .collect()
}

fn sample_three(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut idx = [rng.gen_range(0..n), 0, 0];
    loop {
        idx[1] = rng.gen_range(0..n);
        if idx[1] != idx[0] {
            break;
        }
    }
    loop {
        idx[2] = rng.gen_range(0..n);
        if idx[2] != idx[0] && idx[2] != idx[1] {
            break;
        }
    }
    idx
}

fn adaptive_iterations(inlier_ratio: f64, probability: f64) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w3 = inlier_ratio.powi(3);
    let denom = (1.0 - w3).ln();
    if denom.abs() < 1e-12 {
        return 1;
    }
    (((1.0 - probability).ln() / denom).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cloud() -> Vec<Vector3<f64>> {
        (0..40)
            .map(|i| {
                Vector3::new(
                    (i % 5) as f64 * 0.3,
                    (i / 5) as f64 * 0.25,
                    1.0 + ((i * 3) % 7) as f64 * 0.2,
                )
            })
            .collect()
    }

    #[test]
    fn test_recovers_similarity() {
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(0.5, -1.0, 0.2),
            scale: 1.4,
        };
        let p1 = cloud();
        let p2: Vec<_> = p1.iter().map(|p| truth.transform_point(p)).collect();

        let result = compute_sim3_ransac(&p1, &p2, &Sim3SolverConfig::default()).unwrap();
        assert_eq!(result.num_inliers, p1.len());
        assert_relative_eq!(result.sim3.scale, truth.scale, epsilon = 1e-9);
        assert_relative_eq!(result.sim3.translation, truth.translation, epsilon = 1e-9);
    }

    #[test]
    fn test_survives_outliers() {
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.15, 0.0),
            translation: Vector3::new(1.0, 0.0, -0.5),
            scale: 0.8,
        };
        let mut p1 = cloud();
        let mut p2: Vec<_> = p1.iter().map(|p| truth.transform_point(p)).collect();
        // A handful of gross mismatches.
        for i in 0..6 {
            p1.push(Vector3::new(i as f64, -3.0, 2.0));
            p2.push(Vector3::new(-5.0, i as f64, 1.0));
        }

        let result = compute_sim3_ransac(&p1, &p2, &Sim3SolverConfig::default()).unwrap();
        assert!(result.num_inliers >= 38);
        assert_relative_eq!(result.sim3.scale, truth.scale, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_points() {
        let p: Vec<Vector3<f64>> = (0..5).map(|i| Vector3::new(i as f64, 0.0, 1.0)).collect();
        assert!(compute_sim3_ransac(&p, &p, &Sim3SolverConfig::default()).is_none());
    }
}
