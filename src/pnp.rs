//! P4P RANSAC: camera pose from 3D-2D correspondences.
//!
//! Minimal 4-point samples are solved EPnP-style (barycentric control
//! points, null vector of the projection system, Horn alignment), scored
//! against the chi² inlier test, with the adaptive iteration rule
//! `k = log(1-p) / log(1-wⁿ)`. The solver exposes incremental `iterate`
//! batches so relocalization can round-robin candidates the way the
//! tracking pipeline expects.

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};
use rand::prelude::*;

use crate::features::Camera;
use crate::geometry::SE3;

pub struct PnpParams {
    pub probability: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
    pub sample_size: usize,
    pub epsilon: f64,
    /// chi²(0.95, 2 dof) threshold on the whitened squared error.
    pub chi2: f64,
}

impl Default for PnpParams {
    fn default() -> Self {
        Self {
            probability: 0.99,
            min_inliers: 10,
            max_iterations: 300,
            sample_size: 4,
            epsilon: 0.5,
            chi2: 5.991,
        }
    }
}

pub struct PnpResult {
    pub pose_cw: SE3,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

pub struct PnpSolver {
    camera: Camera,
    world: Vec<Vector3<f64>>,
    pixels: Vec<Vector2<f64>>,
    inv_sigma2: Vec<f64>,
    params: PnpParams,
    iterations_done: usize,
    adaptive_max: usize,
    best: Option<PnpResult>,
}

impl PnpSolver {
    /// Build a solver over `(world point, pixel, inv_sigma2)` tuples.
    pub fn new(camera: Camera, correspondences: Vec<(Vector3<f64>, Vector2<f64>, f64)>, params: PnpParams) -> Self {
        let mut world = Vec::with_capacity(correspondences.len());
        let mut pixels = Vec::with_capacity(correspondences.len());
        let mut inv_sigma2 = Vec::with_capacity(correspondences.len());
        for (w, px, is2) in correspondences {
            world.push(w);
            pixels.push(px);
            inv_sigma2.push(is2);
        }
        let adaptive_max = params.max_iterations;
        Self {
            camera,
            world,
            pixels,
            inv_sigma2,
            params,
            iterations_done: 0,
            adaptive_max,
            best: None,
        }
    }

    pub fn num_correspondences(&self) -> usize {
        self.world.len()
    }

    /// Run up to `n` RANSAC iterations. Returns the best refined pose found
    /// so far (if it meets the inlier minimum) and whether the iteration
    /// budget is exhausted.
    pub fn iterate(&mut self, n: usize) -> (Option<PnpResult>, bool) {
        let total = self.world.len();
        if total < self.params.sample_size || total < self.params.min_inliers {
            return (None, true);
        }
        let mut rng = rand::thread_rng();

        for _ in 0..n {
            if self.iterations_done >= self.adaptive_max.min(self.params.max_iterations) {
                break;
            }
            self.iterations_done += 1;

            let sample = sample_indices(&mut rng, total, self.params.sample_size);
            let sample_world: Vec<Vector3<f64>> = sample.iter().map(|&i| self.world[i]).collect();
            let sample_norm: Vec<Vector2<f64>> = sample
                .iter()
                .map(|&i| self.camera.unproject(&self.pixels[i]))
                .collect();

            let Some(pose) = solve_p4p(&sample_world, &sample_norm) else {
                continue;
            };

            let (inliers, count) = self.classify(&pose);
            if count > self.best.as_ref().map(|b| b.num_inliers).unwrap_or(0) {
                self.best = Some(PnpResult {
                    pose_cw: pose,
                    inliers,
                    num_inliers: count,
                });
                if count >= self.params.min_inliers {
                    let ratio = (count as f64 / total as f64).max(self.params.epsilon);
                    self.adaptive_max = self
                        .adaptive_max
                        .min(self.iterations_done + adaptive_iterations(ratio, self.params.probability, self.params.sample_size));
                }
            }
        }

        let no_more = self.iterations_done >= self.adaptive_max.min(self.params.max_iterations);
        let result = self.best_refined();
        (result, no_more)
    }

    /// Refine the best candidate over its inliers and reclassify.
    fn best_refined(&self) -> Option<PnpResult> {
        let best = self.best.as_ref()?;
        if best.num_inliers < self.params.min_inliers {
            return None;
        }
        let mut pose = best.pose_cw.clone();
        for _ in 0..5 {
            let Some(refined) = self.gn_step(&pose, &best.inliers) else {
                break;
            };
            pose = refined;
        }
        let (inliers, num_inliers) = self.classify(&pose);
        if num_inliers < self.params.min_inliers {
            return None;
        }
        Some(PnpResult {
            pose_cw: pose,
            inliers,
            num_inliers,
        })
    }

    fn classify(&self, pose: &SE3) -> (Vec<bool>, usize) {
        let mut inliers = vec![false; self.world.len()];
        let mut count = 0;
        for i in 0..self.world.len() {
            let pc = pose.transform_point(&self.world[i]);
            if let Some(px) = self.camera.project(&pc) {
                let chi2 = (px - self.pixels[i]).norm_squared() * self.inv_sigma2[i];
                if chi2 <= self.params.chi2 {
                    inliers[i] = true;
                    count += 1;
                }
            }
        }
        (inliers, count)
    }

    fn gn_step(&self, pose: &SE3, inliers: &[bool]) -> Option<SE3> {
        let mut h = nalgebra::Matrix6::<f64>::zeros();
        let mut b = nalgebra::Vector6::<f64>::zeros();
        let mut n = 0usize;
        for i in 0..self.world.len() {
            if !inliers[i] {
                continue;
            }
            let pc = pose.transform_point(&self.world[i]);
            if pc.z <= 1e-6 {
                continue;
            }
            let (fx, fy) = (self.camera.fx, self.camera.fy);
            let (x, y, z) = (pc.x, pc.y, pc.z);
            let inv_z = 1.0 / z;
            let inv_z2 = inv_z * inv_z;
            let u = fx * x * inv_z + self.camera.cx;
            let v = fy * y * inv_z + self.camera.cy;
            let r = Vector2::new(u - self.pixels[i].x, v - self.pixels[i].y);
            let j = nalgebra::Matrix2x6::new(
                -fx * x * y * inv_z2,
                fx * (1.0 + x * x * inv_z2),
                -fx * y * inv_z,
                fx * inv_z,
                0.0,
                -fx * x * inv_z2,
                -fy * (1.0 + y * y * inv_z2),
                fy * x * y * inv_z2,
                fy * x * inv_z,
                0.0,
                fy * inv_z,
                -fy * y * inv_z2,
            );
            let w = self.inv_sigma2[i];
            h += j.transpose() * j * w;
            b += j.transpose() * r * w;
            n += 1;
        }
        if n < 4 {
            return None;
        }
        let delta = h.lu().solve(&(-b))?;
        if !delta.iter().all(|d| d.is_finite()) {
            return None;
        }
        let update = SE3::exp(
            &Vector3::new(delta[0], delta[1], delta[2]),
            &Vector3::new(delta[3], delta[4], delta[5]),
        );
        Some(update.compose(pose))
    }
}

/// P4P: Grunert's P3P on the first three points, disambiguated by the
/// reprojection of the fourth.
fn solve_p4p(world: &[Vector3<f64>], normalized: &[Vector2<f64>]) -> Option<SE3> {
    if world.len() < 4 {
        return None;
    }
    let bearings: Vec<Vector3<f64>> = normalized
        .iter()
        .map(|xn| Vector3::new(xn.x, xn.y, 1.0).normalize())
        .collect();

    let mut best: Option<(f64, SE3)> = None;
    for pose in solve_p3p(&world[0..3], &bearings[0..3]) {
        let pc = pose.transform_point(&world[3]);
        if pc.z <= 0.0 {
            continue;
        }
        let err = (Vector2::new(pc.x / pc.z, pc.y / pc.z) - normalized[3]).norm_squared();
        if best.as_ref().map(|(e, _)| err < *e).unwrap_or(true) {
            best = Some((err, pose));
        }
    }
    best.map(|(_, pose)| pose)
}

/// Grunert's three-point solutions: camera poses consistent with three world
/// points and their bearing vectors. Up to four real solutions.
fn solve_p3p(world: &[Vector3<f64>], bearings: &[Vector3<f64>]) -> Vec<SE3> {
    let (pa, pb, pc) = (world[0], world[1], world[2]);
    let (f1, f2, f3) = (bearings[0], bearings[1], bearings[2]);

    let a_sq = (pb - pc).norm_squared();
    let b_sq = (pa - pc).norm_squared();
    let c_sq = (pa - pb).norm_squared();
    if a_sq < 1e-12 || b_sq < 1e-12 || c_sq < 1e-12 {
        return Vec::new();
    }

    let cos_al = f2.dot(&f3);
    let cos_be = f1.dot(&f3);
    let cos_ga = f1.dot(&f2);

    let q = (a_sq - c_sq) / b_sq;
    let r = (a_sq + c_sq) / b_sq;

    // Haralick's quartic in v = s3/s1.
    let a4 = (q - 1.0) * (q - 1.0) - 4.0 * (c_sq / b_sq) * cos_al * cos_al;
    let a3 = 4.0
        * (q * (1.0 - q) * cos_be - (1.0 - r) * cos_al * cos_ga
            + 2.0 * (c_sq / b_sq) * cos_al * cos_al * cos_be);
    let a2 = 2.0
        * (q * q - 1.0 + 2.0 * q * q * cos_be * cos_be + 2.0 * ((b_sq - c_sq) / b_sq) * cos_al * cos_al
            - 4.0 * r * cos_al * cos_be * cos_ga
            + 2.0 * ((b_sq - a_sq) / b_sq) * cos_ga * cos_ga);
    let a1 = 4.0
        * (-q * (1.0 + q) * cos_be + 2.0 * (a_sq / b_sq) * cos_ga * cos_ga * cos_be
            - (1.0 - r) * cos_al * cos_ga);
    let a0 = (1.0 + q) * (1.0 + q) - 4.0 * (a_sq / b_sq) * cos_ga * cos_ga;

    let mut poses = Vec::new();
    for v in real_quartic_roots(a4, a3, a2, a1, a0) {
        if v <= 0.0 {
            continue;
        }
        let denom = 1.0 + v * v - 2.0 * v * cos_be;
        if denom <= 1e-12 {
            continue;
        }
        let s1 = (b_sq / denom).sqrt();
        let u_denom = 2.0 * (cos_ga - v * cos_al);
        if u_denom.abs() < 1e-12 {
            continue;
        }
        let u = ((-1.0 + q) * v * v - 2.0 * q * cos_be * v + 1.0 + q) / u_denom;
        if u <= 0.0 {
            continue;
        }
        let (s2, s3) = (u * s1, v * s1);

        let cam = [f1 * s1, f2 * s2, f3 * s3];
        if let Some(pose) = horn_alignment(&[pa, pb, pc], &cam) {
            poses.push(pose);
        }
    }
    poses
}

/// Real roots of `a4 x⁴ + a3 x³ + a2 x² + a1 x + a0` via the companion
/// matrix.
fn real_quartic_roots(a4: f64, a3: f64, a2: f64, a1: f64, a0: f64) -> Vec<f64> {
    if a4.abs() < 1e-14 {
        return Vec::new();
    }
    let companion = nalgebra::Matrix4::new(
        -a3 / a4,
        -a2 / a4,
        -a1 / a4,
        -a0 / a4,
        1.0,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
    );
    companion
        .complex_eigenvalues()
        .iter()
        .filter(|c| c.im.abs() < 1e-8)
        .map(|c| c.re)
        .collect()
}

/// Closed-form rigid alignment mapping `from` onto `to`.
fn horn_alignment(from: &[Vector3<f64>], to: &[Vector3<f64>]) -> Option<SE3> {
    let n = from.len() as f64;
    let c_from: Vector3<f64> = from.iter().sum::<Vector3<f64>>() / n;
    let c_to: Vector3<f64> = to.iter().sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    for (f, t) in from.iter().zip(to.iter()) {
        h += (f - c_from) * (t - c_to).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        r = v * u.transpose();
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(r));
    let translation = c_to - rotation * c_from;
    Some(SE3 {
        rotation,
        translation,
    })
}

fn sample_indices(rng: &mut impl Rng, n: usize, k: usize) -> Vec<usize> {
    let mut chosen = Vec::with_capacity(k);
    while chosen.len() < k {
        let idx = rng.gen_range(0..n);
        if !chosen.contains(&idx) {
            chosen.push(idx);
        }
    }
    chosen
}

/// Adaptive RANSAC iteration bound `log(1-p) / log(1-wⁿ)`.
fn adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w_n = inlier_ratio.powi(sample_size as i32);
    let denom = (1.0 - w_n).ln();
    if denom.abs() < 1e-12 {
        return 1;
    }
    (((1.0 - probability).ln() / denom).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn camera() -> Camera {
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

    fn scene_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.05, -0.1, 0.08),
            translation: Vector3::new(0.2, -0.1, 0.3),
        }
    }

    fn correspondences(
        pose: &SE3,
        n: usize,
        outliers: usize,
    ) -> Vec<(Vector3<f64>, Vector2<f64>, f64)> {
        let cam = camera();
        let mut out = Vec::new();
        for i in 0..n {
            let p = Vector3::new(
                (i % 7) as f64 * 0.4 - 1.2,
                (i / 7) as f64 * 0.4 - 1.0,
                4.0 + (i % 5) as f64 * 0.3,
            );
            let px = cam.project(&pose.transform_point(&p)).unwrap();
            out.push((p, px, 1.0));
        }
        for i in 0..outliers {
            let p = Vector3::new(i as f64 * 0.3 - 1.0, 0.5, 5.0);
            let px = Vector2::new(50.0 + 20.0 * i as f64, 400.0);
            out.push((p, px, 1.0));
        }
        out
    }

    #[test]
    fn test_recovers_pose_without_outliers() {
        let pose = scene_pose();
        let mut solver = PnpSolver::new(camera(), correspondences(&pose, 30, 0), PnpParams::default());
        let (result, _) = solver.iterate(50);
        let result = result.expect("pose found");
        assert!(result.num_inliers >= 28);
        assert!((result.pose_cw.translation - pose.translation).norm() < 1e-2);
        assert!(result.pose_cw.rotation.angle_to(&pose.rotation) < 1e-2);
    }

    #[test]
    fn test_rejects_outliers() {
        let pose = scene_pose();
        let mut solver = PnpSolver::new(camera(), correspondences(&pose, 30, 8), PnpParams::default());
        let mut result = None;
        for _ in 0..60 {
            let (r, no_more) = solver.iterate(5);
            if let Some(r) = r {
                result = Some(r);
                break;
            }
            if no_more {
                break;
            }
        }
        let result = result.expect("pose found despite outliers");
        assert!(result.num_inliers >= 25);
        // The fabricated outliers stay excluded.
        let tail = &result.inliers[30..];
        assert!(tail.iter().filter(|&&b| b).count() <= 2);
    }

    #[test]
    fn test_too_few_points_is_no_more() {
        let pose = scene_pose();
        let mut solver = PnpSolver::new(camera(), correspondences(&pose, 5, 0), PnpParams::default());
        let (result, no_more) = solver.iterate(10);
        assert!(result.is_none());
        assert!(no_more);
    }
}
