//! Rotation solving between the sky frame and the mount frame.
//!
//! Two alignment points give an exact rotation through an orthonormal triad;
//! three or more solve Wahba's problem through the SVD of the 3x3
//! cross-covariance. Points that degrade the fit are excluded on the way in,
//! and gross outliers are pruned from the accepted set afterwards. The final
//! matrix must pass a residual gate before anyone is allowed to track with
//! it.

use chrono::{DateTime, Utc};
use nalgebra::{Matrix3, Vector3};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::celestial::{mount_unit_vector, sky_unit_vector};
use crate::store::AlignmentPoint;

/// Residual in degrees below which a candidate point is always kept (~10').
const ALWAYS_ACCEPT_DEG: f64 = 0.167;
/// A candidate may grow the average residual by at most this factor.
const RESIDUAL_GROWTH_LIMIT: f64 = 1.5;
/// Worst/best residual ratio that marks an outlier during pruning.
const OUTLIER_RATIO: f64 = 5.0;
/// Pair separations below this are too short to judge step loss.
const PAIR_SEP_FLOOR_DEG: f64 = 0.5;

/// Accept gate: above these the matrix is discarded.
const REJECT_RESIDUAL_DEG: f64 = 0.5;
const REJECT_PAIR_DIFF_DEG: f64 = 0.7;
/// Above these the matrix is usable but flagged marginal.
const MARGINAL_RESIDUAL_DEG: f64 = 0.25;
const MARGINAL_PAIR_DIFF_DEG: f64 = 0.3;
/// Above this residual the fit is merely OK rather than excellent.
const OK_RESIDUAL_DEG: f64 = 0.10;

/// Jacobi sweep limit and off-diagonal convergence threshold.
const JACOBI_MAX_SWEEPS: usize = 100;
const JACOBI_EPSILON: f64 = 1e-15;
/// Singular values below this are treated as rank deficiency.
const SINGULAR_FLOOR: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("need at least 2 alignment points, have {0}")]
    NotEnoughPoints(usize),
    #[error("the first two sky directions are collinear; pick stars further apart")]
    DegeneratePair,
    #[error(
        "alignment rejected: average residual {avg_residual_deg:.3} deg, \
         worst pair separation mismatch {max_pair_sep_diff_deg:.3} deg"
    )]
    Rejected {
        avg_residual_deg: f64,
        max_pair_sep_diff_deg: f64,
    },
}

/// Fit grade from the accept gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Excellent,
    Ok,
    Marginal,
}

/// A solved sky-to-mount rotation and its diagnostics.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Rotation taking sky unit vectors to mount unit vectors.
    pub matrix: Matrix3<f64>,
    pub quality: Quality,
    /// Mean angular residual over the accepted points, degrees.
    pub avg_residual_deg: f64,
    /// Worst |sky separation - mount separation| over accepted pairs, degrees.
    pub max_pair_sep_diff_deg: f64,
    /// Worst relative step loss over accepted pairs, percent.
    pub max_pair_loss_pct: f64,
    /// Indices of the points used.
    pub used: Vec<usize>,
    /// Indices excluded as outliers.
    pub excluded: Vec<usize>,
}

impl Alignment {
    /// Row-major single-precision form for the wire.
    pub fn matrix_f32(&self) -> [f32; 9] {
        let m = &self.matrix;
        [
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ]
    }
}

/// Solve for the rotation mapping sky directions to mount directions, with
/// all sky vectors reframed to `t_ref`.
pub fn solve(points: &[AlignmentPoint], t_ref: DateTime<Utc>) -> Result<Alignment, SolveError> {
    if points.len() < 2 {
        return Err(SolveError::NotEnoughPoints(points.len()));
    }

    let pairs: Vec<(Vector3<f64>, Vector3<f64>)> = points
        .iter()
        .map(|p| {
            (
                sky_unit_vector(p.ra_hours, p.dec_deg, t_ref, p.captured_at),
                mount_unit_vector(p.mount_x, p.mount_z),
            )
        })
        .collect();

    // Seed with the first two points; the triad solution is exact, so the
    // baseline residual is whatever numerical noise is left.
    let mut active: Vec<usize> = vec![0, 1];
    let mut excluded: Vec<usize> = Vec::new();
    let mut matrix =
        two_star_rotation(&pairs[0], &pairs[1]).ok_or(SolveError::DegeneratePair)?;
    let mut avg = mean_residual_deg(&matrix, &active, &pairs);

    // Quality-gated inclusion of the remaining points.
    for k in 2..pairs.len() {
        let mut candidate = active.clone();
        candidate.push(k);
        let m = wahba_rotation(&candidate, &pairs);
        let r = mean_residual_deg(&m, &candidate, &pairs);
        if r <= RESIDUAL_GROWTH_LIMIT * avg || r < ALWAYS_ACCEPT_DEG {
            debug!("Alignment point {k} accepted: average residual {r:.4} deg");
            active = candidate;
            matrix = m;
            avg = r;
        } else {
            warn!(
                "Excluding alignment point {k}: residual would grow from {avg:.4} to {r:.4} deg"
            );
            excluded.push(k);
        }
    }

    // Prune gross outliers that slipped into the accepted set.
    while active.len() >= 3 {
        let residuals: Vec<f64> = active
            .iter()
            .map(|&i| residual_deg(&matrix, &pairs[i]))
            .collect();
        let mut worst_pos = 0;
        let mut max = residuals[0];
        let mut min = residuals[0];
        for (pos, &r) in residuals.iter().enumerate() {
            if r > max {
                max = r;
                worst_pos = pos;
            }
            if r < min {
                min = r;
            }
        }
        if !(max > OUTLIER_RATIO * min && max > ALWAYS_ACCEPT_DEG) {
            break;
        }

        let removed = active.remove(worst_pos);
        warn!("Pruning alignment point {removed}: residual {max:.4} deg against best {min:.4} deg");
        excluded.push(removed);

        matrix = if active.len() == 2 {
            match two_star_rotation(&pairs[active[0]], &pairs[active[1]]) {
                Some(m) => m,
                None => break,
            }
        } else {
            wahba_rotation(&active, &pairs)
        };
        avg = mean_residual_deg(&matrix, &active, &pairs);
    }

    let (max_pair_diff, max_loss_pct) = pair_diagnostics(&active, &pairs);

    if avg > REJECT_RESIDUAL_DEG || max_pair_diff > REJECT_PAIR_DIFF_DEG {
        warn!(
            "Alignment rejected: average residual {avg:.3} deg, worst pair mismatch {max_pair_diff:.3} deg"
        );
        return Err(SolveError::Rejected {
            avg_residual_deg: avg,
            max_pair_sep_diff_deg: max_pair_diff,
        });
    }

    let quality = if avg > MARGINAL_RESIDUAL_DEG || max_pair_diff > MARGINAL_PAIR_DIFF_DEG {
        Quality::Marginal
    } else if avg > OK_RESIDUAL_DEG {
        Quality::Ok
    } else {
        Quality::Excellent
    };

    info!(
        "Alignment solved with {} of {} points: average residual {avg:.4} deg, quality {quality:?}",
        active.len(),
        points.len()
    );

    Ok(Alignment {
        matrix,
        quality,
        avg_residual_deg: avg,
        max_pair_sep_diff_deg: max_pair_diff,
        max_pair_loss_pct: max_loss_pct,
        used: active,
        excluded,
    })
}

/// Exact rotation from two (sky, mount) pairs via orthonormal triads.
/// Returns `None` when either pair of directions is collinear.
fn two_star_rotation(
    p1: &(Vector3<f64>, Vector3<f64>),
    p2: &(Vector3<f64>, Vector3<f64>),
) -> Option<Matrix3<f64>> {
    let sky_basis = triad_basis(&p1.0, &p2.0)?;
    let mount_basis = triad_basis(&p1.1, &p2.1)?;
    Some(mount_basis * sky_basis.transpose())
}

/// Right-handed orthonormal basis spanned by two directions.
fn triad_basis(v1: &Vector3<f64>, v2: &Vector3<f64>) -> Option<Matrix3<f64>> {
    let b1 = v1.normalize();
    let cross = v1.cross(v2);
    let norm = cross.norm();
    if norm < 1e-12 {
        return None;
    }
    let b2 = cross / norm;
    let b3 = b1.cross(&b2);
    Some(Matrix3::from_columns(&[b1, b2, b3]))
}

/// Wahba solution over the indexed pairs: the proper rotation closest to
/// mapping every sky vector onto its mount vector.
fn wahba_rotation(
    indices: &[usize],
    pairs: &[(Vector3<f64>, Vector3<f64>)],
) -> Matrix3<f64> {
    let mut h = Matrix3::zeros();
    for &i in indices {
        let (sky, mount) = &pairs[i];
        h += mount * sky.transpose();
    }

    let (u, _sigma, v) = svd3(&h);
    let d = (u.determinant() * v.determinant()).signum();
    u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d)) * v.transpose()
}

/// SVD of a 3x3 matrix: eigendecompose `HᵀH` with cyclic Jacobi rotations,
/// recover `U = H·V·Σ⁻¹`, and complete any rank-deficient columns of `U` so
/// it stays orthonormal.
fn svd3(h: &Matrix3<f64>) -> (Matrix3<f64>, Vector3<f64>, Matrix3<f64>) {
    let (eigenvalues, eigenvectors) = jacobi_eigen_sym3(h.transpose() * h);

    // Descending singular values.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let mut sigma = Vector3::zeros();
    let mut v = Matrix3::zeros();
    for (slot, &src) in order.iter().enumerate() {
        sigma[slot] = eigenvalues[src].max(0.0).sqrt();
        v.set_column(slot, &eigenvectors.column(src).clone_owned());
    }

    let mut u = Matrix3::zeros();
    for i in 0..3 {
        if sigma[i] > SINGULAR_FLOOR {
            let col = h * v.column(i) / sigma[i];
            u.set_column(i, &col);
        }
    }
    for i in 0..3 {
        if sigma[i] <= SINGULAR_FLOOR {
            let a = u.column((i + 1) % 3).clone_owned();
            let b = u.column((i + 2) % 3).clone_owned();
            let mut c = a.cross(&b);
            if c.norm() < 1e-12 {
                let longer = if a.norm() > b.norm() { a } else { b };
                c = any_orthonormal(&longer);
            }
            u.set_column(i, &(c / c.norm()));
        }
    }

    (u, sigma, v)
}

/// Some unit vector orthogonal to `v` (or X-hat when `v` vanishes).
fn any_orthonormal(v: &Vector3<f64>) -> Vector3<f64> {
    if v.norm() < 1e-12 {
        return Vector3::x();
    }
    let pick = if v.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let c = v.cross(&pick);
    c / c.norm()
}

/// Eigendecomposition of a symmetric 3x3 by cyclic Jacobi rotations.
/// Returns (eigenvalues, column eigenvectors), unsorted.
fn jacobi_eigen_sym3(mut a: Matrix3<f64>) -> (Vector3<f64>, Matrix3<f64>) {
    let mut v = Matrix3::identity();

    for _ in 0..JACOBI_MAX_SWEEPS {
        let off = a[(0, 1)]
            .abs()
            .max(a[(0, 2)].abs())
            .max(a[(1, 2)].abs());
        if off < JACOBI_EPSILON {
            break;
        }

        for &(p, q) in &[(0usize, 1usize), (0, 2), (1, 2)] {
            let apq = a[(p, q)];
            if apq == 0.0 {
                continue;
            }
            let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
            // Smaller-angle root of t^2 + 2tθ - 1 = 0.
            let t = if theta >= 0.0 {
                1.0 / (theta + (theta * theta + 1.0).sqrt())
            } else {
                -1.0 / (-theta + (theta * theta + 1.0).sqrt())
            };
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;

            let mut j = Matrix3::identity();
            j[(p, p)] = c;
            j[(q, q)] = c;
            j[(p, q)] = s;
            j[(q, p)] = -s;

            a = j.transpose() * a * j;
            v *= j;
        }
    }

    (Vector3::new(a[(0, 0)], a[(1, 1)], a[(2, 2)]), v)
}

/// Angular error of one pair under `r`, degrees.
fn residual_deg(r: &Matrix3<f64>, pair: &(Vector3<f64>, Vector3<f64>)) -> f64 {
    let (sky, mount) = pair;
    (r * sky).dot(mount).clamp(-1.0, 1.0).acos().to_degrees()
}

fn mean_residual_deg(
    r: &Matrix3<f64>,
    indices: &[usize],
    pairs: &[(Vector3<f64>, Vector3<f64>)],
) -> f64 {
    let sum: f64 = indices.iter().map(|&i| residual_deg(r, &pairs[i])).sum();
    sum / indices.len() as f64
}

/// Compare great-circle separations between every accepted pair of points as
/// seen in the sky and by the encoders. A consistent mismatch means the
/// mount is losing steps or the encoders are slipping.
fn pair_diagnostics(
    indices: &[usize],
    pairs: &[(Vector3<f64>, Vector3<f64>)],
) -> (f64, f64) {
    let mut max_diff: f64 = 0.0;
    let mut max_loss_pct: f64 = 0.0;

    for (pos, &i) in indices.iter().enumerate() {
        for &j in &indices[pos + 1..] {
            let (sky_i, mount_i) = &pairs[i];
            let (sky_j, mount_j) = &pairs[j];
            let sky_sep = sky_i.dot(sky_j).clamp(-1.0, 1.0).acos().to_degrees();
            let mount_sep = mount_i.dot(mount_j).clamp(-1.0, 1.0).acos().to_degrees();

            max_diff = max_diff.max((sky_sep - mount_sep).abs());
            if sky_sep > PAIR_SEP_FLOOR_DEG {
                let loss_pct = (1.0 - mount_sep / sky_sep) * 100.0;
                max_loss_pct = max_loss_pct.max(loss_pct.abs());
            }
        }
    }

    (max_diff, max_loss_pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Unit};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_rotation(rng: &mut ChaCha8Rng) -> Matrix3<f64> {
        let axis = Unit::new_normalize(Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        ));
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        Rotation3::from_axis_angle(&axis, angle).into_inner()
    }

    fn random_unit(rng: &mut ChaCha8Rng) -> Vector3<f64> {
        loop {
            let v = Vector3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            if v.norm() > 0.1 {
                return v.normalize();
            }
        }
    }

    #[test]
    fn test_triad_recovers_exact_rotation() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let r = random_rotation(&mut rng);
            let v1 = random_unit(&mut rng);
            let mut v2 = random_unit(&mut rng);
            while v1.cross(&v2).norm() < 0.1 {
                v2 = random_unit(&mut rng);
            }
            let recovered =
                two_star_rotation(&(v1, r * v1), &(v2, r * v2)).expect("non-collinear");
            assert_relative_eq!(recovered, r, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_triad_rejects_collinear() {
        let v = Vector3::x();
        assert!(two_star_rotation(&(v, v), &(v, v)).is_none());
    }

    #[test]
    fn test_jacobi_diagonalizes() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..50 {
            let m = Matrix3::from_fn(|_, _| rng.gen_range(-2.0..2.0));
            let sym = m.transpose() * m;
            let (lambda, v) = jacobi_eigen_sym3(sym);

            // V diagonalizes: sym ≈ V Λ Vᵀ, V orthonormal.
            let reconstructed = v * Matrix3::from_diagonal(&lambda) * v.transpose();
            assert_relative_eq!(reconstructed, sym, epsilon = 1e-9);
            assert_relative_eq!(v * v.transpose(), Matrix3::identity(), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_svd3_reconstructs() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..50 {
            let h = Matrix3::from_fn(|_, _| rng.gen_range(-2.0..2.0));
            let (u, sigma, v) = svd3(&h);
            let reconstructed = u * Matrix3::from_diagonal(&sigma) * v.transpose();
            assert_relative_eq!(reconstructed, h, epsilon = 1e-8);
            assert!(sigma[0] >= sigma[1] && sigma[1] >= sigma[2]);
        }
    }

    #[test]
    fn test_svd3_rank_two() {
        // Cross-covariance of two pairs is rank 2; U must still be a proper
        // orthonormal basis.
        let a = Vector3::x();
        let b = Vector3::y();
        let h = a * a.transpose() + b * b.transpose();
        let (u, sigma, _v) = svd3(&h);
        assert!(sigma[2].abs() < 1e-9);
        assert_relative_eq!(u * u.transpose(), Matrix3::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_wahba_exact_three_points() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for _ in 0..25 {
            let r = random_rotation(&mut rng);
            let pairs: Vec<_> = (0..3)
                .map(|_| {
                    let v = random_unit(&mut rng);
                    (v, r * v)
                })
                .collect();
            let recovered = wahba_rotation(&[0, 1, 2], &pairs);
            assert_relative_eq!(recovered, r, epsilon = 1e-8);
            assert_relative_eq!(recovered.determinant(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_wahba_never_returns_a_reflection() {
        // Noisy correspondences can push an unguarded solution to det = -1.
        let mut rng = ChaCha8Rng::seed_from_u64(33);
        for _ in 0..25 {
            let pairs: Vec<_> = (0..4)
                .map(|_| (random_unit(&mut rng), random_unit(&mut rng)))
                .collect();
            let r = wahba_rotation(&[0, 1, 2, 3], &pairs);
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-8);
        }
    }
}
