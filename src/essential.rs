// essential.rs — Essential matrix estimation and geometric outlier rejection.
//
// The essential matrix E encodes the epipolar constraint between two
// calibrated views: x'ᵀ E x = 0, where x and x' are normalized (bearing)
// coordinates in the previous and current frames.
//
// Two solvers:
//
//   five_point  — minimal solver (Gröbner basis / action matrix).
//     1. Each correspondence gives one row of a 5×9 system A·vec(E) = 0;
//        its 4-dimensional nullspace spans E = x·E1 + y·E2 + z·E3 + E4
//     2. det(E) = 0 and 2·E·Eᵀ·E − tr(E·Eᵀ)·E = 0 give ten cubics in the
//        twenty monomials of x, y, z up to degree 3
//     3. Gauss-Jordan elimination expresses the ten cubic-leading monomials
//        in the quotient basis [x², xy, y², xz, yz, z², x, y, z, 1]
//     4. The 10×10 action matrix of multiplication by x has the solutions'
//        x as eigenvalues and their basis monomials as eigenvectors
//     5. Each real eigenvalue yields one E; up to ten per sample
//
//   eight_point — normalized 8-point (Hartley 1997), used for the inlier
//                 refit and as an alternative RANSAC solver.
//     1. Hartley normalization (translate + scale for conditioning)
//     2. Smallest right singular vector of the stacked constraint rows
//     3. Undo normalization, project onto the essential manifold (σ, σ, 0)
//
// RANSAC wrapper for robust estimation with outlier rejection. Sampling is
// driven by a seeded ChaCha8 generator so runs are reproducible.

use std::ops::{Add, Mul, Sub};

use log::trace;
use nalgebra::{DMatrix, Matrix3, Schur, Vector3};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::tracker::Correspondence;

/// Minimal solver run inside the RANSAC loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EssentialSolver {
    #[default]
    FivePoint,
    EightPoint,
}

impl EssentialSolver {
    pub fn sample_size(self) -> usize {
        match self {
            EssentialSolver::FivePoint => 5,
            EssentialSolver::EightPoint => 8,
        }
    }
}

/// Result of essential matrix estimation.
#[derive(Debug, Clone)]
pub struct EssentialResult {
    /// The 3×3 essential matrix (normalized coordinates, unit Frobenius norm).
    pub e: Matrix3<f64>,
    /// Inlier mask: true for inliers, false for outliers.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub total: usize,
    /// RANSAC iterations used.
    pub iterations: usize,
}

impl EssentialResult {
    pub fn inlier_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.num_inliers as f64 / self.total as f64
        }
    }
}

/// RANSAC configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RansacConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold on the Sampson distance, in squared normalized units.
    pub threshold: f64,
    /// Confidence level in (0, 1). RANSAC stops early once the probability
    /// of having drawn an all-inlier sample exceeds this.
    pub confidence: f64,
    /// Seed for the sampling generator.
    pub seed: u64,
    pub solver: EssentialSolver,
}

impl Default for RansacConfig {
    fn default() -> Self {
        RansacConfig {
            max_iterations: 1000,
            threshold: 4e-6,
            confidence: 0.99,
            seed: 42,
            solver: EssentialSolver::FivePoint,
        }
    }
}

/// Constraint row for x2ᵀ E x1 = 0 with E flattened row-major.
fn epipolar_row(x1: f64, y1: f64, x2: f64, y2: f64) -> [f64; 9] {
    [x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0]
}

/// Right singular vectors of the stacked rows for the `dim` smallest
/// singular values, smallest first.
fn nullspace(rows: &[[f64; 9]], dim: usize) -> Option<Vec<[f64; 9]>> {
    // Pad to at least 9 rows so V is square.
    let mut a = DMatrix::<f64>::zeros(rows.len().max(9), 9);
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            a[(i, j)] = v;
        }
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let mut order: Vec<usize> = (0..9).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));

    Some(
        order[..dim]
            .iter()
            .map(|&k| std::array::from_fn(|j| v_t[(k, j)]))
            .collect(),
    )
}

// ============================================================
// 8-point algorithm
// ============================================================

/// Estimate the essential matrix from >= 8 normalized correspondences
/// using the normalized 8-point algorithm (no RANSAC).
///
/// Returns None for fewer than 8 points or a degenerate configuration.
pub fn eight_point(correspondences: &[Correspondence]) -> Option<Matrix3<f64>> {
    if correspondences.len() < 8 {
        return None;
    }

    let (t1, t2) = hartley_transforms(correspondences);
    let rows: Vec<[f64; 9]> = correspondences
        .iter()
        .map(|c| {
            let p1 = t1 * Vector3::new(c.prev.x, c.prev.y, 1.0);
            let p2 = t2 * Vector3::new(c.curr.x, c.curr.y, 1.0);
            epipolar_row(p1.x, p1.y, p2.x, p2.y)
        })
        .collect();
    if !rows.iter().flatten().all(|v| v.is_finite()) {
        return None;
    }

    let basis = nullspace(&rows, 1)?;
    let e_norm = Matrix3::from_row_slice(&basis[0]);

    // E_orig = T2ᵀ · E_norm · T1
    project_to_essential(&(t2.transpose() * e_norm * t1))
}

/// Closest essential matrix: singular values forced to (1, 1, 0), then
/// scaled to unit Frobenius norm.
fn project_to_essential(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let smallest = svd.singular_values.imin();
    if svd.singular_values.sum() - svd.singular_values[smallest] < 1e-15 {
        return None;
    }
    let mut diag = Vector3::repeat(1.0);
    diag[smallest] = 0.0;
    let projected = u * Matrix3::from_diagonal(&diag) * v_t;
    Some(projected / projected.norm())
}

/// Hartley normalization transforms for both views, as 3×3 matrices:
/// centroid moved to the origin, mean distance from it scaled to √2.
fn hartley_transforms(corrs: &[Correspondence]) -> (Matrix3<f64>, Matrix3<f64>) {
    let n = corrs.len() as f64;
    let (mut mx1, mut my1, mut mx2, mut my2) = (0.0, 0.0, 0.0, 0.0);
    for c in corrs {
        mx1 += c.prev.x;
        my1 += c.prev.y;
        mx2 += c.curr.x;
        my2 += c.curr.y;
    }
    mx1 /= n;
    my1 /= n;
    mx2 /= n;
    my2 /= n;

    let mut d1 = 0.0;
    let mut d2 = 0.0;
    for c in corrs {
        d1 += ((c.prev.x - mx1).powi(2) + (c.prev.y - my1).powi(2)).sqrt();
        d2 += ((c.curr.x - mx2).powi(2) + (c.curr.y - my2).powi(2)).sqrt();
    }
    d1 /= n;
    d2 /= n;

    let s1 = if d1 > 1e-15 { std::f64::consts::SQRT_2 / d1 } else { 1.0 };
    let s2 = if d2 > 1e-15 { std::f64::consts::SQRT_2 / d2 } else { 1.0 };

    let transform = |s: f64, mx: f64, my: f64| {
        Matrix3::new(
            s, 0.0, -s * mx,
            0.0, s, -s * my,
            0.0, 0.0, 1.0,
        )
    };
    (transform(s1, mx1, my1), transform(s2, mx2, my2))
}

// ============================================================
// 5-point algorithm
// ============================================================

/// Polynomial in (x, y, z) of total degree ≤ 3, indexed [a][b][c] for xᵃ yᵇ zᶜ.
#[derive(Debug, Clone, Copy, Default)]
struct Cubic([[[f64; 4]; 4]; 4]);

fn exponents() -> impl Iterator<Item = (usize, usize, usize)> {
    (0..4).flat_map(|a| (0..4 - a).flat_map(move |b| (0..4 - a - b).map(move |c| (a, b, c))))
}

impl Cubic {
    /// x·ex + y·ey + z·ez + w
    fn linear(ex: f64, ey: f64, ez: f64, w: f64) -> Self {
        let mut p = Cubic::default();
        p.0[1][0][0] = ex;
        p.0[0][1][0] = ey;
        p.0[0][0][1] = ez;
        p.0[0][0][0] = w;
        p
    }
}

impl Add for Cubic {
    type Output = Cubic;
    fn add(mut self, rhs: Cubic) -> Cubic {
        for (a, b, c) in exponents() {
            self.0[a][b][c] += rhs.0[a][b][c];
        }
        self
    }
}

impl Sub for Cubic {
    type Output = Cubic;
    fn sub(mut self, rhs: Cubic) -> Cubic {
        for (a, b, c) in exponents() {
            self.0[a][b][c] -= rhs.0[a][b][c];
        }
        self
    }
}

impl Mul<f64> for Cubic {
    type Output = Cubic;
    fn mul(mut self, rhs: f64) -> Cubic {
        for (a, b, c) in exponents() {
            self.0[a][b][c] *= rhs;
        }
        self
    }
}

/// Product truncated to degree 3. Every product formed by the solver has
/// degree ≤ 3, so nothing is actually dropped.
impl Mul for Cubic {
    type Output = Cubic;
    fn mul(self, rhs: Cubic) -> Cubic {
        let mut out = Cubic::default();
        for (a, b, c) in exponents() {
            let lhs = self.0[a][b][c];
            if lhs == 0.0 {
                continue;
            }
            for (d, e, f) in exponents() {
                if a + b + c + d + e + f <= 3 {
                    out.0[a + d][b + e][c + f] += lhs * rhs.0[d][e][f];
                }
            }
        }
        out
    }
}

/// Monomials of degree ≤ 3 in (x, y, z) as (a, b, c) for xᵃ yᵇ zᶜ.
///
/// The first ten are the leading monomials eliminated by Gauss-Jordan; the
/// last ten form the quotient basis [x², xy, y², xz, yz, z², x, y, z, 1].
const MONOMIALS: [(usize, usize, usize); 20] = [
    (3, 0, 0), (2, 1, 0), (1, 2, 0), (0, 3, 0), (2, 0, 1),
    (1, 1, 1), (0, 2, 1), (1, 0, 2), (0, 1, 2), (0, 0, 3),
    (2, 0, 0), (1, 1, 0), (0, 2, 0), (1, 0, 1), (0, 1, 1),
    (0, 0, 2), (1, 0, 0), (0, 1, 0), (0, 0, 1), (0, 0, 0),
];

/// Reduced rows giving x times basis monomials 0..6 (x³, x²y, xy², x²z, xyz, xz²).
const ACTION_REDUCED_ROWS: [usize; 6] = [0, 1, 2, 4, 5, 7];
/// (action row, basis column) where x times a basis monomial is again a
/// basis monomial: x·x = x², x·y = xy, x·z = xz, x·1 = x.
const ACTION_UNIT_ENTRIES: [(usize, usize); 4] = [(6, 0), (7, 1), (8, 3), (9, 6)];
const BASIS_X: usize = 6;
const BASIS_Y: usize = 7;
const BASIS_Z: usize = 8;
const BASIS_ONE: usize = 9;

/// The ten cubic constraints on E = x·B0 + y·B1 + z·B2 + B3, as a 10×20
/// coefficient matrix over `MONOMIALS`.
fn essential_constraints(basis: &[Matrix3<f64>; 4]) -> DMatrix<f64> {
    let e: [[Cubic; 3]; 3] = std::array::from_fn(|i| {
        std::array::from_fn(|j| Cubic::linear(basis[0][(i, j)], basis[1][(i, j)], basis[2][(i, j)], basis[3][(i, j)]))
    });

    let det = e[0][0] * (e[1][1] * e[2][2] - e[1][2] * e[2][1])
        - e[0][1] * (e[1][0] * e[2][2] - e[1][2] * e[2][0])
        + e[0][2] * (e[1][0] * e[2][1] - e[1][1] * e[2][0]);

    let eet: [[Cubic; 3]; 3] = std::array::from_fn(|i| {
        std::array::from_fn(|j| e[i][0] * e[j][0] + e[i][1] * e[j][1] + e[i][2] * e[j][2])
    });
    let trace = eet[0][0] + eet[1][1] + eet[2][2];

    let mut equations = [Cubic::default(); 10];
    equations[0] = det;
    for i in 0..3 {
        for j in 0..3 {
            let eete = eet[i][0] * e[0][j] + eet[i][1] * e[1][j] + eet[i][2] * e[2][j];
            equations[1 + 3 * i + j] = eete * 2.0 - trace * e[i][j];
        }
    }

    DMatrix::from_fn(10, 20, |row, col| {
        let (a, b, c) = MONOMIALS[col];
        equations[row].0[a][b][c]
    })
}

/// Estimate essential matrices from exactly five normalized correspondences.
///
/// Returns every real solution (at most ten), each with unit Frobenius
/// norm. Extra correspondences beyond the first five are ignored.
pub fn five_point(correspondences: &[Correspondence]) -> Vec<Matrix3<f64>> {
    if correspondences.len() < 5 {
        return Vec::new();
    }
    let rows: Vec<[f64; 9]> = correspondences[..5]
        .iter()
        .map(|c| epipolar_row(c.prev.x, c.prev.y, c.curr.x, c.curr.y))
        .collect();
    if !rows.iter().flatten().all(|v| v.is_finite()) {
        return Vec::new();
    }
    let Some(null) = nullspace(&rows, 4) else {
        return Vec::new();
    };
    let basis: [Matrix3<f64>; 4] = std::array::from_fn(|k| Matrix3::from_row_slice(&null[k]));

    // Gauss-Jordan on the leading block: lead_i = -G[i] · basis.
    let system = essential_constraints(&basis);
    let lead = system.columns(0, 10).into_owned();
    let rest = system.columns(10, 10).into_owned();
    let Some(g) = lead.lu().solve(&rest) else {
        return Vec::new();
    };
    if !g.iter().all(|v| v.is_finite()) {
        return Vec::new();
    }

    // Action matrix of multiplication by x on the quotient basis.
    let mut action = DMatrix::<f64>::zeros(10, 10);
    for (r, &row) in ACTION_REDUCED_ROWS.iter().enumerate() {
        for j in 0..10 {
            action[(r, j)] = -g[(row, j)];
        }
    }
    for &(r, col) in &ACTION_UNIT_ENTRIES {
        action[(r, col)] = 1.0;
    }

    let Some(schur) = Schur::try_new(action.clone(), f64::EPSILON, 10_000) else {
        return Vec::new();
    };

    let mut solutions = Vec::new();
    for lambda in schur.complex_eigenvalues().iter() {
        if !lambda.re.is_finite() || lambda.im.abs() > 1e-8 * lambda.re.abs().max(1.0) {
            continue;
        }
        let mut shifted = action.clone();
        for i in 0..10 {
            shifted[(i, i)] -= lambda.re;
        }
        let svd = shifted.svd(false, true);
        let Some(v_t) = svd.v_t else { continue };
        let k = svd.singular_values.imin();
        let one = v_t[(k, BASIS_ONE)];
        if one.abs() < 1e-12 {
            continue;
        }
        let x = v_t[(k, BASIS_X)] / one;
        let y = v_t[(k, BASIS_Y)] / one;
        let z = v_t[(k, BASIS_Z)] / one;

        let e = basis[0] * x + basis[1] * y + basis[2] * z + basis[3];
        let norm = e.norm();
        if norm > 1e-15 && norm.is_finite() {
            solutions.push(e / norm);
        }
    }
    solutions
}

// ============================================================
// RANSAC
// ============================================================

struct Scored {
    e: Matrix3<f64>,
    inliers: Vec<bool>,
    num_inliers: usize,
    /// Sum of inlier residuals plus `threshold` per outlier.
    cost: f64,
}

impl Scored {
    fn evaluate(e: Matrix3<f64>, correspondences: &[Correspondence], threshold: f64) -> Self {
        let mut inliers = vec![false; correspondences.len()];
        let mut num_inliers = 0;
        let mut cost = 0.0;
        for (flag, c) in inliers.iter_mut().zip(correspondences) {
            let d = sampson_distance(&e, c);
            if d < threshold {
                *flag = true;
                num_inliers += 1;
                cost += d;
            } else {
                cost += threshold;
            }
        }
        Scored { e, inliers, num_inliers, cost }
    }

    fn beats(&self, other: &Scored) -> bool {
        self.num_inliers > other.num_inliers || (self.num_inliers == other.num_inliers && self.cost < other.cost)
    }
}

/// Iterations needed to draw one all-inlier sample with `confidence`.
fn adaptive_iterations(num_inliers: usize, total: usize, sample_size: usize, confidence: f64) -> usize {
    let w = num_inliers as f64 / total as f64;
    if w <= 0.0 {
        return usize::MAX;
    }
    let p_fail = (1.0 - w.powi(sample_size as i32)).max(1e-15);
    let k = (1.0 - confidence).ln() / p_fail.ln();
    if k.is_finite() {
        (k.ceil() as usize).max(1)
    } else {
        usize::MAX
    }
}

/// Estimate the essential matrix with RANSAC outlier rejection.
///
/// Correspondences must be in normalized camera coordinates (K⁻¹ applied,
/// undistorted if needed). Returns None when there are too few points for
/// the configured solver or no sample produced a hypothesis.
pub fn estimate_essential_ransac(correspondences: &[Correspondence], config: &RansacConfig) -> Option<EssentialResult> {
    let n = correspondences.len();
    let solver = match config.solver {
        EssentialSolver::EightPoint if n >= 8 => EssentialSolver::EightPoint,
        _ => EssentialSolver::FivePoint,
    };
    let sample_size = solver.sample_size();
    if n < sample_size {
        return None;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut best: Option<Scored> = None;
    let mut adaptive_max = config.max_iterations.max(1);
    let mut iterations = 0;
    let mut sample = Vec::with_capacity(sample_size);

    while iterations < adaptive_max {
        iterations += 1;

        sample.clear();
        sample.extend(index::sample(&mut rng, n, sample_size).iter().map(|i| correspondences[i]));

        let hypotheses = match solver {
            EssentialSolver::FivePoint => five_point(&sample),
            EssentialSolver::EightPoint => eight_point(&sample).into_iter().collect(),
        };

        for e in hypotheses {
            let scored = Scored::evaluate(e, correspondences, config.threshold);
            let improves_count = best.as_ref().map_or(true, |b| scored.num_inliers > b.num_inliers);
            if best.as_ref().map_or(true, |b| scored.beats(b)) {
                if improves_count {
                    adaptive_max = adaptive_iterations(scored.num_inliers, n, sample_size, config.confidence)
                        .min(config.max_iterations)
                        .max(1);
                }
                best = Some(scored);
            }
        }
    }

    let mut best = best?;
    trace!(
        "ransac: {} / {} inliers after {} iterations ({:?})",
        best.num_inliers,
        n,
        iterations,
        solver
    );

    // Refit on all inliers; keep it only if support does not drop.
    if best.num_inliers >= 8 {
        let inlier_corrs: Vec<Correspondence> = correspondences
            .iter()
            .zip(&best.inliers)
            .filter(|(_, &is_inlier)| is_inlier)
            .map(|(c, _)| *c)
            .collect();
        if let Some(e_refined) = eight_point(&inlier_corrs) {
            let refit = Scored::evaluate(e_refined, correspondences, config.threshold);
            if refit.num_inliers >= best.num_inliers {
                best = refit;
            }
        }
    }

    Some(EssentialResult {
        e: best.e,
        inliers: best.inliers,
        num_inliers: best.num_inliers,
        total: n,
        iterations,
    })
}

// ============================================================
// Sampson distance
// ============================================================

/// Sampson distance: a first-order approximation to the geometric distance.
///
/// Given E and a correspondence (x1, x2):
///   d = (x2ᵀ E x1)² / ( (E x1)₁² + (E x1)₂² + (Eᵀ x2)₁² + (Eᵀ x2)₂² )
///
/// Squared, in normalized units.
pub fn sampson_distance(e: &Matrix3<f64>, c: &Correspondence) -> f64 {
    let x1 = Vector3::new(c.prev.x, c.prev.y, 1.0);
    let x2 = Vector3::new(c.curr.x, c.curr.y, 1.0);
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let num = x2.dot(&ex1);

    let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if denom < 1e-30 {
        return f64::MAX;
    }
    (num * num) / denom
}

/// Epipolar error (signed): x2ᵀ E x1. Zero for perfect correspondences.
pub fn epipolar_error(e: &Matrix3<f64>, c: &Correspondence) -> f64 {
    let x1 = Vector3::new(c.prev.x, c.prev.y, 1.0);
    let x2 = Vector3::new(c.curr.x, c.curr.y, 1.0);
    x2.dot(&(e * x1))
}
