use std::mem::size_of;

use nalgebra::{DMatrix, DMatrixView, DVector};
use rayon::prelude::*;

use crate::errors::FalkonError;
use crate::options::FalkonOptions;

/// Row count of the blocks used when materializing a full kernel matrix.
/// Fused products derive their block size from the memory budget instead.
const FULL_BLOCK_ROWS: usize = 512;

/// A pairwise kernel function family.
///
/// Implementors provide the dense `block` evaluation and parameter
/// validation; the `full`/`mmv`/`dmmv` contracts are derived from those.
/// All three accept an optional pre-allocated output buffer which, when
/// given, is written in place and handed back (same allocation), so hot
/// loops can run without reallocating.
pub trait Kernel: Send + Sync {
    /// Checks the kernel parameters against the data dimensionality `d`.
    /// Must fail before any kernel arithmetic runs.
    fn validate(&self, d: usize) -> Result<(), FalkonError> {
        let _ = d;
        Ok(())
    }

    /// Dense kernel block between `a` (n x d) and `b` (m x d). Inputs are
    /// assumed validated.
    fn block(&self, a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64>;

    /// The full n x m kernel matrix `K(a, b)`.
    fn full(
        &self,
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        out: Option<DMatrix<f64>>,
    ) -> Result<DMatrix<f64>, FalkonError> {
        self.check_pair(a, b)?;
        let (n, m) = (a.nrows(), b.nrows());
        let mut k = take_out(out, n, m, "kernel matrix")?;
        let ranges = row_ranges(n, FULL_BLOCK_ROWS);
        let partials: Vec<DMatrix<f64>> = ranges
            .par_iter()
            .map(|&(start, len)| self.block(a.rows(start, len), b.rows(0, m)))
            .collect();
        for (&(start, len), part) in ranges.iter().zip(&partials) {
            k.rows_mut(start, len).copy_from(part);
        }
        Ok(k)
    }

    /// Fused product `K(a, b) * v` (n x t), evaluated in row blocks sized to
    /// the memory budget so the full kernel matrix is never stored.
    fn mmv(
        &self,
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        v: &DMatrix<f64>,
        out: Option<DMatrix<f64>>,
        opts: &FalkonOptions,
    ) -> Result<DMatrix<f64>, FalkonError> {
        self.check_pair(a, b)?;
        let (n, m) = (a.nrows(), b.nrows());
        if v.nrows() != m {
            return Err(FalkonError::InputShape(format!(
                "mmv: `v` has {} rows, expected {}",
                v.nrows(),
                m
            )));
        }
        let mut res = take_out(out, n, v.ncols(), "mmv result")?;
        let ranges = row_ranges(n, block_rows(n, m, opts));
        let partials: Vec<DMatrix<f64>> = ranges
            .par_iter()
            .map(|&(start, len)| self.block(a.rows(start, len), b.rows(0, m)) * v)
            .collect();
        for (&(start, len), part) in ranges.iter().zip(&partials) {
            res.rows_mut(start, len).copy_from(part);
        }
        Ok(res)
    }

    /// Fused normal-equations product `K(a, b)^T * (K(a, b) * v + w)`
    /// (m x t). Either `v` or `w` may be omitted and is treated as zero.
    /// Blocks over the rows of `a` and accumulates partial sums, so only an
    /// `l x m` slab of the kernel exists at a time.
    fn dmmv(
        &self,
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        v: Option<&DMatrix<f64>>,
        w: Option<&DMatrix<f64>>,
        out: Option<DMatrix<f64>>,
        opts: &FalkonOptions,
    ) -> Result<DMatrix<f64>, FalkonError> {
        self.check_pair(a, b)?;
        let (n, m) = (a.nrows(), b.nrows());
        let t = match (v, w) {
            (Some(v), _) => v.ncols(),
            (None, Some(w)) => w.ncols(),
            (None, None) => {
                return Err(FalkonError::InputShape(
                    "dmmv: at least one of `v` and `w` must be given".to_string(),
                ))
            }
        };
        if let Some(v) = v {
            if v.nrows() != m || v.ncols() != t {
                return Err(FalkonError::InputShape(format!(
                    "dmmv: `v` has shape {}x{}, expected {}x{}",
                    v.nrows(),
                    v.ncols(),
                    m,
                    t
                )));
            }
        }
        if let Some(w) = w {
            if w.nrows() != n || w.ncols() != t {
                return Err(FalkonError::InputShape(format!(
                    "dmmv: `w` has shape {}x{}, expected {}x{}",
                    w.nrows(),
                    w.ncols(),
                    n,
                    t
                )));
            }
        }
        let mut res = take_out(out, m, t, "dmmv result")?;
        let ranges = row_ranges(n, block_rows(n, m, opts));
        let sum = ranges
            .par_iter()
            .map(|&(start, len)| {
                let kb = self.block(a.rows(start, len), b.rows(0, m));
                let mut inner = match v {
                    Some(v) => &kb * v,
                    None => DMatrix::zeros(len, t),
                };
                if let Some(w) = w {
                    inner += w.rows(start, len);
                }
                kb.transpose() * inner
            })
            .reduce(|| DMatrix::zeros(m, t), |acc, part| acc + part);
        res.copy_from(&sum);
        Ok(res)
    }

    /// Shape checks shared by all entry points.
    fn check_pair(&self, a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<(), FalkonError> {
        if a.nrows() == 0 || b.nrows() == 0 || a.ncols() == 0 {
            return Err(FalkonError::InputShape(
                "kernel inputs must be non-empty".to_string(),
            ));
        }
        if a.ncols() != b.ncols() {
            return Err(FalkonError::InputShape(format!(
                "kernel inputs have mismatched dimensionality: {} vs {}",
                a.ncols(),
                b.ncols()
            )));
        }
        self.validate(a.ncols())
    }
}

fn take_out(
    out: Option<DMatrix<f64>>,
    nrows: usize,
    ncols: usize,
    what: &str,
) -> Result<DMatrix<f64>, FalkonError> {
    match out {
        Some(buf) if buf.nrows() == nrows && buf.ncols() == ncols => Ok(buf),
        Some(buf) => Err(FalkonError::InputShape(format!(
            "output buffer for {} has shape {}x{}, expected {}x{}",
            what,
            buf.nrows(),
            buf.ncols(),
            nrows,
            ncols
        ))),
        None => Ok(DMatrix::zeros(nrows, ncols)),
    }
}

/// Rows per block such that one `block x m` slab stays inside the budget.
fn block_rows(n: usize, m: usize, opts: &FalkonOptions) -> usize {
    let bytes_per_row = m.max(1) * size_of::<f64>();
    (opts.max_mem_bytes / bytes_per_row).clamp(1, n.max(1))
}

fn row_ranges(n: usize, block: usize) -> Vec<(usize, usize)> {
    (0..n)
        .step_by(block.max(1))
        .map(|start| (start, block.min(n - start)))
        .collect()
}

/// `||a_i - b_j||^2` for all row pairs, clamped at zero against roundoff.
fn squared_distances(a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
    let mut g = &a * b.transpose();
    let an: Vec<f64> = a.row_iter().map(|r| r.norm_squared()).collect();
    let bn: Vec<f64> = b.row_iter().map(|r| r.norm_squared()).collect();
    for j in 0..g.ncols() {
        for i in 0..g.nrows() {
            g[(i, j)] = (an[i] + bn[j] - 2.0 * g[(i, j)]).max(0.0);
        }
    }
    g
}

fn gram(a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
    &a * b.transpose()
}

/// Bandwidth of the Gaussian kernel, normalized at construction so that
/// evaluation is always "rescale rows, take squared distances".
#[derive(Debug, Clone)]
enum LengthScale {
    /// One shared bandwidth sigma.
    Iso(f64),
    /// Per-dimension bandwidths.
    Diag(DVector<f64>),
    /// Mahalanobis form: lower Cholesky factor `L` of the precision matrix,
    /// so that `(x-y)^T S (x-y) = ||(x-y)^T L||^2`.
    Tri(DMatrix<f64>),
}

/// Gaussian (RBF) kernel `exp(-||x - y||^2 / (2 sigma^2))`, with
/// per-dimension and full-matrix (Mahalanobis) bandwidth variants.
#[derive(Debug, Clone)]
pub struct GaussianKernel {
    scale: LengthScale,
}

impl GaussianKernel {
    pub fn new(sigma: f64) -> Result<Self, FalkonError> {
        if !(sigma > 0.0) {
            return Err(FalkonError::Configuration(format!(
                "gaussian bandwidth must be positive, got {}",
                sigma
            )));
        }
        Ok(GaussianKernel {
            scale: LengthScale::Iso(sigma),
        })
    }

    /// Per-dimension bandwidths: `k = exp(-0.5 * sum_d ((x-y)_d / sigma_d)^2)`.
    pub fn with_vector(sigmas: DVector<f64>) -> Result<Self, FalkonError> {
        if sigmas.is_empty() {
            return Err(FalkonError::Configuration(
                "gaussian bandwidth vector must be non-empty".to_string(),
            ));
        }
        if sigmas.iter().any(|&s| !(s > 0.0)) {
            return Err(FalkonError::Configuration(
                "gaussian bandwidth vector entries must be positive".to_string(),
            ));
        }
        Ok(GaussianKernel {
            scale: LengthScale::Diag(sigmas),
        })
    }

    /// Full precision matrix: `k = exp(-0.5 (x-y)^T S (x-y))`. `S` must be
    /// symmetric positive-definite; it is factored once, here.
    pub fn with_matrix(s: DMatrix<f64>) -> Result<Self, FalkonError> {
        if s.nrows() != s.ncols() {
            return Err(FalkonError::InputShape(format!(
                "gaussian bandwidth matrix must be square, got {}x{}",
                s.nrows(),
                s.ncols()
            )));
        }
        let chol = nalgebra::linalg::Cholesky::new(s).ok_or_else(|| {
            FalkonError::NumericalInstability(
                "gaussian bandwidth matrix is not positive-definite".to_string(),
            )
        })?;
        Ok(GaussianKernel {
            scale: LengthScale::Tri(chol.unpack()),
        })
    }

    fn rescale(&self, x: DMatrixView<'_, f64>) -> DMatrix<f64> {
        match &self.scale {
            LengthScale::Iso(sigma) => x.map(|v| v / sigma),
            LengthScale::Diag(sigmas) => {
                let mut out = x.into_owned();
                for (j, s) in sigmas.iter().enumerate() {
                    out.column_mut(j).apply(|v| *v /= *s);
                }
                out
            }
            LengthScale::Tri(l) => &x * l,
        }
    }
}

impl Kernel for GaussianKernel {
    fn validate(&self, d: usize) -> Result<(), FalkonError> {
        let expected = match &self.scale {
            LengthScale::Iso(_) => return Ok(()),
            LengthScale::Diag(sigmas) => sigmas.len(),
            LengthScale::Tri(l) => l.nrows(),
        };
        if expected != d {
            return Err(FalkonError::InputShape(format!(
                "gaussian bandwidth covers {} dimensions but the data has {}",
                expected, d
            )));
        }
        Ok(())
    }

    fn block(&self, a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
        let sa = self.rescale(a);
        let sb = self.rescale(b);
        let mut k = squared_distances(sa.rows(0, sa.nrows()), sb.rows(0, sb.nrows()));
        k.apply(|v| *v = (-0.5 * *v).exp());
        k
    }
}

/// Laplacian kernel `exp(-||x - y|| / sigma)`.
#[derive(Debug, Clone)]
pub struct LaplacianKernel {
    sigma: f64,
}

impl LaplacianKernel {
    pub fn new(sigma: f64) -> Result<Self, FalkonError> {
        if !(sigma > 0.0) {
            return Err(FalkonError::Configuration(format!(
                "laplacian bandwidth must be positive, got {}",
                sigma
            )));
        }
        Ok(LaplacianKernel { sigma })
    }
}

impl Kernel for LaplacianKernel {
    fn block(&self, a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
        let mut k = squared_distances(a, b);
        let inv_sigma = 1.0 / self.sigma;
        k.apply(|v| *v = (-v.sqrt() * inv_sigma).exp());
        k
    }
}

/// Linear kernel `beta + <x, y> / sigma^2`.
#[derive(Debug, Clone)]
pub struct LinearKernel {
    beta: f64,
    sigma: f64,
}

impl LinearKernel {
    pub fn new(beta: f64, sigma: f64) -> Result<Self, FalkonError> {
        if !(sigma > 0.0) {
            return Err(FalkonError::Configuration(format!(
                "linear kernel scale must be positive, got {}",
                sigma
            )));
        }
        Ok(LinearKernel { beta, sigma })
    }
}

impl Kernel for LinearKernel {
    fn block(&self, a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
        let mut k = gram(a, b);
        let inv_s2 = 1.0 / (self.sigma * self.sigma);
        k.apply(|v| *v = self.beta + *v * inv_s2);
        k
    }
}

/// Exponential (inner-product) kernel `exp(alpha * <x, y>)`.
#[derive(Debug, Clone)]
pub struct ExponentialKernel {
    alpha: f64,
}

impl ExponentialKernel {
    pub fn new(alpha: f64) -> Result<Self, FalkonError> {
        if !alpha.is_finite() {
            return Err(FalkonError::Configuration(format!(
                "exponential kernel coefficient must be finite, got {}",
                alpha
            )));
        }
        Ok(ExponentialKernel { alpha })
    }
}

impl Kernel for ExponentialKernel {
    fn block(&self, a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
        let mut k = gram(a, b);
        k.apply(|v| *v = (self.alpha * *v).exp());
        k
    }
}

/// Polynomial kernel `(alpha * <x, y> + beta)^degree`. Fractional degrees
/// are allowed; for those the base must stay non-negative or the result is
/// NaN, as with the naive definition.
#[derive(Debug, Clone)]
pub struct PolynomialKernel {
    alpha: f64,
    beta: f64,
    degree: f64,
}

impl PolynomialKernel {
    pub fn new(alpha: f64, beta: f64, degree: f64) -> Result<Self, FalkonError> {
        if !(degree > 0.0) {
            return Err(FalkonError::Configuration(format!(
                "polynomial degree must be positive, got {}",
                degree
            )));
        }
        Ok(PolynomialKernel { alpha, beta, degree })
    }
}

impl Kernel for PolynomialKernel {
    fn block(&self, a: DMatrixView<'_, f64>, b: DMatrixView<'_, f64>) -> DMatrix<f64> {
        let mut k = gram(a, b);
        k.apply(|v| *v = (self.alpha * *v + self.beta).powf(self.degree));
        k
    }
}
