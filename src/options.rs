use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::errors::FalkonError;

/// Tuning knobs shared by the kernel evaluator, the preconditioner and the
/// conjugate-gradient loop. All sizes are in bytes.
#[derive(Debug, Clone)]
pub struct FalkonOptions {
    /// Memory budget for kernel evaluation. Bounds the size of the row blocks
    /// used by the fused products, and caps the cached N x M kernel matrix.
    pub max_mem_bytes: usize,
    /// Only consider caching the N x M kernel when the data dimensionality
    /// exceeds this threshold; below it, recomputing the kernel each CG
    /// iteration is not the bottleneck.
    pub store_kernel_d_threshold: usize,
    /// Hard override: never cache the N x M kernel matrix.
    pub never_store_kernel: bool,
    /// Diagonal jitter (scaled by M) added to the center-center kernel before
    /// factorization.
    pub pc_epsilon: f64,
    /// Multiplier applied to the jitter on the single automatic retry after a
    /// failed Cholesky factorization.
    pub jitter_growth: f64,
    /// Residual-norm threshold terminating the CG loop.
    pub cg_tolerance: f64,
    /// Iteration cap for the CG loop. Exceeding it is a warning-level
    /// outcome; the best iterate is still returned.
    pub max_iterations: usize,
    /// Recompute the residual from scratch every this many iterations to shed
    /// accumulated floating-point drift.
    pub cg_full_gradient_every: usize,
    /// Cooperative stop flag, checked between CG iterations only.
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for FalkonOptions {
    fn default() -> Self {
        FalkonOptions {
            max_mem_bytes: 4 * (1 << 30),
            store_kernel_d_threshold: 1200,
            never_store_kernel: false,
            pc_epsilon: 1e-13,
            jitter_growth: 1e3,
            cg_tolerance: 1e-7,
            max_iterations: 20,
            cg_full_gradient_every: 10,
            stop_flag: None,
        }
    }
}

impl FalkonOptions {
    pub fn validate(&self) -> Result<(), FalkonError> {
        if self.cg_tolerance <= 0.0 {
            return Err(FalkonError::Configuration(format!(
                "cg_tolerance must be positive, got {}",
                self.cg_tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(FalkonError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.cg_full_gradient_every == 0 {
            return Err(FalkonError::Configuration(
                "cg_full_gradient_every must be at least 1".to_string(),
            ));
        }
        if self.pc_epsilon <= 0.0 || self.jitter_growth < 1.0 {
            return Err(FalkonError::Configuration(format!(
                "invalid jitter settings: pc_epsilon={}, jitter_growth={}",
                self.pc_epsilon, self.jitter_growth
            )));
        }
        Ok(())
    }
}

/// Decides whether the full N x M cross-kernel matrix should be precomputed
/// once and reused across CG iterations, instead of re-evaluating fused
/// products every iteration.
///
/// With the matrix cached, each iteration costs two plain matrix products;
/// without it, each iteration additionally pays N*M kernel evaluations of
/// cost D each. So the matrix is only worth storing when D is large, and
/// only when the `n * m * elem_size` bytes actually fit in the budget.
pub fn store_full_kernel(
    n: usize,
    m: usize,
    d: usize,
    elem_size: usize,
    opts: &FalkonOptions,
) -> bool {
    if opts.never_store_kernel {
        return false;
    }
    if d <= opts.store_kernel_d_threshold {
        return false;
    }
    let needed = n.saturating_mul(m).saturating_mul(elem_size);
    if needed <= opts.max_mem_bytes {
        log::debug!("caching the {}x{} kernel matrix ({} bytes)", n, m, needed);
        true
    } else {
        log::debug!(
            "not caching the {}x{} kernel matrix: need {} bytes, budget {}",
            n,
            m,
            needed,
            opts.max_mem_bytes
        );
        false
    }
}
