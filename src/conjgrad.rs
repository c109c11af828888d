use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};

use crate::errors::FalkonError;
use crate::kernels::Kernel;
use crate::options::FalkonOptions;
use crate::preconditioner::FalkonPreconditioner;

/// How a CG run ended. Hitting the iteration cap is reported, not turned
/// into an error: the best iterate is still returned and callers decide
/// whether it is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged { iterations: usize },
    MaxIterationsExceeded,
    Stopped { iterations: usize },
}

/// Read-only per-iteration observer: `(iteration, iterate, elapsed)`.
pub type IterationCallback<'a> = &'a mut dyn FnMut(usize, &DMatrix<f64>, Duration);

/// Block conjugate gradient over a multi-column right-hand side, with one
/// step scalar per column. The operator is an opaque closure so the same
/// loop serves plain SPD systems and the whitened Falkon operator.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Residual recomputation period; zero disables the recomputation.
    pub full_gradient_every: usize,
}

impl ConjugateGradient {
    pub fn from_options(opts: &FalkonOptions) -> Self {
        ConjugateGradient {
            tolerance: opts.cg_tolerance,
            max_iterations: opts.max_iterations,
            full_gradient_every: opts.cg_full_gradient_every,
        }
    }

    /// Runs CG on `operator(x) = b` starting from `x0` (zero when absent).
    ///
    /// The callback, when given, observes every iterate after the update;
    /// the stop flag is checked between iterations only.
    pub fn solve<Op>(
        &self,
        operator: Op,
        b: &DMatrix<f64>,
        x0: Option<DMatrix<f64>>,
        mut callback: Option<IterationCallback<'_>>,
        stop: Option<&AtomicBool>,
    ) -> Result<(DMatrix<f64>, StopReason), FalkonError>
    where
        Op: Fn(&DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError>,
    {
        if b.ncols() == 0 {
            return Err(FalkonError::InputShape(
                "right-hand side has no columns".to_string(),
            ));
        }
        let start = Instant::now();
        let (mut x, mut r) = match x0 {
            Some(x0) => {
                if x0.shape() != b.shape() {
                    return Err(FalkonError::InputShape(format!(
                        "warm start has shape {}x{}, expected {}x{}",
                        x0.nrows(),
                        x0.ncols(),
                        b.nrows(),
                        b.ncols()
                    )));
                }
                let r = b - operator(&x0)?;
                (x0, r)
            }
            None => (DMatrix::zeros(b.nrows(), b.ncols()), b.clone()),
        };
        let mut p = r.clone();
        let mut rs_old = column_norms_sq(&r);

        for it in 1..=self.max_iterations {
            if let Some(flag) = stop {
                if flag.load(Ordering::Relaxed) {
                    log::debug!("solver stopped externally after {} iterations", it - 1);
                    return Ok((x, StopReason::Stopped { iterations: it - 1 }));
                }
            }

            let ap = operator(&p)?;
            for j in 0..b.ncols() {
                let denom = p.column(j).dot(&ap.column(j));
                let alpha = if denom.abs() > f64::MIN_POSITIVE {
                    rs_old[j] / denom
                } else {
                    0.0
                };
                x.column_mut(j).axpy(alpha, &p.column(j), 1.0);
                r.column_mut(j).axpy(-alpha, &ap.column(j), 1.0);
            }
            // Shed accumulated roundoff with a fresh residual now and then.
            // A period of zero disables the recomputation.
            if self.full_gradient_every > 0 && it % self.full_gradient_every == 0 {
                r = b - operator(&x)?;
            }
            let rs_new = column_norms_sq(&r);
            if rs_new.iter().any(|v| !v.is_finite()) {
                return Err(FalkonError::NumericalInstability(
                    "non-finite residual in the conjugate-gradient loop".to_string(),
                ));
            }

            if let Some(cb) = callback.as_mut() {
                cb(it, &x, start.elapsed());
            }

            if rs_new.max().sqrt() < self.tolerance {
                log::debug!("converged after {} iterations", it);
                return Ok((x, StopReason::Converged { iterations: it }));
            }
            for j in 0..b.ncols() {
                let beta = if rs_old[j] > 0.0 { rs_new[j] / rs_old[j] } else { 0.0 };
                // p <- r + beta * p
                p.column_mut(j).axpy(1.0, &r.column(j), beta);
            }
            rs_old = rs_new;
        }

        log::warn!(
            "did not converge within {} iterations; returning the best iterate",
            self.max_iterations
        );
        Ok((x, StopReason::MaxIterationsExceeded))
    }
}

fn column_norms_sq(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(m.ncols(), m.column_iter().map(|c| c.norm_squared()))
}

/// Assembles the whitened normal-equations system for a Falkon fit and
/// drives [`ConjugateGradient`] over it.
///
/// The operator applied at each iteration is
/// `beta -> A^-T (T^-T (K_NM^T (K_NM (T^-1 A^-1 beta))) / n + lambda A^-1 beta)`
/// and the right-hand side is `A^-T T^-T (K_NM^T y) / n`. When a cached
/// `K_NM` is supplied the cross products use it directly; otherwise they go
/// through the kernel's fused `dmmv`.
pub struct FalkonConjugateGradient<'a, K: Kernel + ?Sized> {
    kernel: &'a K,
    preconditioner: &'a FalkonPreconditioner,
    penalty: f64,
    options: &'a FalkonOptions,
}

impl<'a, K: Kernel + ?Sized> FalkonConjugateGradient<'a, K> {
    pub fn new(
        kernel: &'a K,
        preconditioner: &'a FalkonPreconditioner,
        penalty: f64,
        options: &'a FalkonOptions,
    ) -> Self {
        FalkonConjugateGradient {
            kernel,
            preconditioner,
            penalty,
            options,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn solve(
        &self,
        x: &DMatrix<f64>,
        centers: &DMatrix<f64>,
        y: &DMatrix<f64>,
        knm: Option<&DMatrix<f64>>,
        x0: Option<DMatrix<f64>>,
        callback: Option<IterationCallback<'_>>,
        stop: Option<&AtomicBool>,
    ) -> Result<(DMatrix<f64>, StopReason), FalkonError> {
        let n = x.nrows() as f64;
        let prec = self.preconditioner;
        let penalty = self.penalty;

        let b = match knm {
            Some(k) => k.transpose() * y / n,
            None => self.kernel.dmmv(x, centers, None, Some(y), None, self.options)? / n,
        };
        let b = prec.apply_t(&b)?;

        let operator = |beta: &DMatrix<f64>| -> Result<DMatrix<f64>, FalkonError> {
            let v = prec.inv_a(beta)?;
            let tv = prec.inv_t(&v)?;
            let cross = match knm {
                Some(k) => k.transpose() * (k * &tv),
                None => self
                    .kernel
                    .dmmv(x, centers, Some(&tv), None, None, self.options)?,
            };
            prec.inv_a_t(&(prec.inv_t_t(&(cross / n))? + v * penalty))
        };

        ConjugateGradient::from_options(self.options).solve(operator, &b, x0, callback, stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn randn(rows: usize, cols: usize, seed: u64) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        DMatrix::from_fn(rows, cols, |_, _| StandardNormal.sample(&mut rng))
    }

    fn spd(dim: usize, seed: u64) -> DMatrix<f64> {
        let g = randn(dim, dim, seed);
        &g * g.transpose() + DMatrix::identity(dim, dim) * dim as f64
    }

    #[test]
    fn solves_a_small_spd_system() {
        let a = spd(12, 0);
        let b = randn(12, 3, 1);
        let cg = ConjugateGradient {
            tolerance: 1e-12,
            max_iterations: 200,
            full_gradient_every: 10,
        };
        let (x, reason) = cg
            .solve(|v| Ok(&a * v), &b, None, None, None)
            .unwrap();
        assert!(matches!(reason, StopReason::Converged { .. }));
        assert_relative_eq!(&a * &x, b, epsilon = 1e-8);
    }

    #[test]
    fn zero_recompute_period_disables_it() {
        let a = spd(12, 7);
        let b = randn(12, 2, 8);
        let cg = ConjugateGradient {
            tolerance: 1e-12,
            max_iterations: 200,
            full_gradient_every: 0,
        };
        let (x, reason) = cg.solve(|v| Ok(&a * v), &b, None, None, None).unwrap();
        assert!(matches!(reason, StopReason::Converged { .. }));
        assert_relative_eq!(&a * &x, b, epsilon = 1e-8);
    }

    #[test]
    fn empty_right_hand_side_is_rejected() {
        let cg = ConjugateGradient {
            tolerance: 1e-12,
            max_iterations: 10,
            full_gradient_every: 10,
        };
        let b = DMatrix::<f64>::zeros(5, 0);
        let err = cg.solve(|v| Ok(v.clone()), &b, None, None, None).unwrap_err();
        assert!(matches!(err, FalkonError::InputShape(_)));
    }

    #[test]
    fn warm_start_converges_faster_than_cold() {
        let a = spd(20, 2);
        let b = randn(20, 1, 3);
        let cg = ConjugateGradient {
            tolerance: 1e-10,
            max_iterations: 200,
            full_gradient_every: 10,
        };
        let (x, _) = cg.solve(|v| Ok(&a * v), &b, None, None, None).unwrap();
        let (_, reason) = cg
            .solve(|v| Ok(&a * v), &b, Some(x), None, None)
            .unwrap();
        assert_eq!(reason, StopReason::Converged { iterations: 1 });
    }

    #[test]
    fn iteration_cap_returns_best_iterate() {
        let a = spd(30, 4);
        let b = randn(30, 1, 5);
        let cg = ConjugateGradient {
            tolerance: 1e-14,
            max_iterations: 2,
            full_gradient_every: 10,
        };
        let (x, reason) = cg.solve(|v| Ok(&a * v), &b, None, None, None).unwrap();
        assert_eq!(reason, StopReason::MaxIterationsExceeded);
        // Two iterations must still have reduced the residual.
        assert!((&a * &x - &b).norm() < b.norm());
    }

    #[test]
    fn callback_sees_every_iteration_without_corrupting_state() {
        let a = spd(10, 6);
        let b = randn(10, 2, 7);
        let cg = ConjugateGradient {
            tolerance: 1e-12,
            max_iterations: 100,
            full_gradient_every: 10,
        };
        let mut iterations = Vec::new();
        let mut cb = |it: usize, x: &DMatrix<f64>, _t: Duration| {
            assert_eq!(x.shape(), (10, 2));
            iterations.push(it);
        };
        let (x, reason) = cg
            .solve(|v| Ok(&a * v), &b, None, Some(&mut cb), None)
            .unwrap();
        let StopReason::Converged { iterations: total } = reason else {
            panic!("expected convergence");
        };
        assert_eq!(iterations, (1..=total).collect::<Vec<_>>());
        assert_relative_eq!(&a * &x, b, epsilon = 1e-8);
    }

    #[test]
    fn stop_flag_interrupts_between_iterations() {
        let a = spd(15, 8);
        let b = randn(15, 1, 9);
        let flag = AtomicBool::new(true);
        let cg = ConjugateGradient {
            tolerance: 1e-12,
            max_iterations: 50,
            full_gradient_every: 10,
        };
        let (x, reason) = cg
            .solve(|v| Ok(&a * v), &b, None, None, Some(&flag))
            .unwrap();
        assert_eq!(reason, StopReason::Stopped { iterations: 0 });
        assert_eq!(x, DMatrix::zeros(15, 1));
    }
}
