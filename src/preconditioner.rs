use nalgebra::linalg::Cholesky;
use nalgebra::DMatrix;

use crate::errors::FalkonError;
use crate::kernels::Kernel;
use crate::options::FalkonOptions;

/// Two-sided preconditioner for the Nystrom normal equations.
///
/// Built once per fit from the M x M center-center kernel, with both
/// factors upper-triangular:
///
/// 1. `K_MM + eps*M*I = T^T T`,
/// 2. `T T^T / M + lambda*I = A^T A`.
///
/// The CG loop then runs on the whitened operator
/// `A^-T (T^-T K_NM^T K_NM T^-1 / N + lambda I) A^-1`, whose spectrum sits
/// close to the identity (the regularizer pulls back to exactly
/// `lambda T^T T = lambda K_MM` plus jitter), and the solution is mapped
/// back with `alpha = T^-1 A^-1 beta`.
pub struct FalkonPreconditioner {
    t: DMatrix<f64>,
    a: DMatrix<f64>,
}

/// Cholesky with a diagonal jitter and a single escalation retry. The two
/// jitter values are absolute: the first is used outright, the second only
/// after the first factorization fails.
fn jittered_cholesky(
    mat: &DMatrix<f64>,
    jitters: [f64; 2],
    what: &str,
) -> Result<DMatrix<f64>, FalkonError> {
    for (attempt, &jitter) in jitters.iter().enumerate() {
        let mut c = mat.clone();
        for i in 0..c.nrows() {
            c[(i, i)] += jitter;
        }
        if let Some(chol) = Cholesky::new(c) {
            if attempt > 0 {
                log::warn!(
                    "{} factorization needed a jitter increase to {:.3e}",
                    what,
                    jitter
                );
            }
            return Ok(chol.unpack());
        }
    }
    Err(FalkonError::NumericalInstability(format!(
        "{} matrix is not positive-definite even with jitter {:.3e}; \
         increase the jitter or reduce the number of centers",
        what, jitters[1]
    )))
}

impl FalkonPreconditioner {
    pub fn build<K: Kernel + ?Sized>(
        kernel: &K,
        centers: &DMatrix<f64>,
        penalty: f64,
        opts: &FalkonOptions,
    ) -> Result<Self, FalkonError> {
        if !(penalty > 0.0) {
            return Err(FalkonError::Configuration(format!(
                "penalty must be positive, got {}",
                penalty
            )));
        }
        let m = centers.nrows();
        let kmm = kernel.full(centers, centers, None)?;

        let base_jitter = opts.pc_epsilon * m as f64;
        // Upper factor: T^T T = K_MM + jitter.
        let t = jittered_cholesky(
            &kmm,
            [base_jitter, base_jitter * opts.jitter_growth],
            "center-center kernel",
        )?
        .transpose();

        // lambda enters this factor structurally, so the first attempt needs
        // no extra jitter at all.
        let mut inner = &t * t.transpose();
        inner /= m as f64;
        for i in 0..m {
            inner[(i, i)] += penalty;
        }
        let a = jittered_cholesky(&inner, [0.0, base_jitter * opts.jitter_growth], "whitening")?
            .transpose();

        Ok(FalkonPreconditioner { t, a })
    }

    pub fn dim(&self) -> usize {
        self.t.nrows()
    }

    /// Solves `T x = v`.
    pub fn inv_t(&self, v: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        self.t
            .solve_upper_triangular(v)
            .ok_or_else(singular_factor)
    }

    /// Solves `T^T x = v`.
    pub fn inv_t_t(&self, v: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        self.t
            .tr_solve_upper_triangular(v)
            .ok_or_else(singular_factor)
    }

    /// Solves `A x = v`.
    pub fn inv_a(&self, v: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        self.a
            .solve_upper_triangular(v)
            .ok_or_else(singular_factor)
    }

    /// Solves `A^T x = v`.
    pub fn inv_a_t(&self, v: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        self.a
            .tr_solve_upper_triangular(v)
            .ok_or_else(singular_factor)
    }

    /// Whitened -> original coordinates: `T^-1 A^-1 v`. This is the
    /// coordinate-space mapping applied to every validation snapshot of the
    /// CG iterate and once to the final solution.
    pub fn apply(&self, v: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        self.inv_t(&self.inv_a(v)?)
    }

    /// Transposed forward map: `A^-T T^-T v`.
    pub fn apply_t(&self, v: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        self.inv_a_t(&self.inv_t_t(v)?)
    }
}

fn singular_factor() -> FalkonError {
    FalkonError::NumericalInstability("triangular factor has a zero diagonal entry".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::GaussianKernel;
    use approx::assert_relative_eq;
    use nalgebra::DVector;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn randn(rows: usize, cols: usize, seed: u64) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        DMatrix::from_fn(rows, cols, |_, _| StandardNormal.sample(&mut rng))
    }

    #[test]
    fn factors_reconstruct_the_jittered_matrices() {
        let centers = randn(30, 5, 0);
        let kernel = GaussianKernel::new(2.0).unwrap();
        let opts = FalkonOptions::default();
        let penalty = 1e-3;
        let prec = FalkonPreconditioner::build(&kernel, &centers, penalty, &opts).unwrap();

        let m = centers.nrows();
        let mut kmm = kernel.full(&centers, &centers, None).unwrap();
        for i in 0..m {
            kmm[(i, i)] += opts.pc_epsilon * m as f64;
        }
        assert_relative_eq!(prec.t.transpose() * &prec.t, kmm, epsilon = 1e-10);

        let mut inner = &prec.t * prec.t.transpose() / m as f64;
        for i in 0..m {
            inner[(i, i)] += penalty;
        }
        assert_relative_eq!(prec.a.transpose() * &prec.a, inner, epsilon = 1e-10);
    }

    #[test]
    fn triangular_solves_invert_the_factors() {
        let centers = randn(25, 4, 1);
        let kernel = GaussianKernel::new(1.5).unwrap();
        let prec =
            FalkonPreconditioner::build(&kernel, &centers, 1e-4, &FalkonOptions::default()).unwrap();
        let v = randn(25, 3, 2);

        assert_relative_eq!(prec.inv_t(&(&prec.t * &v)).unwrap(), v, epsilon = 1e-8);
        assert_relative_eq!(
            prec.inv_t_t(&(prec.t.transpose() * &v)).unwrap(),
            v,
            epsilon = 1e-8
        );
        assert_relative_eq!(prec.inv_a(&(&prec.a * &v)).unwrap(), v, epsilon = 1e-8);
        assert_relative_eq!(
            prec.inv_a_t(&(prec.a.transpose() * &v)).unwrap(),
            v,
            epsilon = 1e-8
        );

        // apply / apply_t are transposes of each other: <apply(u), v> == <u, apply_t(v)>.
        let u = randn(25, 1, 3);
        let w = randn(25, 1, 4);
        let lhs = prec.apply(&u).unwrap().dot(&w);
        let rhs = u.dot(&prec.apply_t(&w).unwrap());
        assert_relative_eq!(lhs, rhs, epsilon = 1e-10, max_relative = 1e-8);
    }

    #[test]
    fn whitening_factor_normalizes_its_target_matrix() {
        // A^T A = T T^T / M + lambda I by construction, so conjugating that
        // matrix by A^-T must give the identity exactly.
        let centers = randn(20, 3, 5);
        let kernel = GaussianKernel::new(1.0).unwrap();
        let penalty = 1e-2;
        let prec =
            FalkonPreconditioner::build(&kernel, &centers, penalty, &FalkonOptions::default())
                .unwrap();
        let m = centers.nrows();
        let mut inner = &prec.t * prec.t.transpose() / m as f64;
        for i in 0..m {
            inner[(i, i)] += penalty;
        }
        // A^-T * inner * A^-1, via two transposed solves.
        let y = prec.inv_a_t(&inner).unwrap();
        let white = prec.inv_a_t(&y.transpose()).unwrap().transpose();
        assert_relative_eq!(white, DMatrix::identity(m, m), epsilon = 1e-8);
    }

    #[test]
    fn positive_definite_for_all_tested_configurations() {
        let kernel = GaussianKernel::new(3.0).unwrap();
        for (m, penalty) in [(5usize, 1e-6), (20, 1e-4), (60, 1e-1)] {
            let centers = randn(m, 6, m as u64);
            assert!(
                FalkonPreconditioner::build(&kernel, &centers, penalty, &FalkonOptions::default())
                    .is_ok()
            );
        }
    }

    #[test]
    fn duplicate_centers_survive_via_jitter_retry_or_fail_loudly() {
        // A rank-deficient center-center kernel: all centers identical.
        let centers = DMatrix::from_fn(10, 3, |_, j| j as f64);
        let kernel = GaussianKernel::new(1.0).unwrap();
        let opts = FalkonOptions {
            pc_epsilon: 1e-15,
            jitter_growth: 1e3,
            ..FalkonOptions::default()
        };
        match FalkonPreconditioner::build(&kernel, &centers, 1e-5, &opts) {
            Ok(prec) => assert_eq!(prec.dim(), 10),
            Err(e) => assert!(matches!(e, FalkonError::NumericalInstability(_))),
        }
    }

    #[test]
    fn non_positive_penalty_is_rejected() {
        let centers = randn(10, 2, 6);
        let kernel = GaussianKernel::new(1.0).unwrap();
        assert!(matches!(
            FalkonPreconditioner::build(&kernel, &centers, 0.0, &FalkonOptions::default()),
            Err(FalkonError::Configuration(_))
        ));
    }

    #[test]
    fn mahalanobis_bandwidth_builds_a_preconditioner() {
        let centers = randn(15, 4, 7);
        let s = DMatrix::from_diagonal(&DVector::from_element(4, 0.25));
        let kernel = GaussianKernel::with_matrix(s).unwrap();
        assert!(
            FalkonPreconditioner::build(&kernel, &centers, 1e-3, &FalkonOptions::default()).is_ok()
        );
    }
}
