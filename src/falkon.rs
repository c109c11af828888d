use std::mem::size_of;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};

use crate::center_selection::{CenterSelector, UniformSelector};
use crate::conjgrad::{FalkonConjugateGradient, StopReason};
use crate::errors::FalkonError;
use crate::kernels::Kernel;
use crate::options::{store_full_kernel, FalkonOptions};
use crate::preconditioner::FalkonPreconditioner;

/// Error metric used for fit-time monitoring: maps `(truth, predictions)` to
/// a value and a label (e.g. `("mse", 0.02)` reported as "validation mse").
pub type ErrorFn = dyn Fn(&DMatrix<f64>, &DMatrix<f64>) -> (f64, String) + Send + Sync;

/// One monitoring record per CG iteration. Entry 0 carries the
/// preconditioner build time; the error is only present on iterations where
/// the error function ran (see `error_every`). `elapsed` is cumulative
/// solver time and does not count the error evaluations themselves.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: usize,
    pub elapsed: Duration,
    pub error: Option<f64>,
    pub error_label: Option<String>,
}

/// Kernel ridge regression with Nystrom centers, solved by preconditioned
/// conjugate gradient.
///
/// A fit selects M centers, factors the center-center kernel into a
/// two-sided preconditioner, runs CG entirely in the whitened space and
/// maps the solution back, leaving `(centers, alpha)` as the model.
pub struct Falkon<K: Kernel> {
    kernel: K,
    penalty: f64,
    options: FalkonOptions,
    selector: Box<dyn CenterSelector>,
    error_fn: Option<Box<ErrorFn>>,
    error_every: usize,

    alpha: Option<DMatrix<f64>>,
    centers: Option<DMatrix<f64>>,
    fit_trace: Vec<IterationRecord>,
    stop_reason: Option<StopReason>,
}

impl<K: Kernel> Falkon<K> {
    /// Uniform center selection with an optional seed.
    pub fn new(
        kernel: K,
        penalty: f64,
        num_centers: usize,
        seed: Option<u64>,
        options: FalkonOptions,
    ) -> Result<Self, FalkonError> {
        let selector = Box::new(UniformSelector::new(num_centers, seed)?);
        Self::with_selector(kernel, penalty, selector, options)
    }

    /// Custom center-selection strategy.
    pub fn with_selector(
        kernel: K,
        penalty: f64,
        selector: Box<dyn CenterSelector>,
        options: FalkonOptions,
    ) -> Result<Self, FalkonError> {
        options.validate()?;
        if !(penalty > 0.0) {
            return Err(FalkonError::Configuration(format!(
                "penalty must be positive, got {}",
                penalty
            )));
        }
        Ok(Falkon {
            kernel,
            penalty,
            options,
            selector,
            error_fn: None,
            error_every: 1,
            alpha: None,
            centers: None,
            fit_trace: Vec::new(),
            stop_reason: None,
        })
    }

    /// Installs an error metric evaluated every `every` CG iterations on a
    /// read-only snapshot of the iterate mapped back to original
    /// coordinates.
    pub fn with_error_fn(mut self, error_fn: Box<ErrorFn>, every: usize) -> Result<Self, FalkonError> {
        if every == 0 {
            return Err(FalkonError::Configuration(
                "error_every must be at least 1".to_string(),
            ));
        }
        self.error_fn = Some(error_fn);
        self.error_every = every;
        Ok(self)
    }

    /// Fits the model on `(x, y)`. When the optional validation pair is
    /// given, fit-time errors are computed on it instead of the training
    /// data.
    pub fn fit(
        &mut self,
        x: &DMatrix<f64>,
        y: &DMatrix<f64>,
        xts: Option<&DMatrix<f64>>,
        yts: Option<&DMatrix<f64>>,
    ) -> Result<(), FalkonError> {
        check_fit_inputs(x, y, xts, yts)?;
        self.kernel.validate(x.ncols())?;
        self.alpha = None;
        self.centers = None;
        self.fit_trace.clear();
        self.stop_reason = None;

        let centers = self.selector.select(x)?;

        let prep_start = Instant::now();
        let prec = FalkonPreconditioner::build(&self.kernel, &centers, self.penalty, &self.options)?;
        let prep_time = prep_start.elapsed();
        self.fit_trace.push(IterationRecord {
            iteration: 0,
            elapsed: prep_time,
            error: None,
            error_label: None,
        });

        // Cache K_NM across CG iterations only when the heuristic says it
        // pays off and fits in memory.
        let knm = if store_full_kernel(
            x.nrows(),
            centers.nrows(),
            x.ncols(),
            size_of::<f64>(),
            &self.options,
        ) {
            Some(self.kernel.full(x, &centers, None)?)
        } else {
            None
        };

        let optim =
            FalkonConjugateGradient::new(&self.kernel, &prec, self.penalty, &self.options);

        let mut trace: Vec<IterationRecord> = Vec::new();
        {
            let kernel = &self.kernel;
            let options = &self.options;
            let error_fn = self.error_fn.as_deref();
            let error_every = self.error_every;
            let (x_eval, y_eval, stage) = match (xts, yts) {
                (Some(xts), Some(yts)) => (xts, yts, "validation"),
                _ => (x, y, "training"),
            };
            // Time spent computing monitoring errors is subtracted from the
            // reported elapsed time, so the trace reflects solver time only.
            let mut monitor_overhead = Duration::ZERO;
            let mut callback = |it: usize, beta: &DMatrix<f64>, elapsed: Duration| {
                let elapsed = prep_time + elapsed.saturating_sub(monitor_overhead);
                let mut record = IterationRecord {
                    iteration: it,
                    elapsed,
                    error: None,
                    error_label: None,
                };
                if let Some(error_fn) = error_fn {
                    if it % error_every == 0 {
                        let eval_start = Instant::now();
                        // Map the iterate out of the whitened space without
                        // touching the solver's own copy.
                        match evaluate_error(
                            kernel, &prec, beta, &centers, x_eval, y_eval, error_fn, options,
                        ) {
                            Ok((err, name)) => {
                                record.error = Some(err);
                                record.error_label = Some(format!("{} {}", stage, name));
                            }
                            Err(e) => log::debug!("skipping fit-time error at iteration {}: {}", it, e),
                        }
                        monitor_overhead += eval_start.elapsed();
                    }
                }
                trace.push(record);
            };
            let (beta, reason) = optim.solve(
                x,
                &centers,
                y,
                knm.as_ref(),
                None,
                Some(&mut callback),
                self.options.stop_flag.as_deref(),
            )?;
            if reason == StopReason::MaxIterationsExceeded {
                log::warn!(
                    "fit stopped at the iteration cap ({}); keeping the best iterate",
                    self.options.max_iterations
                );
            }
            self.stop_reason = Some(reason);
            self.alpha = Some(prec.apply(&beta)?);
        }
        self.fit_trace.extend(trace);
        self.centers = Some(centers);
        Ok(())
    }

    /// `fit` for 1-D targets: the documented promotion of an N-vector to an
    /// N x 1 matrix.
    pub fn fit_1d(
        &mut self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        xts: Option<&DMatrix<f64>>,
        yts: Option<&DVector<f64>>,
    ) -> Result<(), FalkonError> {
        let y = DMatrix::from_column_slice(y.len(), 1, y.as_slice());
        let yts = yts.map(|v| DMatrix::from_column_slice(v.len(), 1, v.as_slice()));
        self.fit(x, &y, xts, yts.as_ref())
    }

    /// Predictions for `x`, shape `num_samples x num_outputs`.
    pub fn predict(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        let (centers, alpha) = match (&self.centers, &self.alpha) {
            (Some(c), Some(a)) => (c, a),
            _ => return Err(FalkonError::NotFitted),
        };
        self.kernel.mmv(x, centers, alpha, None, &self.options)
    }

    /// Maps a whitened-space iterate to original coordinates through the
    /// given preconditioner. Pure; does not touch the fitted state.
    pub fn params_to_original_space(
        beta: &DMatrix<f64>,
        preconditioner: &FalkonPreconditioner,
    ) -> Result<DMatrix<f64>, FalkonError> {
        preconditioner.apply(beta)
    }

    pub fn centers(&self) -> Option<&DMatrix<f64>> {
        self.centers.as_ref()
    }

    pub fn alpha(&self) -> Option<&DMatrix<f64>> {
        self.alpha.as_ref()
    }

    /// Monitoring records from the last fit: entry 0 is the preconditioner
    /// build, then one entry per CG iteration.
    pub fn fit_trace(&self) -> &[IterationRecord] {
        &self.fit_trace
    }

    /// How the last fit's CG loop terminated.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }
}

#[allow(clippy::too_many_arguments)]
fn evaluate_error<K: Kernel>(
    kernel: &K,
    prec: &FalkonPreconditioner,
    beta: &DMatrix<f64>,
    centers: &DMatrix<f64>,
    x_eval: &DMatrix<f64>,
    y_eval: &DMatrix<f64>,
    error_fn: &ErrorFn,
    options: &FalkonOptions,
) -> Result<(f64, String), FalkonError> {
    let alpha = prec.apply(beta)?;
    let pred = kernel.mmv(x_eval, centers, &alpha, None, options)?;
    Ok(error_fn(y_eval, &pred))
}

fn check_fit_inputs(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
    xts: Option<&DMatrix<f64>>,
    yts: Option<&DMatrix<f64>>,
) -> Result<(), FalkonError> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(FalkonError::InputShape(
            "training features must be non-empty".to_string(),
        ));
    }
    if y.ncols() == 0 {
        return Err(FalkonError::InputShape(
            "training targets must have at least one column".to_string(),
        ));
    }
    if x.nrows() != y.nrows() {
        return Err(FalkonError::InputShape(format!(
            "X and Y must have the same number of samples (found {} and {})",
            x.nrows(),
            y.nrows()
        )));
    }
    match (xts, yts) {
        (None, None) => Ok(()),
        (Some(xts), Some(yts)) => {
            if xts.nrows() != yts.nrows() {
                return Err(FalkonError::InputShape(format!(
                    "Xts and Yts must have the same number of samples (found {} and {})",
                    xts.nrows(),
                    yts.nrows()
                )));
            }
            if xts.ncols() != x.ncols() {
                return Err(FalkonError::InputShape(format!(
                    "Xts has dimensionality {}, expected {}",
                    xts.ncols(),
                    x.ncols()
                )));
            }
            if yts.ncols() != y.ncols() {
                return Err(FalkonError::InputShape(format!(
                    "Yts has {} outputs, expected {}",
                    yts.ncols(),
                    y.ncols()
                )));
            }
            Ok(())
        }
        _ => Err(FalkonError::Configuration(
            "validation features and targets must be provided together".to_string(),
        )),
    }
}
