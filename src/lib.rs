//! Kernel ridge regression at scale.
//!
//! The solver approximates the full kernel system with M Nystrom centers,
//! factors the center-center kernel into a two-sided preconditioner, and
//! runs conjugate gradient entirely in the whitened coordinate space, so
//! only fused kernel-vector products over the N x M cross kernel are ever
//! needed (and that matrix is only materialized when a memory heuristic
//! says it pays off).

pub mod center_selection;
pub mod conjgrad;
pub mod errors;
pub mod falkon;
pub mod kernels;
pub mod options;
pub mod preconditioner;

pub use crate::center_selection::{CenterSelector, UniformSelector};
pub use crate::conjgrad::{ConjugateGradient, FalkonConjugateGradient, IterationCallback, StopReason};
pub use crate::errors::FalkonError;
pub use crate::falkon::{ErrorFn, Falkon, IterationRecord};
pub use crate::kernels::{
    ExponentialKernel, GaussianKernel, Kernel, LaplacianKernel, LinearKernel, PolynomialKernel,
};
pub use crate::options::{store_full_kernel, FalkonOptions};
pub use crate::preconditioner::FalkonPreconditioner;
