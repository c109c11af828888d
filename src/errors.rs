use thiserror::Error;

/// Error taxonomy for the solver pipeline.
///
/// Shape and configuration problems are detected eagerly, before any
/// numerical work starts. `NumericalInstability` is only raised after the
/// automatic jitter retry has been exhausted.
#[derive(Debug, Error)]
pub enum FalkonError {
    #[error("input shape mismatch: {0}")]
    InputShape(String),

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("model has not been fitted; `predict` must be called after `fit`")]
    NotFitted,
}
