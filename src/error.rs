use crate::dtype::Dtype;

/// Errors raised by the reconstruction core.
///
/// All variants are raised before any numerical work starts. Solver
/// non-convergence is not an error, see [`NumericalWarning`].
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Dtype, found: Dtype },

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ReconError>;

/// Recoverable numerical condition reported alongside a result.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericalWarning {
    /// The solver hit its iteration ceiling above the requested tolerance.
    NotConverged {
        iterations: usize,
        relative_residual: f64,
        tolerance: f64,
    },
    /// The Krylov recursion broke down (non-positive curvature or a
    /// non-finite value); the best iterate so far was returned.
    Breakdown { iteration: usize },
}

impl std::fmt::Display for NumericalWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumericalWarning::NotConverged {
                iterations,
                relative_residual,
                tolerance,
            } => write!(
                f,
                "conjugate gradient did not reach tolerance {tolerance:e} in {iterations} iterations (relative residual {relative_residual:e})"
            ),
            NumericalWarning::Breakdown { iteration } => {
                write!(f, "conjugate gradient broke down at iteration {iteration}")
            }
        }
    }
}
