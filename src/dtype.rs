use std::fmt;
use std::iter::Sum;

use ndarray::ScalarOperand;
use rustfft::num_traits::NumAssign;
use rustfft::FftNum;
use serde::{Deserialize, Serialize};

/// Floating-point precision of volumes, images and solver buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F32,
    F64,
}

impl Dtype {
    /// Default relative residual tolerance for the CG solver.
    pub fn default_tolerance(self) -> f64 {
        match self {
            Dtype::F32 => 1e-5,
            Dtype::F64 => 1e-6,
        }
    }

    /// Default CG iteration ceiling. Double precision gets more room to
    /// reach its tighter tolerance.
    pub fn default_max_iterations(self) -> usize {
        match self {
            Dtype::F32 => 100,
            Dtype::F64 => 200,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::F32 => write!(f, "float32"),
            Dtype::F64 => write!(f, "float64"),
        }
    }
}

/// Scalar type for real-valued samples. Implemented for `f32` and `f64`.
///
/// Conversions go through `f64` explicitly so geometry and reductions can
/// stay in double precision while storage follows the chosen dtype.
pub trait Real: FftNum + NumAssign + PartialOrd + ScalarOperand + Sum + fmt::Display {
    const DTYPE: Dtype;

    fn of(x: f64) -> Self;

    fn as_f64(self) -> f64;
}

impl Real for f32 {
    const DTYPE: Dtype = Dtype::F32;

    #[inline]
    fn of(x: f64) -> Self {
        x as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    const DTYPE: Dtype = Dtype::F64;

    #[inline]
    fn of(x: f64) -> Self {
        x
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
