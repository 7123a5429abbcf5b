//! Fourier-domain least-squares reconstruction of cryo-EM volumes.
//!
//! Images with known poses are related to a volume through the central
//! slice theorem. [`MeanEstimator`] solves the normal equations of that
//! forward model with preconditioned conjugate gradient;
//! [`WeightedVolumesEstimator`] does the same for several volumes whose
//! contributions to each image are given by a weight matrix. Results are
//! checked against ground truth with [`Volume::fsc`].
//!
//! ```no_run
//! use cryo_recon::{EstimatorConfig, MeanEstimator, Simulation, SimulationParams, SyntheticVolume};
//!
//! # fn main() -> cryo_recon::Result<()> {
//! let truth = SyntheticVolume::asymmetric(32, 1, 23).generate::<f32>()?;
//! let sim = Simulation::new(truth.clone(), SimulationParams::clean(200, 23))?.cache();
//! let mean = MeanEstimator::new(&sim, EstimatorConfig::default())?.estimate()?;
//! let fsc = mean.fsc(&truth, 1.0, 0.5)?;
//! println!("resolution {:.2} px", fsc.resolution[0]);
//! # Ok(())
//! # }
//! ```

pub mod dtype;
pub mod error;
pub mod estimator;
pub mod fourier;
pub mod fsc;
pub mod operator;
pub mod projector;
pub mod rotation;
pub mod solver;
pub mod source;
pub mod utils;
pub mod volume;

pub use dtype::{Dtype, Real};
pub use error::{NumericalWarning, ReconError, Result};
pub use estimator::{Estimate, EstimatorConfig, MeanEstimator, WeightedVolumesEstimator};
pub use fsc::{fourier_ring_correlation, fourier_shell_correlation, FscResult};
pub use operator::{LinearOperator, Preconditioner, PreconditionerKind};
pub use projector::{DensityCompensation, Pose, Projector};
pub use rotation::{Rotation, SymmetryGroup};
pub use solver::{conjugate_gradient, SolveReport, SolverConfig};
pub use source::{ArrayImageSource, ImageSource, Simulation, SimulationParams};
pub use volume::{SyntheticVolume, Volume};
