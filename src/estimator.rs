//! Least-squares estimation of one mean volume, or of several volumes
//! mixed by per-image weights.

use std::marker::PhantomData;
use std::ops::Range;

use log::{debug, info};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, Axis, Ix4};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::dtype::{Dtype, Real};
use crate::error::{ReconError, Result};
use crate::fourier::CenteredFft;
use crate::operator::{NormalEquations, Preconditioner, PreconditionerKind, ProjectionOperator};
use crate::projector::{DensityCompensation, Projector};
use crate::solver::{conjugate_gradient, SolveReport, SolverConfig};
use crate::source::ImageSource;
use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Expected image side length; checked against the source when set.
    pub resolution: Option<usize>,
    /// Expected precision; checked against the source when set.
    pub dtype: Option<Dtype>,
    /// Relative residual target. Defaults to the precision's
    /// [`Dtype::default_tolerance`].
    pub tolerance: Option<f64>,
    /// CG iteration ceiling. Defaults to the precision's
    /// [`Dtype::default_max_iterations`].
    pub max_iterations: Option<usize>,
    /// Tikhonov weight `λ` added to the normal operator.
    pub regularization: f64,
    pub preconditioner: PreconditionerKind,
    pub density_compensation: DensityCompensation,
    /// Images read from the source at a time while building the right-hand
    /// side.
    pub batch_size: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            resolution: None,
            dtype: None,
            tolerance: None,
            max_iterations: None,
            regularization: 0.0,
            preconditioner: PreconditionerKind::Jacobi,
            density_compensation: DensityCompensation::Radial,
            batch_size: 512,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(tol) = self.tolerance {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(ReconError::Configuration(format!(
                    "tolerance must be positive and finite, got {tol}"
                )));
            }
        }
        if self.max_iterations == Some(0) {
            return Err(ReconError::Configuration("max_iterations must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ReconError::Configuration("batch_size must be at least 1".into()));
        }
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return Err(ReconError::Configuration(format!(
                "regularization must be non-negative, got {}",
                self.regularization
            )));
        }
        if self.resolution == Some(0) {
            return Err(ReconError::Configuration("resolution must be at least 1".into()));
        }
        Ok(())
    }

    fn solver_config(&self, dtype: Dtype) -> SolverConfig {
        SolverConfig {
            tolerance: self.tolerance.unwrap_or_else(|| dtype.default_tolerance()),
            max_iterations: self
                .max_iterations
                .unwrap_or_else(|| dtype.default_max_iterations()),
        }
    }
}

/// Estimated volume(s) together with how the solve went.
#[derive(Debug, Clone)]
pub struct Estimate<T: Real> {
    pub volume: Volume<T>,
    pub report: SolveReport,
}

/// Single-volume estimator: every image weighs 1.
pub struct MeanEstimator<'a, T: Real, S: ImageSource<T> + ?Sized> {
    source: &'a S,
    config: EstimatorConfig,
    _scalar: PhantomData<T>,
}

impl<'a, T: Real, S: ImageSource<T> + ?Sized> MeanEstimator<'a, T, S> {
    pub fn new(source: &'a S, config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            _scalar: PhantomData,
        })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Mean volume, shape `(1, L, L, L)`.
    pub fn estimate(&self) -> Result<Volume<T>> {
        self.estimate_with_report().map(|e| e.volume)
    }

    pub fn estimate_with_report(&self) -> Result<Estimate<T>> {
        let weights = Array2::from_elem((self.source.n(), 1), T::one());
        estimate_volumes(self.source, weights.view(), &self.config)
    }
}

/// Estimates `C` volumes at once; image `i` contributes to volume `c` with
/// weight `weights[[i, c]]`.
pub struct WeightedVolumesEstimator<'a, T: Real, S: ImageSource<T> + ?Sized> {
    source: &'a S,
    weights: Array2<T>,
    config: EstimatorConfig,
}

impl<'a, T: Real, S: ImageSource<T> + ?Sized> WeightedVolumesEstimator<'a, T, S> {
    pub fn new(source: &'a S, weights: Array2<T>, config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        if weights.ncols() == 0 {
            return Err(ReconError::Configuration(
                "weights must describe at least one volume".into(),
            ));
        }
        if weights.nrows() != source.n() {
            return Err(ReconError::InvalidInput(format!(
                "weights have shape {:?} but the source holds {} images",
                weights.shape(),
                source.n()
            )));
        }
        if weights.iter().any(|w| !w.as_f64().is_finite()) {
            return Err(ReconError::InvalidInput("weights must be finite".into()));
        }
        Ok(Self {
            source,
            weights,
            config,
        })
    }

    pub fn n_vols(&self) -> usize {
        self.weights.ncols()
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Volumes, shape `(C, L, L, L)`.
    pub fn estimate(&self) -> Result<Volume<T>> {
        self.estimate_with_report().map(|e| e.volume)
    }

    pub fn estimate_with_report(&self) -> Result<Estimate<T>> {
        estimate_volumes(self.source, self.weights.view(), &self.config)
    }
}

fn check_source<T: Real, S: ImageSource<T> + ?Sized>(
    source: &S,
    weights: ArrayView2<T>,
    config: &EstimatorConfig,
) -> Result<usize> {
    let n = source.n();
    if n == 0 {
        return Err(ReconError::InvalidInput("image source is empty".into()));
    }
    let found = source.dtype();
    if let Some(expected) = config.dtype {
        if expected != found {
            return Err(ReconError::TypeMismatch { expected, found });
        }
    }
    if found != T::DTYPE {
        return Err(ReconError::TypeMismatch {
            expected: T::DTYPE,
            found,
        });
    }
    let len = source.resolution();
    if len == 0 {
        return Err(ReconError::InvalidInput("image source has zero resolution".into()));
    }
    if let Some(expected) = config.resolution {
        if expected != len {
            return Err(ReconError::InvalidInput(format!(
                "configured resolution {expected} does not match source resolution {len}"
            )));
        }
    }
    if source.poses().len() != n {
        return Err(ReconError::InvalidInput(format!(
            "source reports {n} images but {} poses",
            source.poses().len()
        )));
    }
    if weights.nrows() != n {
        return Err(ReconError::InvalidInput(format!(
            "weights have shape {:?} but the source holds {n} images",
            weights.shape()
        )));
    }
    Ok(len)
}

/// Reads images `range` and returns their centered 2D spectra.
fn read_spectra<T: Real, S: ImageSource<T> + ?Sized>(
    source: &S,
    range: Range<usize>,
    fft: &CenteredFft<T>,
) -> Result<Array3<Complex<T>>> {
    let len = fft.len();
    let indices: Vec<usize> = range.collect();
    let images = source.images(&indices)?;
    if images.shape() != [indices.len(), len, len] {
        return Err(ReconError::InvalidInput(format!(
            "image batch has shape {:?}, expected {:?}",
            images.shape(),
            [indices.len(), len, len]
        )));
    }

    let zero = Complex::new(T::zero(), T::zero());
    let mut spectra = Array3::from_elem(images.raw_dim(), zero);
    spectra
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(images.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut out, image)| out.assign(&fft.fft2(image)));
    Ok(spectra)
}

fn estimate_volumes<T: Real, S: ImageSource<T> + ?Sized>(
    source: &S,
    weights: ArrayView2<T>,
    config: &EstimatorConfig,
) -> Result<Estimate<T>> {
    let len = check_source(source, weights, config)?;
    let n = source.n();
    let n_vols = weights.ncols();
    let poses = source.poses();
    info!(
        "estimating {n_vols} volume(s) at L={len} from {n} images ({})",
        T::DTYPE
    );

    let projector = Projector::new(len, config.density_compensation);
    let fft = CenteredFft::new(len);

    let zero = Complex::new(T::zero(), T::zero());
    let mut rhs = Array4::from_elem((n_vols, len, len, len), zero);
    for start in (0..n).step_by(config.batch_size) {
        let end = (start + config.batch_size).min(n);
        let spectra = read_spectra(source, start..end, &fft)?;
        let batch = NormalEquations::new(
            ProjectionOperator::new(&projector, &poses[start..end], weights.slice(s![start..end, ..])),
            0.0,
        );
        rhs += &batch.right_hand_side(spectra.view());
        debug!("back-projected images {start}..{end}");
    }

    let op = NormalEquations::new(
        ProjectionOperator::new(&projector, poses, weights.reborrow()),
        config.regularization,
    );
    let jacobi = match config.preconditioner {
        PreconditionerKind::Jacobi => {
            let jacobi = op.jacobi();
            debug!("jacobi preconditioner: {} unsampled voxels", jacobi.n_unsampled());
            Some(jacobi)
        }
        PreconditionerKind::None => None,
    };
    let preconditioner = jacobi.as_ref().map(|j| j as &dyn Preconditioner<T, Ix4>);

    let (solution, report) =
        conjugate_gradient(&op, rhs.view(), preconditioner, &config.solver_config(T::DTYPE));

    let channels = solution
        .outer_iter()
        .map(|spectrum| fft.ifft3(spectrum).mapv(|v| v.re))
        .collect();
    let volume = Volume::from_channels(channels)?;
    info!(
        "estimate finished after {} iterations, relative residual {:e}",
        report.iterations, report.relative_residual
    );
    Ok(Estimate { volume, report })
}
