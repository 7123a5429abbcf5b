//! Fourier Shell Correlation (3D) and Fourier Ring Correlation (2D).

use ndarray::{Array2, ArrayView, ArrayView3, Axis, Dimension, Zip};
use rustfft::num_complex::Complex;

use crate::dtype::Real;
use crate::error::{ReconError, Result};
use crate::fourier::CenteredFft;
use crate::utils::{radial_grid_2d, radial_grid_3d};
use crate::volume::Volume;

/// Correlation curves and resolution estimates, one row per compared pair.
#[derive(Debug, Clone)]
pub struct FscResult {
    /// Estimated resolution per pair, in the units of `pixel_size`.
    pub resolution: Vec<f64>,
    /// Shape `(pairs, shells)`.
    pub correlations: Array2<f64>,
    /// Resolution associated with each shell's outer boundary.
    pub shell_resolutions: Vec<f64>,
}

impl FscResult {
    pub fn n_shells(&self) -> usize {
        self.shell_resolutions.len()
    }
}

fn check_params(pixel_size: f64, cutoff: f64) -> Result<()> {
    if !(pixel_size.is_finite() && pixel_size > 0.0) {
        return Err(ReconError::Configuration(format!(
            "pixel_size must be positive, got {pixel_size}"
        )));
    }
    if !(cutoff > 0.0 && cutoff <= 1.0) {
        return Err(ReconError::Configuration(format!(
            "cutoff must lie in (0, 1], got {cutoff}"
        )));
    }
    Ok(())
}

/// Number of shells for grid length `len`: shell `s` covers radii `[s, s+1)`.
pub fn n_shells(len: usize) -> usize {
    (len / 2).max(1)
}

/// Outer-boundary resolution of every shell.
pub fn shell_resolutions(len: usize, pixel_size: f64) -> Vec<f64> {
    (0..n_shells(len))
        .map(|s| len as f64 * pixel_size / (s + 1) as f64)
        .collect()
}

/// Normalized cross-correlation of two centered spectra per radial shell.
pub fn shell_correlation<T: Real, D: Dimension>(
    a: ArrayView<Complex<T>, D>,
    b: ArrayView<Complex<T>, D>,
    radius: ArrayView<f64, D>,
    n_shells: usize,
) -> Vec<f64> {
    let mut cross = vec![0.0f64; n_shells];
    let mut norm_a = vec![0.0f64; n_shells];
    let mut norm_b = vec![0.0f64; n_shells];

    Zip::from(&a).and(&b).and(&radius).for_each(|x, y, &r| {
        let shell = r.floor() as usize;
        if shell < n_shells {
            let (xr, xi) = (x.re.as_f64(), x.im.as_f64());
            let (yr, yi) = (y.re.as_f64(), y.im.as_f64());
            cross[shell] += xr * yr + xi * yi;
            norm_a[shell] += xr * xr + xi * xi;
            norm_b[shell] += yr * yr + yi * yi;
        }
    });

    (0..n_shells)
        .map(|s| {
            let denom = (norm_a[s] * norm_b[s]).sqrt();
            if denom > 0.0 {
                cross[s] / denom
            } else {
                0.0
            }
        })
        .collect()
}

/// Resolution where `correlations` first drops below `cutoff`, interpolating
/// linearly in frequency between the neighbouring shells.
pub fn estimate_resolution(correlations: &[f64], len: usize, pixel_size: f64, cutoff: f64) -> f64 {
    let frequency = |s: usize| (s + 1) as f64 / (len as f64 * pixel_size);

    let Some(first_below) = correlations.iter().position(|&c| c < cutoff) else {
        return 1.0 / frequency(correlations.len().saturating_sub(1));
    };
    if first_below == 0 {
        return 1.0 / frequency(0);
    }

    let (c0, c1) = (correlations[first_below - 1], correlations[first_below]);
    let t = if c0 > c1 { (c0 - cutoff) / (c0 - c1) } else { 0.0 };
    let (f0, f1) = (frequency(first_below - 1), frequency(first_below));
    1.0 / (f0 + t.clamp(0.0, 1.0) * (f1 - f0))
}

/// Pairs channel `i` of `a` with channel `i` of `b`; a single channel on
/// either side is compared against every channel of the other.
fn channel_pairs(ca: usize, cb: usize) -> Result<Vec<(usize, usize)>> {
    match (ca, cb) {
        (x, y) if x == y => Ok((0..x).map(|i| (i, i)).collect()),
        (1, y) => Ok((0..y).map(|i| (0, i)).collect()),
        (x, 1) => Ok((0..x).map(|i| (i, 0)).collect()),
        (x, y) => Err(ReconError::InvalidInput(format!(
            "cannot pair {x} channels with {y} channels"
        ))),
    }
}

pub fn fourier_shell_correlation<T: Real>(
    a: &Volume<T>,
    b: &Volume<T>,
    pixel_size: f64,
    cutoff: f64,
) -> Result<FscResult> {
    check_params(pixel_size, cutoff)?;
    if a.resolution() != b.resolution() {
        return Err(ReconError::InvalidInput(format!(
            "volume resolutions differ: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let pairs = channel_pairs(a.n_vols(), b.n_vols())?;

    let len = a.resolution();
    let shells = n_shells(len);
    let radius = radial_grid_3d(len);
    let fft = CenteredFft::<T>::new(len);

    let spectra_a: Vec<_> = a.data().outer_iter().map(|v| fft.fft3(v)).collect();
    let spectra_b: Vec<_> = b.data().outer_iter().map(|v| fft.fft3(v)).collect();

    let mut correlations = Array2::zeros((pairs.len(), shells));
    for (row, &(i, j)) in pairs.iter().enumerate() {
        let curve = shell_correlation(spectra_a[i].view(), spectra_b[j].view(), radius.view(), shells);
        correlations.row_mut(row).assign(&ndarray::Array1::from(curve));
    }

    Ok(finish(correlations, len, pixel_size, cutoff))
}

/// Ring correlation between two image stacks of shape `(N, L, L)`, image
/// by image.
pub fn fourier_ring_correlation<T: Real>(
    a: ArrayView3<T>,
    b: ArrayView3<T>,
    pixel_size: f64,
    cutoff: f64,
) -> Result<FscResult> {
    check_params(pixel_size, cutoff)?;
    if a.shape() != b.shape() || a.shape()[1] != a.shape()[2] {
        return Err(ReconError::InvalidInput(format!(
            "image stacks must share a (N, L, L) shape, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }

    let len = a.shape()[1];
    let shells = n_shells(len);
    let radius = radial_grid_2d(len);
    let fft = CenteredFft::<T>::new(len);

    let mut correlations = Array2::zeros((a.shape()[0], shells));
    for (row, (x, y)) in a.axis_iter(Axis(0)).zip(b.axis_iter(Axis(0))).enumerate() {
        let curve = shell_correlation(fft.fft2(x).view(), fft.fft2(y).view(), radius.view(), shells);
        correlations.row_mut(row).assign(&ndarray::Array1::from(curve));
    }

    Ok(finish(correlations, len, pixel_size, cutoff))
}

fn finish(correlations: Array2<f64>, len: usize, pixel_size: f64, cutoff: f64) -> FscResult {
    let resolution = correlations
        .outer_iter()
        .map(|row| estimate_resolution(&row.to_vec(), len, pixel_size, cutoff))
        .collect();
    FscResult {
        resolution,
        correlations,
        shell_resolutions: shell_resolutions(len, pixel_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    fn bumpy_volume(len: usize, phase: f64) -> Volume<f64> {
        let data = Array4::from_shape_fn((1, len, len, len), |(_, i, j, k)| {
            let (x, y, z) = (i as f64, j as f64, k as f64);
            (0.7 * x + phase).sin() * (0.4 * y).cos() + (0.9 * z - 0.3 * x).sin()
        });
        Volume::new(data).unwrap()
    }

    #[test]
    fn self_correlation_is_one() {
        let vol = bumpy_volume(12, 0.0);
        let result = vol.fsc(&vol, 1.0, 0.5).unwrap();

        assert_eq!(result.n_shells(), 6);
        for &c in result.correlations.row(0).iter() {
            assert!((c - 1.0).abs() < 1e-12, "c = {c}");
        }
        // never drops: last shell sits at Nyquist
        assert!((result.resolution[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn correlation_is_symmetric() {
        let a = bumpy_volume(10, 0.0);
        let b = bumpy_volume(10, 1.3);
        let ab = a.fsc(&b, 1.0, 0.5).unwrap();
        let ba = b.fsc(&a, 1.0, 0.5).unwrap();
        for (x, y) in ab.correlations.iter().zip(ba.correlations.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_eq!(ab.resolution, ba.resolution);
    }

    #[test]
    fn resolution_interpolates_between_shells() {
        // freq(s) = (s+1)/L; crossing halfway between shells 1 and 2
        let curve = [1.0, 0.9, 0.1, 0.0];
        let res = estimate_resolution(&curve, 8, 1.0, 0.5);
        let expected = 1.0 / ((2.0 + 0.5) / 8.0);
        assert!((res - expected).abs() < 1e-12);

        assert!((estimate_resolution(&[0.2, 0.1], 8, 2.0, 0.5) - 16.0).abs() < 1e-12);
    }

    #[test]
    fn ring_correlation_of_identical_stacks() {
        let stack = Array3::from_shape_fn((3, 8, 8), |(n, i, j)| ((n + i * j) % 7) as f64);
        let result = fourier_ring_correlation(stack.view(), stack.view(), 1.0, 0.143).unwrap();
        assert_eq!(result.correlations.shape(), &[3, 4]);
        assert!(result.correlations.iter().all(|&c| (c - 1.0).abs() < 1e-12 || c == 0.0));
    }

    #[test]
    fn rejects_bad_parameters() {
        let vol = bumpy_volume(6, 0.0);
        assert!(matches!(vol.fsc(&vol, 0.0, 0.5), Err(ReconError::Configuration(_))));
        assert!(matches!(vol.fsc(&vol, 1.0, 1.5), Err(ReconError::Configuration(_))));
        let other = bumpy_volume(8, 0.0);
        assert!(matches!(vol.fsc(&other, 1.0, 0.5), Err(ReconError::InvalidInput(_))));
    }
}
