use ndarray::{Array2, Array3};

/// Centered coordinate of index `i` on an axis of length `len`.
#[inline]
pub fn centered(i: usize, len: usize) -> f64 {
    i as f64 - (len / 2) as f64
}

/// Distance of every grid point from the center of an L×L grid.
pub fn radial_grid_2d(len: usize) -> Array2<f64> {
    Array2::from_shape_fn((len, len), |(i, j)| {
        let (x, y) = (centered(i, len), centered(j, len));
        (x * x + y * y).sqrt()
    })
}

/// Distance of every grid point from the center of an L×L×L grid.
pub fn radial_grid_3d(len: usize) -> Array3<f64> {
    Array3::from_shape_fn((len, len, len), |(i, j, k)| {
        let (x, y, z) = (centered(i, len), centered(j, len), centered(k, len));
        (x * x + y * y + z * z).sqrt()
    })
}

/// Worker count for the rayon pool: the available parallelism, capped by
/// `max_threads` when given.
pub fn num_procs_suggestion(max_threads: Option<usize>) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match max_threads {
        Some(cap) => available.min(cap.max(1)),
        None => available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_centered() {
        let even = radial_grid_2d(4);
        assert_eq!(even[[2, 2]], 0.0);
        assert_eq!(even[[0, 2]], 2.0);

        let odd = radial_grid_3d(5);
        assert_eq!(odd[[2, 2, 2]], 0.0);
        assert!((odd[[0, 0, 0]] - 12f64.sqrt()).abs() < 1e-12);
        assert_eq!(odd[[4, 2, 2]], 2.0);
    }

    #[test]
    fn procs_respect_cap() {
        assert_eq!(num_procs_suggestion(Some(1)), 1);
        assert!(num_procs_suggestion(None) >= 1);
    }
}
