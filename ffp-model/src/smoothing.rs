//! Kernel smoothing of footprint fields

use ndarray::{Array2, ArrayView2};

/// 3x3 smoothing kernel applied to footprint fields
pub const SMOOTHING_KERNEL: [[f64; 3]; 3] = [[0.05, 0.1, 0.05], [0.1, 0.4, 0.1], [0.05, 0.1, 0.05]];

/// 2D convolution of `field` with [`SMOOTHING_KERNEL`]
///
/// Values outside the field are taken as zero and the result has the shape of `field`.
pub fn convolve_same(field: ArrayView2<f64>) -> Array2<f64> {
    let (ny, nx) = field.dim();
    Array2::from_shape_fn((ny, nx), |(j, i)| {
        let mut total = 0.0;
        for (kj, row) in SMOOTHING_KERNEL.iter().enumerate() {
            let Some(y) = (j + kj).checked_sub(1).filter(|&y| y < ny) else {
                continue;
            };
            for (ki, weight) in row.iter().enumerate() {
                if let Some(x) = (i + ki).checked_sub(1).filter(|&x| x < nx) {
                    total += weight * field[[y, x]];
                }
            }
        }
        total
    })
}

/// Smooth a footprint field by convolving it twice
pub fn smooth(field: ArrayView2<f64>) -> Array2<f64> {
    let once = convolve_same(field);
    convolve_same(once.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;
    use ndarray::array;

    fn impulse(n: usize) -> Array2<f64> {
        let mut field = Array2::zeros((n, n));
        field[[n / 2, n / 2]] = 1.0;
        field
    }

    #[test]
    fn single_pass_reproduces_the_kernel() {
        let smoothed = convolve_same(impulse(5).view());
        assert!(is_close!(smoothed[[2, 2]], 0.4));
        assert!(is_close!(smoothed[[1, 2]], 0.1));
        assert!(is_close!(smoothed[[3, 3]], 0.05));
        assert_eq!(smoothed[[0, 0]], 0.0);
    }

    #[test]
    fn double_pass_spreads_mass_but_keeps_it() {
        let smoothed = smooth(impulse(7).view());
        assert!(is_close!(smoothed[[3, 3]], 0.21));
        assert!(is_close!(smoothed.sum(), 1.0));
    }

    #[test]
    fn edges_are_zero_padded() {
        let field = array![[1.0, 1.0], [1.0, 1.0]];
        let smoothed = convolve_same(field.view());
        // each corner sees the centre weight, two edge weights and one diagonal weight
        assert!(is_close!(smoothed[[0, 0]], 0.4 + 0.1 + 0.1 + 0.05));
        assert_eq!(smoothed.dim(), (2, 2));
    }
}
