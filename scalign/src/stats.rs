//! Statistics functions

use ndarray::prelude::*;
use ndarray::DataMut;
use noisy_float::types::{n64, N64};
use num_traits::FromPrimitive;
use std::ops::{Add, Div};

/// Return the median, or `None` for empty input. Sorts its argument in place.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Option<T>
where
    S: DataMut<Elem = T>,
    T: Clone + Copy + Ord + FromPrimitive + Add<Output = T> + Div<Output = T>,
{
    if xs.is_empty() {
        return None;
    }
    // ndarray-stats' quantile_mut can overflow the stack on large inputs; sort instead
    match xs.as_slice_mut() {
        Some(v) => v.sort_unstable(),
        None => {
            let mut v = xs.to_vec();
            v.sort_unstable();
            xs.assign(&Array1::from(v));
        }
    }
    let n = xs.len();
    Some(if n % 2 == 0 {
        (xs[n / 2] + xs[n / 2 - 1]) / T::from_u64(2)?
    } else {
        xs[n / 2]
    })
}

/// Median of a float slice. NaNs are skipped; `None` when nothing is left.
pub fn median(xs: &[f64]) -> Option<f64> {
    let mut v = xs.iter().filter(|x| !x.is_nan()).map(|&x| n64(x)).collect::<Array1<N64>>();
    median_mut(&mut v).map(N64::raw)
}

/// Mean and sample standard deviation (n - 1 denominator). A single value has sd 0.
pub fn mean_sd(xs: ArrayView1<f64>) -> (f64, f64) {
    let n = xs.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = xs.sum() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    (mean, xs.std(1.0))
}

#[cfg(test)]
mod test_stats {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_median_mut() {
        assert_eq!(median_mut(&mut Array1::<usize>::from(vec![])), None);
        assert_eq!(median_mut(&mut array![1]), Some(1));
        assert_eq!(median_mut(&mut array![10, 1]), Some(5));
        assert_eq!(median_mut(&mut array![100, 1, 10]), Some(10));
        assert_eq!(median_mut(&mut array![1., 10., 100., 1000.].mapv(n64)), Some(n64(55.0)));
    }

    #[test]
    fn test_median_skips_nan() {
        assert_eq!(median(&[3.0, f64::NAN, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[f64::NAN]), None);
    }

    #[test]
    fn test_mean_sd() {
        let (m, sd) = mean_sd(array![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].view());
        assert_eq!(m, 5.0);
        assert!((sd - 2.138089935299395).abs() < 1e-12);
        assert_eq!(mean_sd(array![3.0].view()), (3.0, 0.0));
    }
}
