#![allow(non_snake_case)]

//! Truncated SVD and PCA.
//!
//! The randomized SVD is written against the `DataMat` trait plus a set of `Dot` bounds on the
//! method, so the same code runs on owned arrays and on views. The bounds cover `A * b` and
//! `b * A` for a dense query `b`; spelling them out on each method keeps the `dot` overloads
//! for both `Array2` and `ArrayView2` available inside the algorithm.

use anyhow::Error;
use ndarray::{Array1, Array2, ArrayView2};

/// Randomized SVD method
pub mod rand_svd;

/// `(U, sigma, V)` of a truncated SVD: `U` is rows × k, `V` is cols × k
pub type PcaResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Trait for getting the dimensions of a matrix
pub trait DataMat {
    /// Get the shape of the matrix
    fn shape(&self) -> [usize; 2];
}

impl DataMat for ArrayView2<'_, f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }
}

impl DataMat for Array2<f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }
}

/// Perform a SVD of a `matrix`, retaining `k` components.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca<T, N> {
    /// Compute a rank `k` decomposition of `matrix`
    fn run_pca(&self, matrix: &T, k: usize) -> Result<PcaResult, Error>;
}

#[cfg(test)]
mod test {
    use super::rand_svd::RandSvd;
    use super::*;
    use ndarray_linalg::SVD;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    fn rms(a: &ArrayView2<f64>) -> f64 {
        let sz = a.len().max(1) as f64;
        (a.iter().map(|v| v * v).sum::<f64>() / sz).sqrt()
    }

    /// rank-3 signal plus a little noise
    fn low_rank(m: usize, n: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let a = Array2::random_using((m, 3), normal, &mut rng);
        let b = Array2::random_using((3, n), normal, &mut rng);
        let noise = Array2::random_using((m, n), Normal::new(0.0, 1e-3).unwrap(), &mut rng);
        a.dot(&b) * 10.0 + noise
    }

    fn check_against_exact(a: &Array2<f64>, k: usize) {
        let (u, s, v) = RandSvd::default().run_pca(a, k).unwrap();
        assert_eq!(u.dim(), (a.nrows(), k));
        assert_eq!(v.dim(), (a.ncols(), k));

        let (_, exact, _) = a.svd(false, false).unwrap();
        for i in 0..k {
            assert!((s[i] - exact[i]).abs() / exact[i] < 1e-6, "{s} vs {exact}");
        }

        // A v = U s
        let diff = a.dot(&v) - &u * &s;
        assert!(rms(&diff.view()) < 1e-6 * s[0]);
    }

    #[test]
    fn test_rand_svd_tall_and_wide() {
        check_against_exact(&low_rank(60, 25, 0), 3);
        check_against_exact(&low_rank(25, 60, 1), 3);
    }

    #[test]
    fn test_rand_svd_rejects_bad_rank() {
        let a = low_rank(10, 8, 2);
        assert!(RandSvd::default().run_pca(&a, 9).is_err());
        assert!(RandSvd::default().run_pca(&a, 0).is_err());
    }
}
