use super::{JointEmbedder, JointEmbedding};
use crate::dim_red::rand_svd::svd_rand;
use crate::stats::mean_sd;
use anyhow::Error;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use scalign_types::PipelineError;

/// Canonical correlation analysis via a randomized SVD of the cell × cell cross product.
#[derive(Clone, Debug)]
pub struct Cca {
    /// Multiple of k used for the random projection
    pub l_multiplier: f64,
    /// Power iterations
    pub n_iter: usize,
    pub seed: u64,
}

impl Default for Cca {
    fn default() -> Self {
        Cca {
            l_multiplier: 10.0,
            n_iter: 7,
            seed: 42,
        }
    }
}

/// Standardize each column (cell) across genes. Constant columns become zero.
fn standardize_columns(x: ArrayView2<f64>) -> Array2<f64> {
    let mut out = x.to_owned();
    for mut col in out.columns_mut() {
        let (mean, sd) = mean_sd(col.view());
        if sd > 0.0 {
            col.mapv_inplace(|v| (v - mean) / sd);
        } else {
            col.fill(0.0);
        }
    }
    out
}

impl JointEmbedder for Cca {
    fn embed(&self, x: ArrayView2<f64>, y: ArrayView2<f64>, k: usize) -> Result<JointEmbedding, Error> {
        if x.nrows() != y.nrows() {
            return Err(PipelineError::invalid(format!(
                "blocks have {} and {} genes",
                x.nrows(),
                y.nrows()
            ))
            .into());
        }
        let (n1, n2) = (x.ncols(), y.ncols());
        if k == 0 || k > n1.min(n2) {
            return Err(PipelineError::invalid(format!(
                "number of correlates {k} must lie in [1, {}]",
                n1.min(n2)
            ))
            .into());
        }

        let x = standardize_columns(x);
        let y = standardize_columns(y);
        let cross = x.t().dot(&y);

        let l = std::cmp::max(k + 4, ((k as f64) * self.l_multiplier) as usize);
        let (u, d, vt) = svd_rand(&cross, k, l, self.n_iter, self.seed)?;
        let mut coords = concatenate(Axis(0), &[u.view(), vt.t()])?;

        for mut col in coords.columns_mut() {
            if col[0] < 0.0 {
                col.mapv_inplace(|v| -v);
            }
        }
        Ok(JointEmbedding {
            coords,
            correlations: d,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{array, s};

    #[test]
    fn test_standardize_columns() {
        let x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let z = standardize_columns(x.view());
        assert_eq!(z.column(0).to_vec(), vec![-1.0, 0.0, 1.0]);
        assert_eq!(z.column(1).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cca_shapes_and_signs() {
        // 6 genes; both blocks share the same two cell profiles
        let p = [1.0, 4.0, 2.0, 8.0, 0.5, 3.0];
        let q = [5.0, 1.0, 6.0, 0.0, 2.0, 1.5];
        let block = |n: usize| Array2::from_shape_fn((6, n), |(g, c)| {
            let base = if c % 2 == 0 { p[g] } else { q[g] };
            base + c as f64 * 0.01 * g as f64
        });
        let x = block(4);
        let y = block(5);
        let joint = Cca::default().embed(x.view(), y.view(), 2).unwrap();
        assert_eq!(joint.coords.dim(), (9, 2));
        assert!(joint.coords.row(0).iter().all(|&v| v >= 0.0));
        assert!(joint.correlations[0] >= joint.correlations[1]);

        // cells of the same profile land on the same side of the first correlate
        let first = joint.coords.slice(s![.., 0]);
        assert!(first[0] * first[4] > 0.0);

        assert!(Cca::default().embed(x.view(), y.view(), 5).is_err());
        assert!(Cca::default().embed(x.view(), y.slice(s![..5, ..]), 2).is_err());
    }
}
