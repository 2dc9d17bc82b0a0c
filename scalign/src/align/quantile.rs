use super::SubspaceAligner;
use anyhow::Error;
use ndarray::{Array2, ArrayView1, ArrayView2};
use noisy_float::types::{n64, N64};
use rayon::prelude::*;
use scalign_types::PipelineError;

/// Rank-quantile alignment: along every dimension, each group's values are replaced by the
/// pooled distribution's value at the same quantile, with linear interpolation between order
/// statistics. Groups keep their internal ordering and end up identically distributed.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuantileAligner;

/// Value of the sorted sample `sorted` at quantile `q` in `[0, 1]`.
fn interpolate(sorted: &[N64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    sorted[lo].raw() * (1.0 - frac) + sorted[hi].raw() * frac
}

fn align_dimension(values: ArrayView1<f64>, groups: &[Vec<usize>]) -> Vec<f64> {
    let mut pooled = values.iter().map(|&v| n64(v)).collect::<Vec<_>>();
    pooled.sort_unstable();

    let mut out = vec![0.0; values.len()];
    for group in groups {
        let mut order = group.clone();
        order.sort_by_key(|&i| (n64(values[i]), i));
        let n = order.len();
        for (rank, &cell) in order.iter().enumerate() {
            let q = if n > 1 { rank as f64 / (n - 1) as f64 } else { 0.5 };
            out[cell] = interpolate(&pooled, q);
        }
    }
    out
}

impl SubspaceAligner for QuantileAligner {
    fn align(&self, coords: ArrayView2<f64>, groups: &[Vec<usize>]) -> Result<Array2<f64>, Error> {
        let n = coords.nrows();
        let mut seen = vec![false; n];
        for &i in groups.iter().flatten() {
            if i >= n || std::mem::replace(&mut seen[i], true) {
                return Err(PipelineError::invalid("alignment groups must partition the cells").into());
            }
        }
        if seen.iter().any(|s| !s) || groups.iter().any(Vec::is_empty) {
            return Err(PipelineError::invalid("alignment groups must partition the cells").into());
        }
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::invalid("coordinates to align must be finite").into());
        }

        let columns = coords
            .columns()
            .into_iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|col| align_dimension(col, groups))
            .collect::<Vec<_>>();

        let mut aligned = Array2::zeros(coords.raw_dim());
        for (j, col) in columns.into_iter().enumerate() {
            for (i, v) in col.into_iter().enumerate() {
                aligned[[i, j]] = v;
            }
        }
        Ok(aligned)
    }
}
