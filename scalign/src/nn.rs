//! Nearest-neighbor search over the rows of a dense matrix.

use anyhow::{format_err, Error};
use ball_tree::{BallTree, Point};
use log::info;
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView2, Axis};
use num_traits::bounds::Bounded;
use num_traits::cast::FromPrimitive;
use num_traits::identities::Zero;
use scalign_types::PipelineError;

#[derive(PartialEq)]
struct Pt(Vec<f64>);

impl Point for Pt {
    fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|p| (p.1 - p.0).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let total_dist = self.distance(other);
        let frac = if total_dist == 0.0 { 0.0 } else { d / total_dist };

        Pt(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&s, &o)| s + frac * (o - s))
            .collect())
    }
}

/// Compute the `k` nearest neighbors of each row in `v`, using Euclidean distance. Each row represents a n-dimensional
/// vector where n is the number of columns in `v`. A row is never its own neighbor; neighbors are ordered nearest first.
pub fn knn<T>(v: &ArrayView2<f64>, k: usize) -> Result<Array2<T>, Error>
where
    T: Bounded + Clone + Copy + FromPrimitive + Send + Sync + Zero,
{
    let (cells, _) = v.dim();
    if k >= cells {
        return Err(PipelineError::invalid(format!("cannot find {k} neighbors among {cells} points")).into());
    }
    if T::from_usize(cells).is_none() {
        return Err(format_err!("{cells} points do not fit the neighbor index type"));
    }

    let mut points = Vec::with_capacity(cells);
    let mut values = Vec::with_capacity(cells);

    info!("constructing ball tree of {} points", cells);
    for (i, row) in v.rows().into_iter().enumerate() {
        points.push(Pt(row.to_vec()));
        values.push(i);
    }
    let ball_tree = BallTree::new(points, values);

    info!("querying points for {} neighbors", k);
    let mut output = Array2::from_elem((cells, k), T::max_value());
    output.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each_init(
        || ball_tree.query(),
        |query, (cell, mut output)| {
            let mut ind = 0;
            let pt = Pt(v.row(cell).to_vec());
            for (_, _, &v) in query.nn(&pt).take(k + 1) {
                if v != cell && ind < k {
                    if let Some(t) = T::from_usize(v) {
                        output[ind] = t;
                    }
                    ind += 1;
                }
            }
        },
    );
    Ok(output)
}
