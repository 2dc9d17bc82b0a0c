//! Two- or three-dimensional projections of the aligned space for visualization.

use crate::nn::knn;
use anyhow::{format_err, Error};
use log::{debug, info};
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use ndarray_rand::RandomExt;
use ndarray_stats::QuantileExt;
use rand::SeedableRng;
use rand_distr::Normal;
use rand_pcg::Pcg64Mcg;
use scalign_types::embedding::CCA_ALIGNED;
use scalign_types::{Embedding, MergedObject, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use sprs::{CsMat, TriMat};

mod sptree;
use sptree::{sq_dist, SpaceTree};

/// Maps cells × d coordinates to cells × `n_dims()` coordinates.
pub trait EmbeddingProjector {
    fn n_dims(&self) -> usize;
    fn project(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, Error>;
}

/// Barnes-Hut t-SNE. Input affinities are kept on the `3 * perplexity` nearest neighbors of
/// each cell; repulsive forces are estimated through a space-partitioning tree over the output,
/// with `theta` trading accuracy for speed (`0` is exact). Optimization is gradient descent
/// with momentum, adaptive gains and early exaggeration.
#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct Tsne {
    #[default = 2]
    pub n_dims: usize,
    #[default = 30.0]
    pub perplexity: f64,
    #[default = 0.5]
    pub theta: f64,
    #[default = 1000]
    pub max_iter: usize,
    #[default = 12.0]
    pub exaggeration: f64,
    #[default = 250]
    pub stop_lying_iter: usize,
    #[default = 250]
    pub mom_switch_iter: usize,
    #[default = 200.0]
    pub learning_rate: f64,
    #[default = 0.5]
    pub initial_momentum: f64,
    #[default = 0.8]
    pub final_momentum: f64,
    #[default = 0]
    pub seed: u64,
}

// binary search for the per-cell Gaussian bandwidth
const PERPLEXITY_TOL: f64 = 1e-5;
const PERPLEXITY_MAX_STEPS: usize = 200;

/// Center the input and scale it so the largest absolute value is 1.
fn normalize_input(x: ArrayView2<f64>) -> Array2<f64> {
    let mut x = x.to_owned();
    if let Some(mean) = x.mean_axis(Axis(0)) {
        x -= &mean;
    }
    let max = *x.mapv(f64::abs).max_skipnan();
    if max > 0.0 {
        x /= max;
    }
    x
}

/// Conditional probabilities p(j|i) over the squared distances from cell i to its neighbors,
/// with the bandwidth chosen so the row's perplexity matches `perplexity`.
fn conditional_row(dist: ArrayView1<f64>, perplexity: f64, mut out: ArrayViewMut1<f64>) {
    let target = perplexity.ln();
    let mut beta = 1.0;
    let mut lo = f64::NEG_INFINITY;
    let mut hi = f64::INFINITY;

    for _ in 0..PERPLEXITY_MAX_STEPS {
        let mut sum = f64::MIN_POSITIVE;
        let mut weighted = 0.0;
        for (o, &d) in out.iter_mut().zip(dist.iter()) {
            let p = (-beta * d).exp();
            *o = p;
            sum += p;
            weighted += beta * d * p;
        }
        let entropy = weighted / sum + sum.ln();
        let diff = entropy - target;
        if diff.abs() < PERPLEXITY_TOL {
            break;
        }
        if diff > 0.0 {
            lo = beta;
            beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
        } else {
            hi = beta;
            beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
        }
    }

    let sum = out.sum() + f64::MIN_POSITIVE;
    out /= sum;
}

/// Symmetric joint probabilities over the kNN graph, summing to 1. Each row holds at most
/// `2 * k` entries for `k = 3 * perplexity` neighbors.
fn joint_probabilities(x: ArrayView2<f64>, perplexity: f64) -> Result<CsMat<f64>, Error> {
    let n = x.nrows();
    let k = ((3.0 * perplexity) as usize).clamp(1, n.saturating_sub(1).max(1));
    let neighbors = knn::<usize>(&x, k)?;

    let mut cond = Array2::<f64>::zeros((n, k));
    cond.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, row)| {
            let dist = neighbors
                .row(i)
                .iter()
                .map(|&j| sq_dist(x.row(i), x.row(j)))
                .collect::<Array1<f64>>();
            conditional_row(dist.view(), perplexity, row);
        });

    // duplicate triplets are summed, giving p(j|i) + p(i|j)
    let mut tri = TriMat::with_capacity((n, n), 2 * n * k);
    for ((i, c), &p) in cond.indexed_iter() {
        let j = neighbors[[i, c]];
        tri.add_triplet(i, j, p);
        tri.add_triplet(j, i, p);
    }
    let mut joint: CsMat<f64> = tri.to_csr();
    let total: f64 = joint.data().iter().sum();
    if total > 0.0 {
        joint.map_inplace(|&v| v / total);
    }
    Ok(joint)
}

/// t-SNE gradient with the attractive term over the sparse affinities and the repulsive term
/// from the tree. Returns the gradient and the normalization Z of the output kernel.
fn gradient(p: &CsMat<f64>, y: &Array2<f64>, exaggeration: f64, theta: f64) -> (Array2<f64>, f64) {
    let tree = SpaceTree::new(y.view());
    let mut attract = Array2::<f64>::zeros(y.raw_dim());
    let mut repel = Array2::<f64>::zeros(y.raw_dim());

    let sum_q: f64 = attract
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(repel.axis_iter_mut(Axis(0)))
        .enumerate()
        .map(|(i, (mut a, mut r))| {
            if let Some(row) = p.outer_view(i) {
                for (j, &pij) in row.iter() {
                    let q = 1.0 / (1.0 + sq_dist(y.row(i), y.row(j)));
                    for k in 0..a.len() {
                        a[k] += pij * q * (y[[i, k]] - y[[j, k]]);
                    }
                }
            }
            tree.repulsion(i, theta, &mut r)
        })
        .sum();
    let sum_q = sum_q.max(f64::MIN_POSITIVE);

    let grad = (attract * exaggeration - repel / sum_q) * 4.0;
    (grad, sum_q)
}

/// KL(P || Q) over the stored affinities, with Z from the tree estimate.
fn kl_divergence(p: &CsMat<f64>, y: &Array2<f64>, sum_q: f64) -> f64 {
    p.iter()
        .filter(|(pij, _)| **pij > 0.0)
        .map(|(&pij, (i, j))| {
            let q = (1.0 / (1.0 + sq_dist(y.row(i), y.row(j))) / sum_q).max(f64::MIN_POSITIVE);
            pij * (pij / q).ln()
        })
        .sum()
}

impl Tsne {
    pub fn validate(&self, n_cells: usize) -> Result<(), PipelineError> {
        if !(2..=3).contains(&self.n_dims) {
            return Err(PipelineError::invalid(format!(
                "t-SNE projects to 2 or 3 dimensions, not {}",
                self.n_dims
            )));
        }
        if !(self.perplexity > 0.0) || 3.0 * self.perplexity >= n_cells as f64 - 1.0 {
            return Err(PipelineError::invalid(format!(
                "perplexity {} is too large for {} cells",
                self.perplexity, n_cells
            )));
        }
        if !(self.theta >= 0.0) {
            return Err(PipelineError::invalid(format!(
                "Barnes-Hut theta must be non-negative, got {}",
                self.theta
            )));
        }
        if self.max_iter == 0 || !(self.learning_rate > 0.0) {
            return Err(PipelineError::invalid("t-SNE needs iterations and a positive learning rate"));
        }
        Ok(())
    }
}

impl EmbeddingProjector for Tsne {
    fn n_dims(&self) -> usize {
        self.n_dims
    }

    fn project(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
        let n = x.nrows();
        self.validate(n)?;

        let x = normalize_input(x);
        let p = joint_probabilities(x.view(), self.perplexity)?;
        debug!("t-SNE affinities: {} non-zero of {} cells", p.nnz(), n);

        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let init = Normal::new(0.0, 1e-4).map_err(|e| format_err!("{e}"))?;
        let mut y = Array2::random_using((n, self.n_dims), init, &mut rng);
        let mut update = Array2::<f64>::zeros(y.raw_dim());
        let mut gains = Array2::<f64>::ones(y.raw_dim());

        for iter in 0..self.max_iter {
            let exaggeration = if iter < self.stop_lying_iter { self.exaggeration } else { 1.0 };
            let momentum = if iter < self.mom_switch_iter {
                self.initial_momentum
            } else {
                self.final_momentum
            };

            let (grad, sum_q) = gradient(&p, &y, exaggeration, self.theta);

            ndarray::Zip::from(&mut gains)
                .and(&mut update)
                .and(&grad)
                .for_each(|gain, u, &dy| {
                    *gain = if (dy > 0.0) != (*u > 0.0) {
                        *gain + 0.2
                    } else {
                        (*gain * 0.8).max(0.01)
                    };
                    *u = momentum * *u - self.learning_rate * *gain * dy;
                });
            y += &update;
            if let Some(mean) = y.mean_axis(Axis(0)) {
                y -= &mean;
            }

            if (iter + 1) % 50 == 0 {
                debug!("t-SNE iteration {}: KL divergence {:.5}", iter + 1, kl_divergence(&p, &y, sum_q));
            }
        }
        Ok(y)
    }
}

/// Project the leading `dims` aligned correlates with `projector` and store the result as an
/// embedding called `name`.
pub fn run_tsne(
    mut merged: MergedObject,
    projector: &impl EmbeddingProjector,
    dims: usize,
    name: &str,
) -> Result<MergedObject, Error> {
    let aligned = merged.require_embedding(CCA_ALIGNED, Stage::Aligned, Stage::Projected)?;
    if dims == 0 || dims > aligned.dims() {
        return Err(PipelineError::invalid(format!(
            "cannot project {dims} dimensions of a {}-dimensional embedding",
            aligned.dims()
        ))
        .into());
    }
    info!(
        "projecting {} cells from {} to {} dimensions",
        merged.n_cells(),
        dims,
        projector.n_dims()
    );
    let coords = projector.project(aligned.leading(dims))?;
    merged.add_embedding(Embedding::new(name, merged.cell_ids().to_vec(), coords)?)?;
    merged.stages.mark(Stage::Projected);
    Ok(merged)
}
