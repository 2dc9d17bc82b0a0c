//! Joint embedding of two libraries and alignment of their coordinates.
//!
//! The stages run in order: `run_cca` computes the canonical correlate space, then
//! `calc_var_exp_ratio` and `discard_poorly_integrated` drop cells the shared space explains
//! poorly, then `align_subspace` matches the per-library distributions dimension by dimension.

use anyhow::Error;
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use scalign_types::embedding::{CCA, CCA_ALIGNED};
use scalign_types::{Embedding, MergedObject, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

mod cca;
mod quantile;
mod var_ratio;

pub use cca::Cca;
pub use quantile::QuantileAligner;
pub use var_ratio::{calc_var_exp_ratio, discard_poorly_integrated, VAR_RATIO};

/// Cells × k coordinates shared by two libraries, plus the strength of each dimension.
#[derive(Clone, Debug)]
pub struct JointEmbedding {
    /// rows are the cells of the first block followed by the cells of the second
    pub coords: Array2<f64>,
    pub correlations: Array1<f64>,
}

/// Computes a shared low-dimensional space for two gene × cell blocks over the same genes.
pub trait JointEmbedder {
    fn embed(&self, x: ArrayView2<f64>, y: ArrayView2<f64>, k: usize) -> Result<JointEmbedding, Error>;
}

/// Maps the coordinates of each cell group so the groups' distributions agree.
pub trait SubspaceAligner {
    /// `groups` partition the rows of `coords`. Returns aligned coordinates of the same shape.
    fn align(&self, coords: ArrayView2<f64>, groups: &[Vec<usize>]) -> Result<Array2<f64>, Error>;
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct CcaParams {
    /// number of canonical correlates to compute
    #[default = 30]
    pub num_cc: usize,
    #[default = 42]
    pub seed: u64,
    /// power iterations of the randomized SVD
    #[default = 7]
    pub n_iter: usize,
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignParams {
    /// leading correlates used for the variance ratio and the alignment
    #[default = 20]
    pub dims: usize,
    /// cells whose variance ratio falls below this are discarded
    #[default = 0.5]
    pub var_ratio_threshold: f64,
}

impl AlignParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.dims == 0 {
            return Err(PipelineError::invalid("alignment needs at least one dimension"));
        }
        if !self.var_ratio_threshold.is_finite() || self.var_ratio_threshold < 0.0 {
            return Err(PipelineError::invalid(format!(
                "variance-ratio threshold {} must be a non-negative number",
                self.var_ratio_threshold
            )));
        }
        Ok(())
    }
}

/// Run `embedder` on the two libraries' scaled blocks and store the result as `cca`.
pub fn run_cca(mut merged: MergedObject, embedder: &impl JointEmbedder, k: usize) -> Result<MergedObject, Error> {
    merged.stages.require(Stage::Merged, Stage::JointEmbedded)?;
    let [ia, ib] = merged.library_indices();
    let x = merged.scaled.matrix.select(Axis(1), &ia);
    let y = merged.scaled.matrix.select(Axis(1), &ib);
    let joint = embedder.embed(x.view(), y.view(), k)?;

    let mut coords = Array2::zeros((merged.n_cells(), k));
    for (row, &cell) in ia.iter().chain(ib.iter()).enumerate() {
        coords.row_mut(cell).assign(&joint.coords.row(row));
    }
    info!(
        "computed {} canonical correlates over {} genes; leading correlations {:?}",
        k,
        merged.scaled.n_genes(),
        joint.correlations.iter().take(5).collect::<Vec<_>>()
    );
    merged.add_embedding(Embedding::new(CCA, merged.cell_ids().to_vec(), coords)?)?;
    merged.stages.mark(Stage::JointEmbedded);
    Ok(merged)
}

/// Align the leading `dims` correlates across libraries and store them as `cca.aligned`.
pub fn align_subspace(
    mut merged: MergedObject,
    aligner: &impl SubspaceAligner,
    dims: usize,
) -> Result<MergedObject, Error> {
    let cca = merged.require_embedding(CCA, Stage::JointEmbedded, Stage::Aligned)?;
    if dims == 0 || dims > cca.dims() {
        return Err(PipelineError::invalid(format!(
            "cannot align {dims} dimensions of a {}-dimensional embedding",
            cca.dims()
        ))
        .into());
    }
    let groups = merged.library_indices().to_vec();
    let aligned = aligner.align(cca.leading(dims), &groups)?;
    info!("aligned {} dimensions across {} cells", dims, merged.n_cells());
    merged.add_embedding(Embedding::new(CCA_ALIGNED, merged.cell_ids().to_vec(), aligned)?)?;
    merged.stages.mark(Stage::Aligned);
    Ok(merged)
}


#[cfg(test)]
mod test {
    use super::test_util::two_libraries;
    use super::*;

    #[test]
    fn test_run_cca_and_align() {
        let merged = two_libraries(30, 3);
        let merged = run_cca(merged, &Cca::default(), 5).unwrap();
        let cca = merged.embedding(CCA).unwrap();
        assert_eq!(cca.coords.dim(), (60, 5));
        assert!(merged.stages.has_run(Stage::JointEmbedded));

        let merged = align_subspace(merged, &QuantileAligner, 3).unwrap();
        assert_eq!(merged.embedding(CCA_ALIGNED).unwrap().dims(), 3);
        assert!(merged.stages.has_run(Stage::Aligned));
        assert!(align_subspace(merged, &QuantileAligner, 6).is_err());
    }

    #[test]
    fn test_align_requires_cca() {
        let err = align_subspace(two_libraries(10, 4), &QuantileAligner, 2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::Ordering {
                required: Stage::JointEmbedded,
                attempted: Stage::Aligned
            })
        );
    }
}
