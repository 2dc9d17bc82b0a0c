use anyhow::{bail, Error};
use ndarray::{s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Canonical correlate space
pub const CCA: &str = "cca";
/// Canonical correlate space after per-dimension distribution alignment
pub const CCA_ALIGNED: &str = "cca.aligned";
/// 2-D/3-D t-SNE projection
pub const TSNE: &str = "tsne";

/// Cells × k coordinates in a named space. Rows follow `cell_ids`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub name: String,
    pub cell_ids: Vec<String>,
    pub coords: Array2<f64>,
}

impl Embedding {
    pub fn new(name: &str, cell_ids: Vec<String>, coords: Array2<f64>) -> Result<Embedding, Error> {
        if coords.nrows() != cell_ids.len() {
            bail!(
                "embedding {} has {} rows for {} cells",
                name,
                coords.nrows(),
                cell_ids.len()
            );
        }
        Ok(Embedding {
            name: name.to_string(),
            cell_ids,
            coords,
        })
    }

    pub fn dims(&self) -> usize {
        self.coords.ncols()
    }

    /// The first `dims` coordinates of every cell
    pub fn leading(&self, dims: usize) -> ArrayView2<'_, f64> {
        self.coords.slice(s![.., ..dims.min(self.dims())])
    }

    /// Keep the rows at `idx`, in that order.
    pub fn subset(&self, idx: &[usize]) -> Embedding {
        Embedding {
            name: self.name.clone(),
            cell_ids: idx.iter().map(|&i| self.cell_ids[i].clone()).collect(),
            coords: self.coords.select(Axis(0), idx),
        }
    }
}
