//! Graph-based clustering of the aligned correlate space: a shared-nearest-neighbor graph
//! partitioned by modularity optimization.

use crate::nn::knn;
use anyhow::Error;
use itertools::Itertools;
use log::info;
use scalign_types::embedding::CCA_ALIGNED;
use scalign_types::{MergedObject, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

mod louvain;
mod network;
mod snn;

pub use louvain::Louvain;
pub use network::Network;
pub use snn::build_snn;

/// Partitions the nodes of a weighted graph into communities.
pub trait CommunityDetector {
    /// One label per node. Labels are dense but carry no ordering.
    fn detect(&self, network: &Network, resolution: f64) -> Result<Vec<usize>, Error>;
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// leading aligned dimensions used for the neighbor search
    #[default = 20]
    pub dims: usize,
    /// neighborhood size, counting the cell itself
    #[default = 30]
    pub k: usize,
    /// SNN edges lighter than this are dropped
    #[default(1.0 / 15.0)]
    pub prune: f64,
    #[default = 0.8]
    pub resolution: f64,
    #[default = 10]
    pub n_starts: usize,
    #[default = 10]
    pub n_iterations: usize,
    #[default = 0]
    pub seed: u64,
}

impl ClusterParams {
    pub fn louvain(&self) -> Louvain {
        Louvain {
            n_starts: self.n_starts,
            n_iterations: self.n_iterations,
            seed: self.seed,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.dims == 0 {
            return Err(PipelineError::invalid("clustering needs at least one dimension"));
        }
        if self.k < 2 {
            return Err(PipelineError::invalid(format!("neighborhood size {} is below 2", self.k)));
        }
        if !(0.0..=1.0).contains(&self.prune) {
            return Err(PipelineError::invalid(format!("prune threshold {} is outside [0, 1]", self.prune)));
        }
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(PipelineError::invalid(format!(
                "resolution {} must be positive",
                self.resolution
            )));
        }
        Ok(())
    }
}

/// Renumber clusters by decreasing size: 0 is the largest. Equal sizes keep the order of the
/// original labels.
pub fn relabel_by_size(labels: &[usize]) -> Vec<u32> {
    let n = labels.iter().max().map_or(0, |&l| l + 1);
    let mut sizes = vec![0usize; n];
    for &l in labels {
        sizes[l] += 1;
    }
    let order = (0..n)
        .filter(|&l| sizes[l] > 0)
        .sorted_by_key(|&l| (std::cmp::Reverse(sizes[l]), l))
        .collect::<Vec<_>>();

    let mut new_label = vec![0u32; n];
    for (rank, &l) in order.iter().enumerate() {
        new_label[l] = rank as u32;
    }
    labels.iter().map(|&l| new_label[l]).collect()
}

/// Cluster cells in the aligned space and store the labels in the metadata.
pub fn find_clusters(
    mut merged: MergedObject,
    params: &ClusterParams,
    detector: &impl CommunityDetector,
) -> Result<MergedObject, Error> {
    let aligned = merged.require_embedding(CCA_ALIGNED, Stage::Aligned, Stage::Clustered)?;
    params.validate()?;
    if params.dims > aligned.dims() {
        return Err(PipelineError::invalid(format!(
            "cannot cluster on {} dimensions of a {}-dimensional embedding",
            params.dims,
            aligned.dims()
        ))
        .into());
    }
    if params.k > merged.n_cells() {
        return Err(PipelineError::invalid(format!(
            "neighborhood size {} exceeds the {} cells",
            params.k,
            merged.n_cells()
        ))
        .into());
    }

    let neighbors = knn::<usize>(&aligned.leading(params.dims), params.k - 1)?;
    let network = build_snn(neighbors.view(), params.prune);
    info!(
        "SNN graph: {} cells, {} edges, total weight {:.2}",
        network.nodes(),
        network.edges(),
        network.total_edge_weight()
    );

    let labels = relabel_by_size(&detector.detect(&network, params.resolution)?);
    let n_clusters = labels.iter().max().map_or(0, |&l| l + 1);
    info!("found {} clusters at resolution {}", n_clusters, params.resolution);

    merged.meta.set_clusters(labels)?;
    merged.stages.mark(Stage::Clustered);
    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::align::test_util::two_libraries;
    use crate::align::{align_subspace, run_cca, Cca, QuantileAligner};

    #[test]
    fn test_relabel_by_size() {
        assert_eq!(relabel_by_size(&[3, 3, 1, 0, 3, 1]), vec![0, 0, 1, 2, 0, 1]);
        // ties keep the original order
        assert_eq!(relabel_by_size(&[5, 2, 5, 2]), vec![1, 0, 1, 0]);
        assert!(relabel_by_size(&[]).is_empty());
    }

    #[test]
    fn test_find_clusters_separates_cell_types() {
        let merged = run_cca(two_libraries(40, 9), &Cca::default(), 6).unwrap();
        let merged = align_subspace(merged, &QuantileAligner, 4).unwrap();
        let params = ClusterParams {
            dims: 4,
            k: 10,
            resolution: 0.5,
            ..ClusterParams::default()
        };
        let merged = find_clusters(merged, &params, &params.louvain()).unwrap();
        let clusters = merged.meta.cluster.as_ref().unwrap();
        assert_eq!(clusters.len(), 80);
        assert!(merged.stages.has_run(Stage::Clustered));

        // labels are ordered by size
        let mut sizes = vec![0; *clusters.iter().max().unwrap() as usize + 1];
        for &c in clusters {
            sizes[c as usize] += 1;
        }
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
        assert!(sizes.len() >= 2);
    }

    #[test]
    fn test_find_clusters_validation() {
        let merged = two_libraries(10, 1);
        let err = find_clusters(merged.clone(), &ClusterParams::default(), &Louvain::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::Ordering {
                required: Stage::Aligned,
                attempted: Stage::Clustered
            })
        );

        let merged = align_subspace(run_cca(merged, &Cca::default(), 3).unwrap(), &QuantileAligner, 3).unwrap();
        let too_many = ClusterParams {
            dims: 3,
            k: 21,
            ..ClusterParams::default()
        };
        assert!(find_clusters(merged.clone(), &too_many, &Louvain::default()).is_err());
        let bad_resolution = ClusterParams {
            dims: 3,
            k: 5,
            resolution: 0.0,
            ..ClusterParams::default()
        };
        assert!(find_clusters(merged, &bad_resolution, &Louvain::default()).is_err());
    }
}
