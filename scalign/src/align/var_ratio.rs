use crate::dim_red::rand_svd::RandSvd;
use crate::dim_red::Pca;
use anyhow::Error;
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::QR;
use scalign_types::embedding::CCA;
use scalign_types::error::Axis as DataAxis;
use scalign_types::{MergedObject, PipelineError, Stage};

/// Metadata column holding the per-cell variance-explained ratio
pub const VAR_RATIO: &str = "var.ratio.pca";

/// Variance over genes of each cell's projection onto the column space of the orthonormal `basis`.
fn projected_variance(block: ArrayView2<f64>, basis: &Array2<f64>) -> Array1<f64> {
    let projected = basis.dot(&basis.t().dot(&block));
    projected.var_axis(Axis(0), 1.0)
}

/// Ratio of the variance the shared space explains to the variance a private PCA of the same
/// rank explains, for each cell of one library. `block` is genes × cells, `cca` cells × dims.
pub fn library_var_ratio(block: ArrayView2<f64>, cca: ArrayView2<f64>, dims: usize, svd: &RandSvd) -> Result<Array1<f64>, Error> {
    let (pca_loadings, _, _) = svd.run_pca(&block, dims)?;
    let pca_var = projected_variance(block, &pca_loadings);

    let (cca_loadings, _) = block.dot(&cca).qr()?;
    let cca_var = projected_variance(block, &cca_loadings);

    Ok(ndarray::Zip::from(&cca_var)
        .and(&pca_var)
        .map_collect(|&c, &p| if p > 0.0 { c / p } else { 0.0 }))
}

/// Compute `var.ratio.pca` for every cell from the leading `dims` correlates.
pub fn calc_var_exp_ratio(mut merged: MergedObject, dims: usize) -> Result<MergedObject, Error> {
    let cca = merged.require_embedding(CCA, Stage::JointEmbedded, Stage::VarRatioComputed)?;
    if dims == 0 || dims > cca.dims() {
        return Err(PipelineError::invalid(format!(
            "cannot use {dims} dimensions of a {}-dimensional embedding",
            cca.dims()
        ))
        .into());
    }
    if merged.scaled.n_genes() < 2 {
        return Err(PipelineError::invalid("variance ratios need at least two scaled genes").into());
    }

    let svd = RandSvd {
        n_iter: 7,
        ..RandSvd::default()
    };
    let n_genes = merged.scaled.n_genes();
    let libraries = merged.library_indices();
    for (lib, idx) in merged.libraries.iter().zip(&libraries) {
        let rank = n_genes.min(idx.len());
        if idx.len() < 2 || dims > rank {
            return Err(PipelineError::invalid(format!(
                "{lib} has {} cells over {n_genes} scaled genes, too few for {dims} dimensions",
                idx.len()
            ))
            .into());
        }
    }

    let mut ratio = vec![0.0; merged.n_cells()];
    for idx in libraries {
        let block = merged.scaled.matrix.select(Axis(1), &idx);
        let coords = cca.leading(dims).select(Axis(0), &idx);
        let r = library_var_ratio(block.view(), coords.view(), dims, &svd)?;
        for (&cell, v) in idx.iter().zip(r) {
            ratio[cell] = v;
        }
    }

    merged.meta.insert_numeric(VAR_RATIO, ratio)?;
    merged.stages.mark(Stage::VarRatioComputed);
    Ok(merged)
}

/// Keep the cells whose variance ratio is at least `threshold`, across every matrix, metadata
/// column and embedding.
pub fn discard_poorly_integrated(merged: MergedObject, threshold: f64) -> Result<MergedObject, Error> {
    merged
        .stages
        .require(Stage::VarRatioComputed, Stage::IntegrationFiltered)?;
    if threshold.is_nan() {
        return Err(PipelineError::invalid("variance-ratio threshold is NaN").into());
    }
    let ratio = merged
        .meta
        .numeric_column(VAR_RATIO)
        .ok_or(PipelineError::Ordering {
            required: Stage::VarRatioComputed,
            attempted: Stage::IntegrationFiltered,
        })?;
    let keep = ratio
        .iter()
        .enumerate()
        .filter(|(_, &r)| r >= threshold)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    let stage = "discarding poorly integrated cells";
    if keep.is_empty() {
        return Err(PipelineError::exhausted(stage, DataAxis::Cells).into());
    }
    let mut filtered = merged.subset_cells(&keep);
    for (lib, idx) in filtered.libraries.iter().zip(filtered.library_indices()) {
        if idx.is_empty() {
            info!("no cells of {lib} pass a variance ratio of {threshold}");
            return Err(PipelineError::exhausted(stage, DataAxis::Cells).into());
        }
    }
    info!(
        "kept {} of {} cells with variance ratio >= {}",
        keep.len(),
        merged.n_cells(),
        threshold
    );
    filtered.stages.mark(Stage::IntegrationFiltered);
    Ok(filtered)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::align::test_util::two_libraries;
    use crate::align::{run_cca, Cca};

    fn with_ratio() -> MergedObject {
        let merged = run_cca(two_libraries(25, 11), &Cca::default(), 6).unwrap();
        calc_var_exp_ratio(merged, 4).unwrap()
    }

    #[test]
    fn test_ratio_column() {
        let merged = with_ratio();
        let ratio = merged.meta.numeric_column(VAR_RATIO).unwrap();
        assert_eq!(ratio.len(), 50);
        assert!(ratio.iter().all(|r| r.is_finite() && *r >= 0.0));
        assert!(calc_var_exp_ratio(merged, 7).is_err());
    }

    #[test]
    fn test_discard_is_monotone() {
        let merged = with_ratio();
        let mut last = 0;
        for threshold in [0.9, 0.7, 0.5, 0.3, 0.0] {
            match discard_poorly_integrated(merged.clone(), threshold) {
                Ok(kept) => {
                    assert!(kept.n_cells() >= last);
                    last = kept.n_cells();
                    assert!(kept.meta.numeric_column(VAR_RATIO).unwrap().iter().all(|&r| r >= threshold));
                    assert_eq!(kept.embedding(CCA).unwrap().cell_ids, kept.cell_ids());
                }
                Err(e) => assert!(matches!(
                    e.downcast_ref::<PipelineError>(),
                    Some(PipelineError::FilterExhaustion { .. })
                )),
            }
        }
        assert_eq!(last, 50);
    }

    #[test]
    fn test_ratio_needs_enough_cells_per_library() {
        let merged = run_cca(two_libraries(25, 11), &Cca::default(), 6).unwrap();
        let [ctrl, stim] = merged.library_indices();
        let keep = ctrl.iter().chain(&stim[..3]).copied().collect::<Vec<_>>();
        let small = merged.subset_cells(&keep);
        let err = calc_var_exp_ratio(small.clone(), 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidParameter(_))
        ));
        assert!(calc_var_exp_ratio(small, 3).is_ok());
    }

    #[test]
    fn test_discard_requires_ratio() {
        let merged = run_cca(two_libraries(10, 2), &Cca::default(), 3).unwrap();
        assert!(discard_poorly_integrated(merged, 0.5).is_err());
    }
}
