use crate::stats::mean_sd;
use anyhow::Error;
use log::{info, warn};
use ndarray::prelude::*;
use ndarray::Zip;
use ndarray_linalg::QR;
use rayon::prelude::*;
use scalign_types::{CountMatrix, Dataset, NormalizedMatrix, PipelineError, ScaledMatrix, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Default per-cell total after normalization
pub const DEFAULT_SCALE_FACTOR: f64 = 10_000.0;

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeParams {
    #[default(DEFAULT_SCALE_FACTOR)]
    pub scale_factor: f64,
}

/// Log-normalize counts: each cell is scaled to `scale_factor` total counts and the
/// transformation `x -> ln(1 + x)` applied. Sparsity is preserved and empty cells stay empty.
pub fn log_normalize_matrix(counts: &CountMatrix, scale_factor: f64) -> NormalizedMatrix {
    let totals = counts.col_sums();
    let scales = totals
        .iter()
        .map(|&t| if t > 0.0 { scale_factor / t } else { 0.0 })
        .collect::<Vec<_>>();

    let mut matrix = counts.matrix.map(|&v| v as f64);
    for mut row in matrix.outer_iterator_mut() {
        for (c, v) in row.iter_mut() {
            *v = (*v * scales[c]).ln_1p();
        }
    }

    NormalizedMatrix {
        genes: counts.genes.clone(),
        cells: counts.cells.clone(),
        matrix,
    }
}

/// Log-normalize `dataset` and mark it `Normalized`.
pub fn log_normalize(mut dataset: Dataset, scale_factor: f64) -> Result<Dataset, Error> {
    if !(scale_factor.is_finite() && scale_factor > 0.0) {
        return Err(PipelineError::invalid(format!("scale factor {scale_factor} must be positive")).into());
    }
    dataset.normalized = Some(log_normalize_matrix(&dataset.counts, scale_factor));
    dataset.stages.mark(Stage::Normalized);
    info!(
        "{}: log-normalized {} cells to {} counts per cell",
        dataset.label,
        dataset.n_cells(),
        scale_factor
    );
    Ok(dataset)
}

/// Settings for `scale_data`
#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    /// genes to scale; all genes when `None`
    pub genes: Option<Vec<String>>,
    /// numeric metadata columns regressed out before scaling
    pub vars_to_regress: Vec<String>,
    /// z-scores are clipped to `[-scale_max, scale_max]`
    #[default = 10.0]
    pub scale_max: f64,
}

/// Replace each row of `values` (genes × cells) by its residuals from an ordinary least
/// squares fit on an intercept plus the columns of `covariates` (cells × p).
pub fn regress_out(values: ArrayView2<f64>, covariates: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
    let n = values.ncols();
    if covariates.nrows() != n {
        return Err(PipelineError::invalid(format!(
            "{} covariate rows for {} cells",
            covariates.nrows(),
            n
        ))
        .into());
    }
    let p = covariates.ncols() + 1;
    if n <= p {
        return Err(PipelineError::invalid(format!("cannot regress {p} terms on {n} cells")).into());
    }

    let mut design = Array2::<f64>::ones((n, p));
    design.slice_mut(s![.., 1..]).assign(&covariates);

    let (q, r) = design.qr()?;
    let diag = r.diag().mapv(f64::abs);
    let largest = diag.fold(0.0f64, |a, &b| a.max(b));
    if diag.iter().any(|&d| d <= largest * 1e-10) {
        return Err(PipelineError::invalid("regression covariates are collinear").into());
    }

    let mut residuals = Array2::<f64>::zeros(values.raw_dim());
    Zip::from(residuals.rows_mut())
        .and(values.rows())
        .par_for_each(|mut out, y| {
            let coef = q.t().dot(&y);
            out.assign(&(&y - &q.dot(&coef)));
        });
    Ok(residuals)
}

/// Z-score each row (sample standard deviation) and clip to `[-scale_max, scale_max]`.
/// Rows with zero variance become all zero.
pub fn scale_rows(values: &mut Array2<f64>, scale_max: f64) {
    values.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        let (mean, sd) = mean_sd(row.view());
        if sd > 0.0 {
            row.mapv_inplace(|v| ((v - mean) / sd).clamp(-scale_max, scale_max));
        } else {
            row.fill(0.0);
        }
    });
}

/// Scale the normalized values of `dataset`, optionally regressing out covariates first.
/// Always starts from the normalized matrix, so it can be re-run (e.g. once cell-cycle scores
/// exist) without compounding earlier scaling.
pub fn scale_data(mut dataset: Dataset, params: &ScaleParams) -> Result<Dataset, Error> {
    let normalized = dataset.require_normalized(Stage::Scaled)?;
    if !(params.scale_max > 0.0) {
        return Err(PipelineError::invalid(format!("scale_max {} must be positive", params.scale_max)).into());
    }

    let gene_index = normalized.gene_index();
    let rows = match &params.genes {
        None => (0..normalized.n_genes()).collect::<Vec<_>>(),
        Some(names) => {
            let found = names
                .iter()
                .filter_map(|n| gene_index.get(n.as_str()).copied())
                .collect::<Vec<_>>();
            if found.len() < names.len() {
                warn!(
                    "{}: {} of {} genes to scale are not in the matrix",
                    dataset.label,
                    names.len() - found.len(),
                    names.len()
                );
            }
            found
        }
    };
    if rows.is_empty() {
        return Err(PipelineError::invalid("no genes to scale").into());
    }

    let mut covariates = Array2::<f64>::zeros((dataset.n_cells(), params.vars_to_regress.len()));
    for (j, name) in params.vars_to_regress.iter().enumerate() {
        let col = dataset
            .meta
            .numeric_column(name)
            .ok_or_else(|| PipelineError::invalid(format!("unknown covariate {name}")))?;
        covariates.column_mut(j).assign(&ArrayView1::from(col));
    }

    let mut values = Array2::<f64>::zeros((rows.len(), dataset.n_cells()));
    values
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(rows.par_iter())
        .for_each(|(mut out, &g)| {
            if let Some(row) = normalized.matrix.outer_view(g) {
                for (c, &v) in row.iter() {
                    out[c] = v;
                }
            }
        });

    if !params.vars_to_regress.is_empty() {
        info!(
            "{}: regressing out {} from {} genes",
            dataset.label,
            params.vars_to_regress.join(", "),
            rows.len()
        );
        values = regress_out(values.view(), covariates.view())?;
    }
    scale_rows(&mut values, params.scale_max);

    let genes = rows.iter().map(|&g| normalized.genes[g].clone()).collect();
    let scaled = ScaledMatrix::new_dense(genes, normalized.cells.clone(), values)?;
    info!(
        "{}: scaled {} genes x {} cells",
        dataset.label,
        scaled.n_genes(),
        scaled.n_cells()
    );
    dataset.scaled = Some(scaled);
    dataset.stages.mark(Stage::Scaled);
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use scalign_types::matrix::csr_from_rows;

    fn dataset() -> Dataset {
        // 3 genes x 4 cells
        let rows = vec![
            vec![(0, 1), (1, 2), (2, 3), (3, 4)],
            vec![(0, 3), (2, 1)],
            vec![(1, 5), (3, 2)],
        ];
        let counts = CountMatrix::new(
            vec!["A".into(), "B".into(), "C".into()],
            (0..4).map(|c| format!("c{c}")).collect(),
            csr_from_rows(rows, 4),
        )
        .unwrap();
        Dataset::new("d", counts)
    }

    #[test]
    fn test_log_normalize_values() {
        let d = log_normalize(dataset(), 10_000.0).unwrap();
        let n = d.normalized.as_ref().unwrap();
        // cell 0: total 4, gene A count 1
        assert_approx_eq!(n.row_dense(0)[0], (1.0f64 / 4.0 * 1e4).ln_1p(), 1e-12);
        assert_eq!(n.nnz(), d.counts.nnz());
        assert!(d.stages.has_run(Stage::Normalized));
    }

    #[test]
    fn test_scale_invariance() {
        let d = dataset();
        let tripled = CountMatrix {
            matrix: d.counts.matrix.map(|&v| v * 3),
            ..d.counts.clone()
        };
        let a = log_normalize_matrix(&d.counts, 1e4);
        let b = log_normalize_matrix(&tripled, 1e4);
        for g in 0..3 {
            for (x, y) in a.row_dense(g).iter().zip(b.row_dense(g)) {
                assert_approx_eq!(x, y, 1e-12);
            }
        }
    }

    #[test]
    fn test_scale_requires_normalization() {
        let err = scale_data(dataset(), &ScaleParams::default()).unwrap_err();
        assert_eq!(err.to_string(), "scaling requires normalization to have run first");
    }

    #[test]
    fn test_scaled_rows_are_zscores() {
        let d = log_normalize(dataset(), 1e4).unwrap();
        let d = scale_data(d, &ScaleParams::default()).unwrap();
        let s = d.scaled.as_ref().unwrap();
        assert_eq!(s.matrix.dim(), (3, 4));
        for row in s.matrix.rows() {
            let (m, sd) = mean_sd(row);
            assert_approx_eq!(m, 0.0, 1e-12);
            assert_approx_eq!(sd, 1.0, 1e-12);
        }

        let clipped = scale_data(d, &ScaleParams { scale_max: 0.5, ..ScaleParams::default() }).unwrap();
        assert!(clipped.scaled.unwrap().matrix.iter().all(|v| v.abs() <= 0.5));
    }

    #[test]
    fn test_regress_out_removes_linear_trend() {
        let cov = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = array![[3.0, 5.0, 7.0, 9.0, 11.0], [1.0, 0.0, 1.0, 0.0, 1.0]];
        let res = regress_out(y.view(), cov.view()).unwrap();
        for v in res.row(0) {
            assert_approx_eq!(*v, 0.0, 1e-10);
        }
        assert_approx_eq!(res.row(1).sum(), 0.0, 1e-10);

        let collinear = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0], [5.0, 10.0]];
        assert!(regress_out(y.view(), collinear.view()).is_err());
    }

    #[test]
    fn test_unknown_covariate() {
        let d = log_normalize(dataset(), 1e4).unwrap();
        let params = ScaleParams {
            vars_to_regress: vec!["nope".into()],
            ..ScaleParams::default()
        };
        let err = scale_data(d, &params).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidParameter(_))
        ));
    }
}
