//! Per-dataset quality control: gene/cell prefilters and per-metric cell bounds.

use crate::stats::median;
use anyhow::Error;
use log::{debug, info};
use scalign_types::error::Axis;
use scalign_types::metadata::{N_GENE, N_UMI, PERCENT_MITO};
use scalign_types::{CountMatrix, Dataset, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// An interval `(low, high]` on one QC metric. A missing side is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl Bounds {
    pub fn new(low: Option<f64>, high: Option<f64>) -> Bounds {
        Bounds { low, high }
    }

    pub fn unbounded() -> Bounds {
        Bounds::default()
    }

    /// Low bound exclusive, high bound inclusive.
    pub fn contains(&self, v: f64) -> bool {
        self.low.map_or(true, |lo| v > lo) && self.high.map_or(true, |hi| v <= hi)
    }

    fn validate(&self, metric: &str, fraction: bool) -> Result<(), PipelineError> {
        for b in [self.low, self.high].into_iter().flatten() {
            if b.is_nan() {
                return Err(PipelineError::invalid(format!("{metric} bound is NaN")));
            }
            if fraction && !(0.0..=1.0).contains(&b) {
                return Err(PipelineError::invalid(format!("{metric} bound {b} lies outside [0, 1]")));
            }
            if !fraction && b < 0.0 {
                return Err(PipelineError::invalid(format!("{metric} bound {b} is negative")));
            }
        }
        if let (Some(lo), Some(hi)) = (self.low, self.high) {
            if lo > hi {
                return Err(PipelineError::invalid(format!(
                    "{metric} low bound {lo} exceeds high bound {hi}"
                )));
            }
        }
        Ok(())
    }
}

/// QC thresholds for one dataset
#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    /// keep genes detected in at least this many cells
    #[default = 3]
    pub min_cells: usize,
    /// keep cells with at least this many detected genes
    #[default = 200]
    pub min_genes: usize,
    /// case-insensitive gene-name prefix of mitochondrial genes
    #[default = "MT-"]
    pub mito_prefix: String,
    pub n_umi: Bounds,
    #[default(Bounds::new(Some(200.0), Some(5000.0)))]
    pub n_gene: Bounds,
    #[default(Bounds::new(None, Some(0.08)))]
    pub percent_mito: Bounds,
}

impl QcParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.n_umi.validate(N_UMI, false)?;
        self.n_gene.validate(N_GENE, false)?;
        self.percent_mito.validate(PERCENT_MITO, true)?;
        if self.mito_prefix.is_empty() {
            return Err(PipelineError::invalid("mitochondrial gene prefix is empty"));
        }
        Ok(())
    }
}

/// Per-cell QC metrics
#[derive(Clone, Debug, PartialEq)]
pub struct QcMetrics {
    pub n_umi: Vec<f64>,
    pub n_gene: Vec<f64>,
    pub percent_mito: Vec<f64>,
}

fn is_mito(gene: &str, prefix: &str) -> bool {
    gene.len() >= prefix.len()
        && gene
            .chars()
            .zip(prefix.chars())
            .all(|(g, p)| g.eq_ignore_ascii_case(&p))
}

/// Total count, detected genes and mitochondrial fraction of every cell.
pub fn qc_metrics(counts: &CountMatrix, mito_prefix: &str) -> QcMetrics {
    let n_umi = counts.col_sums();
    let n_gene = counts.col_nnz().into_iter().map(|n| n as f64).collect();

    let mut mito = vec![0.0; counts.n_cells()];
    for (g, row) in counts.matrix.outer_iterator().enumerate() {
        if is_mito(&counts.genes[g], mito_prefix) {
            for (c, &v) in row.iter() {
                mito[c] += v as f64;
            }
        }
    }
    let percent_mito = mito
        .iter()
        .zip(&n_umi)
        .map(|(&m, &t)| if t > 0.0 { m / t } else { 0.0 })
        .collect();

    QcMetrics {
        n_umi,
        n_gene,
        percent_mito,
    }
}

fn genes_detected_in(counts: &CountMatrix, min_cells: usize) -> Vec<usize> {
    counts
        .row_nnz()
        .into_iter()
        .enumerate()
        .filter(|&(_, n)| n >= min_cells)
        .map(|(g, _)| g)
        .collect()
}

fn ensure_nonempty(n: usize, stage: &str, axis: Axis) -> Result<(), PipelineError> {
    if n == 0 {
        Err(PipelineError::exhausted(stage, axis))
    } else {
        Ok(())
    }
}

/// Run QC on `dataset`:
/// 1. drop genes detected in fewer than `min_cells` cells and cells with fewer than `min_genes`
///    detected genes, both judged on the input matrix;
/// 2. compute `nUMI`, `nGene` and `percent.mito` and keep the cells inside every bound;
/// 3. drop genes no longer detected in `min_cells` surviving cells.
///
/// Steps 2 and 3 repeat until nothing changes, so the stored metrics describe the returned
/// matrix and every survivor satisfies every bound.
pub fn filter(mut dataset: Dataset, params: &QcParams) -> Result<Dataset, Error> {
    dataset.stages.forbid(Stage::Normalized, Stage::QcFiltered)?;
    params.validate()?;

    let label = dataset.label.clone();
    info!(
        "{label}: QC on {} genes x {} cells",
        dataset.n_genes(),
        dataset.n_cells()
    );

    let genes = genes_detected_in(&dataset.counts, params.min_cells);
    let cells = dataset
        .counts
        .col_nnz()
        .into_iter()
        .enumerate()
        .filter(|&(_, n)| n >= params.min_genes)
        .map(|(c, _)| c)
        .collect::<Vec<_>>();
    ensure_nonempty(genes.len(), "gene prefilter", Axis::Genes)?;
    ensure_nonempty(cells.len(), "cell prefilter", Axis::Cells)?;

    let mut counts = dataset.counts.select(&genes, &cells);
    let mut meta = dataset.meta.subset(&cells);
    info!(
        "{label}: prefilter kept {} genes x {} cells",
        counts.n_genes(),
        counts.n_cells()
    );

    let mut round = 0;
    let metrics = loop {
        round += 1;
        let metrics = qc_metrics(&counts, &params.mito_prefix);
        let keep = (0..counts.n_cells())
            .filter(|&c| {
                params.n_umi.contains(metrics.n_umi[c])
                    && params.n_gene.contains(metrics.n_gene[c])
                    && params.percent_mito.contains(metrics.percent_mito[c])
            })
            .collect::<Vec<_>>();
        ensure_nonempty(keep.len(), "QC cell bounds", Axis::Cells)?;

        let cells_after = counts.select_cells(&keep);
        let genes = genes_detected_in(&cells_after, params.min_cells);
        ensure_nonempty(genes.len(), "QC gene filter", Axis::Genes)?;

        debug!(
            "{label}: QC round {round} kept {} of {} cells and {} of {} genes",
            keep.len(),
            counts.n_cells(),
            genes.len(),
            counts.n_genes()
        );

        let stable = keep.len() == counts.n_cells() && genes.len() == counts.n_genes();
        if stable {
            break metrics;
        }
        meta = meta.subset(&keep);
        counts = cells_after.select_genes(&genes);
    };

    meta.n_umi = metrics.n_umi;
    meta.n_gene = metrics.n_gene;
    meta.percent_mito = metrics.percent_mito;

    info!(
        "{label}: QC kept {} genes x {} cells (median nUMI {:.1}, median nGene {:.1})",
        counts.n_genes(),
        counts.n_cells(),
        median(&meta.n_umi).unwrap_or(0.0),
        median(&meta.n_gene).unwrap_or(0.0)
    );

    dataset.counts = counts;
    dataset.meta = meta;
    dataset.stages.mark(Stage::QcFiltered);
    dataset.check()?;
    Ok(dataset)
}

#[cfg(test)]
mod test {
    use super::*;
    use scalign_types::matrix::csr_from_rows;

    fn dataset(genes: &[&str], rows: Vec<Vec<(usize, u32)>>, n_cells: usize) -> Dataset {
        let counts = CountMatrix::new(
            genes.iter().map(|g| g.to_string()).collect(),
            (0..n_cells).map(|c| format!("cell{c}")).collect(),
            csr_from_rows(rows, n_cells),
        )
        .unwrap();
        Dataset::new("d", counts)
    }

    fn lenient() -> QcParams {
        QcParams {
            min_cells: 1,
            min_genes: 1,
            n_gene: Bounds::unbounded(),
            percent_mito: Bounds::unbounded(),
            ..QcParams::default()
        }
    }

    #[test]
    fn test_bounds_convention() {
        let b = Bounds::new(Some(1.0), Some(2.0));
        assert!(!b.contains(1.0));
        assert!(b.contains(1.5));
        assert!(b.contains(2.0));
        assert!(!b.contains(2.5));
        assert!(Bounds::unbounded().contains(f64::MAX));
    }

    #[test]
    fn test_metrics() {
        let d = dataset(&["mt-co1", "A", "B"], vec![vec![(0, 2)], vec![(0, 6), (1, 1)], vec![]], 3);
        let m = qc_metrics(&d.counts, "MT-");
        assert_eq!(m.n_umi, vec![8.0, 1.0, 0.0]);
        assert_eq!(m.n_gene, vec![2.0, 1.0, 0.0]);
        assert_eq!(m.percent_mito, vec![0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_filter_drops_out_of_bounds_cells() {
        // cell 2 has 10 UMIs, the others 3
        let d = dataset(
            &["A", "B", "C"],
            vec![vec![(0, 1), (1, 1), (2, 5)], vec![(0, 1), (1, 1), (2, 5)], vec![(0, 1), (1, 1)]],
            3,
        );
        let params = QcParams {
            n_umi: Bounds::new(None, Some(5.0)),
            ..lenient()
        };
        let d = filter(d, &params).unwrap();
        assert_eq!(d.counts.cells, vec!["cell0", "cell1"]);
        assert_eq!(d.meta.n_umi, vec![3.0, 3.0]);
        assert!(d.stages.has_run(Stage::QcFiltered));
    }

    #[test]
    fn test_gene_refilter_after_cell_removal() {
        // gene B is only seen in cell 1, which the nUMI bound removes
        let d = dataset(&["A", "B"], vec![vec![(0, 2), (1, 2)], vec![(1, 9)]], 2);
        let params = QcParams {
            n_umi: Bounds::new(None, Some(5.0)),
            ..lenient()
        };
        let d = filter(d, &params).unwrap();
        assert_eq!(d.counts.genes, vec!["A"]);
        assert_eq!(d.counts.cells, vec!["cell0"]);
    }

    #[test]
    fn test_exhaustion_and_validation() {
        let d = dataset(&["A"], vec![vec![(0, 1)]], 1);
        let params = QcParams {
            n_umi: Bounds::new(Some(10.0), None),
            ..lenient()
        };
        let err = filter(d.clone(), &params).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::FilterExhaustion { axis: Axis::Cells, .. })
        ));

        let bad = QcParams {
            n_gene: Bounds::new(Some(10.0), Some(5.0)),
            ..lenient()
        };
        let err = filter(d.clone(), &bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidParameter(_))
        ));

        let bad = QcParams {
            percent_mito: Bounds::new(None, Some(5.0)),
            ..lenient()
        };
        assert!(filter(d, &bad).is_err());
    }

    #[test]
    fn test_qc_after_normalization_is_ordering_error() {
        let mut d = dataset(&["A"], vec![vec![(0, 1)]], 1);
        d.stages.mark(Stage::Normalized);
        let err = filter(d, &lenient()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Ordering { .. })
        ));
    }
}
