//! Module scores and cell-cycle phase assignment.

use anyhow::Error;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use scalign_types::{Dataset, NormalizedMatrix, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::collections::BTreeSet;

/// Metadata column holding the S-phase module score
pub const S_SCORE: &str = "S.Score";
/// Metadata column holding the G2/M module score
pub const G2M_SCORE: &str = "G2M.Score";

/// Settings for module scoring
#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleScoreParams {
    /// number of expression bins control genes are drawn from
    #[default = 24]
    pub n_bins: usize,
    /// control genes drawn per scored gene
    #[default = 100]
    pub n_ctrl: usize,
    #[default = 1]
    pub seed: u64,
}

/// Gene sets for cell-cycle scoring. Scoring is skipped when both lists are empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellCycleParams {
    pub s_genes: Vec<String>,
    pub g2m_genes: Vec<String>,
    pub scoring: ModuleScoreParams,
}

impl CellCycleParams {
    pub fn enabled(&self) -> bool {
        !(self.s_genes.is_empty() && self.g2m_genes.is_empty())
    }
}

/// Per-cell mean over `rows` of the normalized matrix.
fn mean_over_genes(normalized: &NormalizedMatrix, rows: &BTreeSet<usize>) -> Vec<f64> {
    let mut acc = vec![0.0; normalized.n_cells()];
    for &g in rows {
        if let Some(row) = normalized.matrix.outer_view(g) {
            for (c, &v) in row.iter() {
                acc[c] += v;
            }
        }
    }
    let n = rows.len().max(1) as f64;
    acc.iter_mut().for_each(|v| *v /= n);
    acc
}

/// Score each cell by the mean expression of `genes` minus the mean expression of control
/// genes drawn from the same expression bins. Genes absent from the matrix are skipped.
pub fn module_score(
    normalized: &NormalizedMatrix,
    genes: &[String],
    params: &ModuleScoreParams,
    rng: &mut Pcg64Mcg,
) -> Result<Vec<f64>, Error> {
    if params.n_bins == 0 {
        return Err(PipelineError::invalid("module scoring needs at least one bin").into());
    }
    let index = normalized.gene_index();
    let targets = genes
        .iter()
        .filter_map(|g| index.get(g.as_str()).copied())
        .collect::<BTreeSet<_>>();
    if targets.is_empty() {
        return Err(PipelineError::invalid("none of the module genes are in the matrix").into());
    }
    if targets.len() < genes.len() {
        warn!("{} of {} module genes are not in the matrix", genes.len() - targets.len(), genes.len());
    }

    // equal-frequency bins by average expression
    let n_genes = normalized.n_genes();
    let n_cells = normalized.n_cells().max(1) as f64;
    let mut by_mean = normalized
        .matrix
        .outer_iterator()
        .enumerate()
        .map(|(g, row)| (row.iter().map(|(_, &v)| v).sum::<f64>() / n_cells, g))
        .collect::<Vec<_>>();
    by_mean.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let n_bins = params.n_bins.min(n_genes);
    let mut bin_of = vec![0; n_genes];
    let mut bins = vec![Vec::new(); n_bins];
    for (rank, &(_, g)) in by_mean.iter().enumerate() {
        let b = rank * n_bins / n_genes;
        bin_of[g] = b;
        bins[b].push(g);
    }

    let mut controls = BTreeSet::new();
    for &g in &targets {
        let pool = &bins[bin_of[g]];
        controls.extend(pool.choose_multiple(rng, params.n_ctrl.min(pool.len())).copied());
    }

    let target_mean = mean_over_genes(normalized, &targets);
    let control_mean = mean_over_genes(normalized, &controls);
    Ok(target_mean.iter().zip(&control_mean).map(|(t, c)| t - c).collect())
}

/// Phase call from S and G2/M scores
pub fn assign_phase(s: f64, g2m: f64) -> &'static str {
    if s < 0.0 && g2m < 0.0 {
        "G1"
    } else if s > g2m {
        "S"
    } else {
        "G2M"
    }
}

/// Score S and G2/M gene sets and record `S.Score`, `G2M.Score` and `phase` on the dataset.
pub fn cell_cycle_scoring(
    mut dataset: Dataset,
    s_genes: &[String],
    g2m_genes: &[String],
    params: &ModuleScoreParams,
) -> Result<Dataset, Error> {
    let normalized = dataset.require_normalized(Stage::CellCycleScored)?;
    let mut rng = Pcg64Mcg::seed_from_u64(params.seed);
    let s = module_score(normalized, s_genes, params, &mut rng)?;
    let g2m = module_score(normalized, g2m_genes, params, &mut rng)?;

    let phase = s
        .iter()
        .zip(&g2m)
        .map(|(&a, &b)| assign_phase(a, b).to_string())
        .collect::<Vec<_>>();
    let n_g1 = phase.iter().filter(|p| p.as_str() == "G1").count();
    info!(
        "{}: cell-cycle scoring called {} of {} cells G1",
        dataset.label,
        n_g1,
        phase.len()
    );

    dataset.meta.insert_numeric(S_SCORE, s)?;
    dataset.meta.insert_numeric(G2M_SCORE, g2m)?;
    dataset.meta.set_phase(phase)?;
    dataset.stages.mark(Stage::CellCycleScored);
    Ok(dataset)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::normalization::log_normalize;
    use scalign_types::matrix::csr_from_rows;
    use scalign_types::CountMatrix;

    /// cells 0-4 express the S genes strongly, cells 5-9 the G2M genes
    fn dataset() -> Dataset {
        let n_cells = 10;
        let mut rows = Vec::new();
        let mut genes = Vec::new();
        for g in 0..4 {
            genes.push(format!("S{g}"));
            rows.push((0..5).map(|c| (c, 20)).collect());
        }
        for g in 0..4 {
            genes.push(format!("G{g}"));
            rows.push((5..10).map(|c| (c, 20)).collect());
        }
        for g in 0..40 {
            genes.push(format!("bg{g}"));
            rows.push((0..n_cells).map(|c| (c, 1 + ((g + c) % 3) as u32)).collect());
        }
        let counts = CountMatrix::new(genes, (0..n_cells).map(|c| format!("c{c}")).collect(), csr_from_rows(rows, n_cells))
            .unwrap();
        log_normalize(Dataset::new("d", counts), 1e4).unwrap()
    }

    fn names(prefix: &str) -> Vec<String> {
        (0..4).map(|g| format!("{prefix}{g}")).collect()
    }

    #[test]
    fn test_assign_phase() {
        assert_eq!(assign_phase(-0.1, -0.2), "G1");
        assert_eq!(assign_phase(0.3, 0.1), "S");
        assert_eq!(assign_phase(-0.3, 0.1), "G2M");
    }

    #[test]
    fn test_cell_cycle_scoring() {
        let params = ModuleScoreParams {
            n_bins: 4,
            n_ctrl: 5,
            ..ModuleScoreParams::default()
        };
        let d = cell_cycle_scoring(dataset(), &names("S"), &names("G"), &params).unwrap();
        let phase = d.meta.phase.as_ref().unwrap();
        assert!(phase[..5].iter().all(|p| p == "S"), "{phase:?}");
        assert!(phase[5..].iter().all(|p| p == "G2M"), "{phase:?}");
        assert_eq!(d.meta.numeric_column(S_SCORE).unwrap().len(), 10);
        assert!(d.stages.has_run(Stage::CellCycleScored));
    }

    #[test]
    fn test_missing_genes() {
        let params = ModuleScoreParams::default();
        let err = cell_cycle_scoring(dataset(), &["nope".to_string()], &names("G"), &params).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidParameter(_))
        ));
    }
}
