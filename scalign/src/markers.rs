//! Marker genes of clusters: prefiltered two-group comparisons tested by a pluggable
//! `DifferentialTester` and corrected for multiple testing.

use anyhow::{Context, Error};
use diff_exp::{adjusted_pvalue_bh, adjusted_pvalue_bonferroni, Comparison, DifferentialTester, Side};
use log::{info, warn};
use rayon::prelude::*;
use scalign_types::{MarkerRow, MarkerSort, MarkerTable, MergedObject, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::path::Path;

/// Label used for the second group when a cluster is compared against all other cells
pub const REST: &str = "rest";

/// Multiple-testing correction applied to marker p-values
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Correction {
    /// `min(1, p * n_genes)` over every gene in the object
    #[default]
    Bonferroni,
    BenjaminiHochberg,
}

/// Test used by the pipeline to score marker genes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerTest {
    /// rank-sum test on normalized values
    #[default]
    Wilcoxon,
    /// negative-binomial exact test on raw counts
    SSeq,
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerParams {
    /// a gene is tested only if it is detected in at least this fraction of one group
    #[default = 0.1]
    pub min_pct: f64,
    /// minimum |avg_logFC| for a gene to be tested
    #[default = 0.25]
    pub logfc_threshold: f64,
    /// report only genes higher in the first group
    #[default = false]
    pub only_pos: bool,
    pub correction: Correction,
    pub sort: MarkerSort,
    pub test: MarkerTest,
}

impl MarkerParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.min_pct) {
            return Err(PipelineError::invalid(format!("min_pct {} is outside [0, 1]", self.min_pct)));
        }
        if !(self.logfc_threshold >= 0.0 && self.logfc_threshold.is_finite()) {
            return Err(PipelineError::invalid(format!(
                "logfc_threshold {} must be a non-negative number",
                self.logfc_threshold
            )));
        }
        Ok(())
    }
}

struct GeneSummary {
    gene: usize,
    avg_log_fc: f64,
    pct_1: f64,
    pct_2: f64,
}

fn summarize(cmp: &Comparison<'_>, gene: usize) -> GeneSummary {
    let (n_a, n_b) = (cmp.group_a.len() as f64, cmp.group_b.len() as f64);
    let (mut detected_a, mut detected_b) = (0.0, 0.0);
    for (side, v) in cmp.count_entries(gene) {
        match side {
            Side::A if v > 0 => detected_a += 1.0,
            Side::B if v > 0 => detected_b += 1.0,
            _ => (),
        }
    }
    // zeros contribute expm1(0) = 0 to the sums
    let (mut sum_a, mut sum_b) = (0.0, 0.0);
    for (side, v) in cmp.normalized_entries(gene) {
        match side {
            Side::A => sum_a += v.exp_m1(),
            Side::B => sum_b += v.exp_m1(),
            Side::Neither => (),
        }
    }
    GeneSummary {
        gene,
        avg_log_fc: (sum_a / n_a).ln_1p() - (sum_b / n_b).ln_1p(),
        pct_1: detected_a / n_a,
        pct_2: detected_b / n_b,
    }
}

/// Cell indices of cluster `ident_1` and of `ident_2` (all other cells when `None`).
fn cluster_groups(
    merged: &MergedObject,
    ident_1: u32,
    ident_2: Option<u32>,
) -> Result<(Vec<usize>, Vec<usize>), PipelineError> {
    let clusters = merged.meta.cluster.as_ref().ok_or(PipelineError::Ordering {
        required: Stage::Clustered,
        attempted: Stage::Markers,
    })?;
    if ident_2 == Some(ident_1) {
        return Err(PipelineError::invalid(format!("cannot compare cluster {ident_1} with itself")));
    }
    let mut a = Vec::new();
    let mut b = Vec::new();
    for (cell, &c) in clusters.iter().enumerate() {
        if c == ident_1 {
            a.push(cell);
        } else if ident_2.map_or(true, |i| i == c) {
            b.push(cell);
        }
    }
    if a.is_empty() {
        return Err(PipelineError::invalid(format!("cluster {ident_1} has no cells")));
    }
    if b.is_empty() {
        let other = ident_2.map_or(REST.to_string(), |i| format!("cluster {i}"));
        return Err(PipelineError::invalid(format!("{other} has no cells")));
    }
    Ok((a, b))
}

/// Differential expression of cluster `ident_1` against `ident_2`, or against every other cell
/// when `ident_2` is `None`. The object is left untouched.
pub fn compute_markers(
    merged: &MergedObject,
    ident_1: u32,
    ident_2: Option<u32>,
    params: &MarkerParams,
    tester: &impl DifferentialTester,
) -> Result<MarkerTable, Error> {
    params.validate()?;
    let (group_a, group_b) = cluster_groups(merged, ident_1, ident_2)?;
    let cmp = Comparison::new(
        &merged.counts.matrix,
        &merged.normalized.matrix,
        &group_a,
        &group_b,
    )?;

    let n_genes = merged.counts.n_genes();
    let candidates = (0..n_genes)
        .into_par_iter()
        .map(|g| summarize(&cmp, g))
        .filter(|s| s.pct_1.max(s.pct_2) >= params.min_pct)
        .filter(|s| s.avg_log_fc.abs() >= params.logfc_threshold)
        .filter(|s| !params.only_pos || s.avg_log_fc > 0.0)
        .collect::<Vec<_>>();

    let genes = candidates.iter().map(|s| s.gene).collect::<Vec<_>>();
    let p_values = tester.p_values(&cmp, &genes)?;
    let adjusted = match params.correction {
        Correction::Bonferroni => adjusted_pvalue_bonferroni(&p_values, n_genes),
        Correction::BenjaminiHochberg => {
            let indexed = p_values.iter().copied().enumerate().collect::<Vec<_>>();
            let mut adjusted = vec![1.0; p_values.len()];
            for (i, q) in adjusted_pvalue_bh(&indexed) {
                adjusted[i] = q;
            }
            adjusted
        }
    };

    let rows = candidates
        .into_iter()
        .zip(p_values)
        .zip(adjusted)
        .map(|((s, p_val), p_val_adj)| MarkerRow {
            gene: merged.counts.genes[s.gene].clone(),
            avg_log_fc: s.avg_log_fc,
            p_val,
            p_val_adj,
            pct_1: s.pct_1,
            pct_2: s.pct_2,
        })
        .collect::<Vec<_>>();

    let ident_2 = ident_2.map_or(REST.to_string(), |i| i.to_string());
    info!(
        "cluster {} vs {}: tested {} of {} genes with {}",
        ident_1,
        ident_2,
        rows.len(),
        n_genes,
        tester.name()
    );
    Ok(MarkerTable::new(
        &ident_1.to_string(),
        &ident_2,
        tester.name(),
        rows,
        params.sort,
    ))
}

/// Compute markers of `ident_1` and append the table to the object.
pub fn find_markers(
    mut merged: MergedObject,
    ident_1: u32,
    ident_2: Option<u32>,
    params: &MarkerParams,
    tester: &impl DifferentialTester,
) -> Result<MergedObject, Error> {
    let table = compute_markers(&merged, ident_1, ident_2, params, tester)?;
    merged.add_markers(table);
    merged.stages.mark(Stage::Markers);
    Ok(merged)
}

/// Markers of every cluster against the rest of the cells, one table per cluster in label order.
pub fn find_all_markers(
    mut merged: MergedObject,
    params: &MarkerParams,
    tester: &impl DifferentialTester,
) -> Result<MergedObject, Error> {
    let clusters = merged.meta.cluster.as_ref().ok_or(PipelineError::Ordering {
        required: Stage::Clustered,
        attempted: Stage::Markers,
    })?;
    let n_clusters = clusters.iter().max().map_or(0, |&c| c as usize + 1);
    let mut sizes = vec![0usize; n_clusters];
    for &c in clusters {
        sizes[c as usize] += 1;
    }
    let n_cells = clusters.len();

    // clusters with no cells, or with no other cells to compare against, are skipped
    for (ident, &size) in sizes.iter().enumerate() {
        if size == 0 || size == n_cells {
            warn!("skipping markers of cluster {ident}: {size} of {n_cells} cells, nothing to compare");
            continue;
        }
        let table = compute_markers(&merged, ident as u32, None, params, tester)?;
        merged.add_markers(table);
    }
    merged.stages.mark(Stage::Markers);
    Ok(merged)
}

/// Write `gene<TAB>avg_logFC` lines, in table order, without a header.
pub fn write_marker_file(table: &MarkerTable, path: &Path) -> Result<(), Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Never)
        .from_path(path)
        .with_context(|| format!("creating marker file {}", path.display()))?;
    for row in table.rows() {
        let fc = row.avg_log_fc.to_string();
        writer.write_record([row.gene.as_str(), fc.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}
