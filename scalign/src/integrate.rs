//! Combine two processed datasets into one merged object.

use crate::variable_features::union_variable_genes;
use anyhow::Error;
use log::{info, warn};
use scalign_types::error::Axis;
use scalign_types::{Dataset, MergedObject, PipelineError, ScaledMatrix, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeParams {
    /// prefixes applied as `<prefix>_<cell id>` to the first and second dataset
    pub add_cell_ids: Option<[String; 2]>,
    /// genes for the joint embedding; the shared union of variable genes when `None`
    pub genes: Option<Vec<String>>,
}

fn prefix_ids(dataset: &mut Dataset, prefix: &str) {
    let rename = |ids: &mut Vec<String>| {
        for id in ids.iter_mut() {
            *id = format!("{prefix}_{id}");
        }
    };
    rename(&mut dataset.counts.cells);
    rename(&mut dataset.meta.cell_ids);
    if let Some(n) = dataset.normalized.as_mut() {
        rename(&mut n.cells);
    }
    if let Some(s) = dataset.scaled.as_mut() {
        rename(&mut s.cells);
    }
}

fn scaled_genes(a: &Dataset, b: &Dataset, requested: Option<&Vec<String>>) -> Result<Vec<String>, Error> {
    let (sa, sb) = match (&a.scaled, &b.scaled) {
        (Some(sa), Some(sb)) => (sa, sb),
        _ => {
            return Err(PipelineError::Ordering {
                required: Stage::Scaled,
                attempted: Stage::Merged,
            }
            .into())
        }
    };
    let in_a = sa.genes.iter().map(String::as_str).collect::<HashSet<_>>();
    let in_b = sb.genes.iter().map(String::as_str).collect::<HashSet<_>>();
    let shared = |g: &String| in_a.contains(g.as_str()) && in_b.contains(g.as_str());

    if let Some(genes) = requested {
        if let Some(missing) = genes.iter().find(|g| !shared(g)) {
            warn!("gene {missing} was not scaled in both datasets");
            return Err(PipelineError::Ordering {
                required: Stage::Scaled,
                attempted: Stage::Merged,
            }
            .into());
        }
        return Ok(genes.clone());
    }

    let (va, vb) = match (&a.variable_genes, &b.variable_genes) {
        (Some(va), Some(vb)) => (va, vb),
        _ => {
            return Err(PipelineError::Ordering {
                required: Stage::VariableFeatures,
                attempted: Stage::Merged,
            }
            .into())
        }
    };
    let union = union_variable_genes(va, vb);
    let kept = union.iter().filter(|g| shared(g)).cloned().collect::<Vec<_>>();
    if kept.len() < union.len() {
        warn!(
            "{} of {} variable genes are not scaled in both datasets and are left out",
            union.len() - kept.len(),
            union.len()
        );
    }
    if kept.is_empty() {
        return Err(PipelineError::exhausted("merging variable genes", Axis::Genes).into());
    }
    Ok(kept)
}

/// Merge two datasets. Raw and normalized values cover the genes present in both; the scaled
/// block covers the joint-embedding genes. Cells of `a` come first.
pub fn merge(mut a: Dataset, mut b: Dataset, params: &MergeParams) -> Result<MergedObject, Error> {
    if a.label == b.label {
        return Err(PipelineError::invalid(format!("both datasets are labelled {}", a.label)).into());
    }
    a.stages.require(Stage::Scaled, Stage::Merged)?;
    b.stages.require(Stage::Scaled, Stage::Merged)?;
    if let Some([pa, pb]) = &params.add_cell_ids {
        prefix_ids(&mut a, pa);
        prefix_ids(&mut b, pb);
    }

    let ids_a = a.counts.cells.iter().map(String::as_str).collect::<HashSet<_>>();
    if let Some(dup) = b.counts.cells.iter().find(|c| ids_a.contains(c.as_str())) {
        return Err(PipelineError::invalid(format!("cell id {dup} occurs in both datasets")).into());
    }

    let scaled_genes = scaled_genes(&a, &b, params.genes.as_ref())?;

    let genes_b = b.counts.gene_index();
    let (rows_a, rows_b): (Vec<_>, Vec<_>) = a
        .counts
        .genes
        .iter()
        .enumerate()
        .filter_map(|(i, g)| genes_b.get(g.as_str()).map(|&j| (i, j)))
        .unzip();
    if rows_a.is_empty() {
        return Err(PipelineError::exhausted("merging shared genes", Axis::Genes).into());
    }
    info!(
        "merging {} ({} cells) and {} ({} cells) over {} shared genes, {} joint-embedding genes",
        a.label,
        a.n_cells(),
        b.label,
        b.n_cells(),
        rows_a.len(),
        scaled_genes.len()
    );

    let counts = a.counts.select_genes(&rows_a).hstack(&b.counts.select_genes(&rows_b))?;
    let normalized = {
        let na = a.require_normalized(Stage::Merged)?;
        let nb = b.require_normalized(Stage::Merged)?;
        na.select_genes(&rows_a).hstack(&nb.select_genes(&rows_b))?
    };
    let scaled = match (a.scaled.take(), b.scaled.take()) {
        (Some(sa), Some(sb)) => sa
            .select_gene_names(&scaled_genes)?
            .hstack(&sb.select_gene_names(&scaled_genes)?)?,
        _ => {
            return Err(PipelineError::Ordering {
                required: Stage::Scaled,
                attempted: Stage::Merged,
            }
            .into())
        }
    };
    let meta = a.meta.concat(&b.meta);

    let merged = MergedObject::new(counts, normalized, scaled, meta, [a.label, b.label])?;
    merged.check()?;
    Ok(merged)
}

/// Split the scaled block of a merged object into its two libraries' columns.
pub fn library_blocks(merged: &MergedObject) -> [ScaledMatrix; 2] {
    let [ia, ib] = merged.library_indices();
    [merged.scaled.select_cells(&ia), merged.scaled.select_cells(&ib)]
}
