//! The full two-library workflow and its output files.

use crate::align::{align_subspace, calc_var_exp_ratio, discard_poorly_integrated, run_cca, Cca, QuantileAligner};
use crate::cell_cycle::cell_cycle_scoring;
use crate::cluster::find_clusters;
use crate::config::PipelineConfig;
use crate::integrate::{merge, MergeParams};
use crate::loader::load_dataset;
use crate::markers::{find_all_markers, write_marker_file, MarkerTest};
use crate::normalization::{log_normalize, scale_data, ScaleParams};
use crate::pathway::{analyze_genes, PathwayReport, PathwayTransport};
use crate::projection::run_tsne;
use crate::qc;
use crate::snapshot::save_snapshot;
use crate::variable_features::{find_variable_genes, union_variable_genes};
use anyhow::{Context, Error};
use diff_exp::{SSeqTester, WilcoxonTester};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use scalign_types::embedding::TSNE;
use scalign_types::{Dataset, MergedObject, PipelineError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One input count table and the label its cells are tagged with
#[derive(Clone, Debug)]
pub struct LibraryInput {
    pub label: String,
    pub path: PathBuf,
}

/// Per-library stages up to variable-gene selection: QC, normalization and optional
/// cell-cycle scoring.
pub fn prepare_dataset(dataset: Dataset, config: &PipelineConfig) -> Result<Dataset, Error> {
    let dataset = qc::filter(dataset, &config.qc)?;
    let mut dataset = log_normalize(dataset, config.normalize.scale_factor)?;
    if config.cell_cycle.enabled() {
        dataset = cell_cycle_scoring(
            dataset,
            &config.cell_cycle.s_genes,
            &config.cell_cycle.g2m_genes,
            &config.cell_cycle.scoring,
        )?;
    }
    find_variable_genes(dataset, &config.variable_features)
}

/// Scale both libraries over the joint-embedding genes and merge them. Unless the configuration
/// names the genes, the union of both libraries' variable genes is used.
pub fn merge_libraries(a: Dataset, b: Dataset, config: &PipelineConfig) -> Result<MergedObject, Error> {
    let genes = match &config.scale.genes {
        Some(genes) => genes.clone(),
        None => {
            let va = a.variable_genes.as_deref().unwrap_or_default();
            let vb = b.variable_genes.as_deref().unwrap_or_default();
            union_variable_genes(va, vb)
        }
    };
    info!("scaling {} joint-embedding genes in both libraries", genes.len());
    let scale = ScaleParams {
        genes: Some(genes),
        ..config.scale.clone()
    };
    let a = scale_data(a, &scale)?;
    let b = scale_data(b, &scale)?;
    let params = MergeParams {
        add_cell_ids: Some([a.label.clone(), b.label.clone()]),
        genes: None,
    };
    merge(a, b, &params)
}

/// Joint stages on a merged object: correlates, variance-ratio filter, alignment, clustering,
/// projection and markers of every cluster.
pub fn integrate(merged: MergedObject, config: &PipelineConfig) -> Result<MergedObject, Error> {
    let cca = Cca {
        n_iter: config.cca.n_iter,
        seed: config.cca.seed,
        ..Cca::default()
    };
    let merged = run_cca(merged, &cca, config.cca.num_cc)?;
    let merged = calc_var_exp_ratio(merged, config.align.dims)?;
    let merged = discard_poorly_integrated(merged, config.align.var_ratio_threshold)?;
    let merged = align_subspace(merged, &QuantileAligner, config.align.dims)?;
    let merged = find_clusters(merged, &config.cluster, &config.cluster.louvain())?;
    let merged = run_tsne(merged, &config.tsne, config.align.dims, TSNE)?;
    match config.markers.test {
        MarkerTest::Wilcoxon => find_all_markers(merged, &config.markers, &WilcoxonTester),
        MarkerTest::SSeq => find_all_markers(merged, &config.markers, &SSeqTester::default()),
    }
}

/// Load two count tables and run every stage.
pub fn run_pipeline(inputs: &[LibraryInput; 2], config: &PipelineConfig) -> Result<MergedObject, Error> {
    config.validate()?;
    if inputs[0].label == inputs[1].label {
        return Err(PipelineError::invalid(format!("both libraries are labelled {}", inputs[0].label)).into());
    }
    let [a, b] = inputs;
    let a = prepare_dataset(load_dataset(&a.path, &a.label)?, config)?;
    let b = prepare_dataset(load_dataset(&b.path, &b.label)?, config)?;
    let merged = merge_libraries(a, b, config)?;
    let merged = integrate(merged, config)?;
    merged.check()?;
    info!(
        "finished: {} cells in {} clusters, {} marker tables",
        merged.n_cells(),
        merged
            .meta
            .cluster
            .as_ref()
            .and_then(|c| c.iter().max())
            .map_or(0, |&c| c + 1),
        merged.markers().len()
    );
    Ok(merged)
}

/// Write the coordinates of embedding `name` as a gzipped CSV with one row per cell.
pub fn write_embedding_csv(merged: &MergedObject, name: &str, path: &Path) -> Result<(), Error> {
    let embedding = merged
        .embedding(name)
        .ok_or_else(|| PipelineError::invalid(format!("no embedding named {name}")))?;
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut writer = csv::Writer::from_writer(GzEncoder::new(BufWriter::new(file), Compression::default()));

    let prefix = if name == TSNE { "tSNE".to_string() } else { name.to_string() };
    let mut header = vec!["cell".to_string()];
    header.extend((1..=embedding.dims()).map(|i| format!("{prefix}_{i}")));
    writer.write_record(&header)?;
    for (cell, row) in embedding.cell_ids.iter().zip(embedding.coords.rows()) {
        let mut record = vec![cell.clone()];
        record.extend(row.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .finish()?
        .flush()?;
    Ok(())
}

/// Write per-cell metadata as a TSV with a header line.
pub fn write_metadata(merged: &MergedObject, path: &Path) -> Result<(), Error> {
    let meta = &merged.meta;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| path.display().to_string())?;

    let mut header = vec!["cell", "library", "nUMI", "nGene", "percent.mito"];
    if meta.cluster.is_some() {
        header.push("cluster");
    }
    if meta.phase.is_some() {
        header.push("phase");
    }
    header.extend(meta.numeric.keys().map(String::as_str));
    writer.write_record(&header)?;

    for i in 0..meta.len() {
        let mut record = vec![
            meta.cell_ids[i].clone(),
            meta.library[i].clone(),
            meta.n_umi[i].to_string(),
            meta.n_gene[i].to_string(),
            meta.percent_mito[i].to_string(),
        ];
        if let Some(c) = &meta.cluster {
            record.push(c[i].to_string());
        }
        if let Some(p) = &meta.phase {
            record.push(p[i].clone());
        }
        record.extend(meta.numeric.values().map(|v| v[i].to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the snapshot, marker tables, t-SNE coordinates and metadata into `out_dir`.
pub fn write_outputs(merged: &MergedObject, out_dir: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;
    save_snapshot(merged, &out_dir.join("merged.snapshot"))?;
    for table in merged.markers() {
        let name = format!("markers_{}_vs_{}.tsv", table.ident_1(), table.ident_2());
        write_marker_file(table, &out_dir.join(name))?;
    }
    if merged.embedding(TSNE).is_some() {
        write_embedding_csv(merged, TSNE, &out_dir.join("tsne.csv.gz"))?;
    }
    write_metadata(merged, &out_dir.join("metadata.tsv"))?;
    info!("wrote outputs to {}", out_dir.display());
    Ok(())
}

/// Submit the up-regulated genes of the first marker table for pathway enrichment.
pub fn marker_pathways(
    merged: &MergedObject,
    config: &PipelineConfig,
    transport: &impl PathwayTransport,
) -> Result<Option<PathwayReport>, Error> {
    let table = match merged.markers().first() {
        Some(t) => t,
        None => return Ok(None),
    };
    let genes = table
        .rows()
        .iter()
        .filter(|r| r.avg_log_fc > 0.0)
        .take(config.pathway.n_genes)
        .map(|r| r.gene.clone())
        .collect::<Vec<_>>();
    if genes.is_empty() {
        return Ok(None);
    }
    let name = format!("cluster{}_markers", table.ident_1());
    analyze_genes(&name, &genes, &config.pathway, transport).map(Some)
}
