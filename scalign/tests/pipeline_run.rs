mod common;

use anyhow::Error;
use common::{synthetic_library, write_table};
use flate2::read::GzDecoder;
use scalign::config::PipelineConfig;
use scalign::pathway::PathwayTransport;
use scalign::pipeline::{marker_pathways, run_pipeline, write_outputs, LibraryInput};
use scalign::qc::Bounds;
use scalign::snapshot::load_snapshot;
use scalign::variable_features::Selection;
use scalign_types::embedding::{CCA, CCA_ALIGNED, TSNE};
use scalign_types::{MergedObject, PipelineError, Stage};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

fn small_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.qc.min_genes = 5;
    config.qc.n_gene = Bounds::new(Some(5.0), Some(5000.0));
    config.variable_features.selection = Selection::TopN(30);
    config.cca.num_cc = 8;
    config.align.dims = 5;
    config.align.var_ratio_threshold = 0.0;
    config.cluster.dims = 5;
    config.cluster.k = 10;
    config.tsne.perplexity = 5.0;
    config.tsne.max_iter = 300;
    config
}

fn inputs(dir: &Path) -> [LibraryInput; 2] {
    let ctrl = write_table(dir, "ctrl.tsv.gz", &synthetic_library(60, 40, false, 21));
    let stim = write_table(dir, "stim.tsv.gz", &synthetic_library(60, 40, true, 22));
    [
        LibraryInput {
            label: "ctrl".to_string(),
            path: ctrl,
        },
        LibraryInput {
            label: "stim".to_string(),
            path: stim,
        },
    ]
}

/// Most common cluster among the cells of one planted type
fn majority_cluster(merged: &MergedObject, kind: usize) -> u32 {
    let clusters = merged.meta.cluster.as_ref().unwrap();
    let mut votes = HashMap::<u32, usize>::new();
    for (id, &c) in merged.cell_ids().iter().zip(clusters) {
        let barcode = id.rsplit('_').next().unwrap();
        let n: usize = barcode[2..6].parse().unwrap();
        if n % 2 == kind {
            *votes.entry(c).or_default() += 1;
        }
    }
    votes.into_iter().max_by_key(|&(c, n)| (n, std::cmp::Reverse(c))).unwrap().0
}

#[test]
fn two_libraries_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config();
    let merged = run_pipeline(&inputs(dir.path()), &config).unwrap();

    assert_eq!(merged.n_cells(), 80);
    for stage in [
        Stage::Merged,
        Stage::JointEmbedded,
        Stage::IntegrationFiltered,
        Stage::Aligned,
        Stage::Clustered,
        Stage::Projected,
        Stage::Markers,
    ] {
        assert!(merged.stages.has_run(stage), "{stage:?}");
    }
    assert_eq!(merged.embedding(CCA).unwrap().dims(), 8);
    assert_eq!(merged.embedding(CCA_ALIGNED).unwrap().dims(), 5);
    let tsne = merged.embedding(TSNE).unwrap();
    assert_eq!(tsne.coords.dim(), (80, 2));
    assert!(tsne.coords.iter().all(|v| v.is_finite()));

    let clusters = merged.meta.cluster.clone().unwrap();
    assert_eq!(clusters.len(), 80);
    let n_clusters = clusters.iter().max().unwrap() + 1;
    assert!(n_clusters >= 2);
    assert!((0..n_clusters).all(|c| clusters.contains(&c)));
    assert_ne!(majority_cluster(&merged, 0), majority_cluster(&merged, 1));

    assert_eq!(merged.markers().len(), n_clusters as usize);
    for table in merged.markers() {
        assert_eq!(table.ident_2(), "rest");
        for row in table.rows() {
            assert!(row.p_val_adj >= row.p_val);
            assert!(row.avg_log_fc.abs() >= config.markers.logfc_threshold);
        }
    }
    assert!(merged.markers().iter().any(|t| !t.is_empty()));

    let out = dir.path().join("out");
    write_outputs(&merged, &out).unwrap();
    assert_eq!(load_snapshot(&out.join("merged.snapshot")).unwrap(), merged);
    assert!(out.join("markers_0_vs_rest.tsv").exists());
    assert!(out.join("metadata.tsv").exists());

    let mut csv = String::new();
    GzDecoder::new(std::fs::File::open(out.join("tsne.csv.gz")).unwrap())
        .read_to_string(&mut csv)
        .unwrap();
    assert_eq!(csv.lines().next(), Some("cell,tSNE_1,tSNE_2"));
    assert_eq!(csv.lines().count(), 81);
}

struct Recorder {
    bodies: RefCell<Vec<String>>,
}

impl PathwayTransport for Recorder {
    fn post(&self, _url: &str, body: &str) -> Result<String, Error> {
        self.bodies.borrow_mut().push(body.to_string());
        Ok(r#"{"summary": {"token": "TOKEN1"}, "pathwaysFound": 0, "pathways": []}"#.to_string())
    }
}

#[test]
fn marker_genes_feed_pathway_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config();
    config.markers.only_pos = true;
    config.pathway.n_genes = 5;
    let merged = run_pipeline(&inputs(dir.path()), &config).unwrap();

    let transport = Recorder {
        bodies: RefCell::new(Vec::new()),
    };
    match marker_pathways(&merged, &config, &transport).unwrap() {
        Some(report) => {
            assert_eq!(report.token, "TOKEN1");
            let bodies = transport.bodies.borrow();
            assert_eq!(bodies.len(), 1);
            let mut lines = bodies[0].lines();
            assert_eq!(lines.next(), Some("#cluster0_markers"));
            let genes = lines.collect::<Vec<_>>();
            assert!(!genes.is_empty() && genes.len() <= 5);
            let first = &merged.markers()[0];
            assert!(genes.iter().all(|g| first.rows().iter().any(|r| r.gene == *g)));
        }
        None => assert!(merged.markers()[0].is_empty()),
    }
}

#[test]
fn identical_labels_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut libs = inputs(dir.path());
    libs[1].label = "ctrl".to_string();
    let err = run_pipeline(&libs, &small_config()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidParameter(_))
    ));
}
