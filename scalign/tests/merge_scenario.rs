mod common;

use common::{synthetic_library, write_table};
use scalign::integrate::{merge, MergeParams};
use scalign::loader::load_dataset;
use scalign::normalization::{log_normalize, scale_data, ScaleParams, DEFAULT_SCALE_FACTOR};
use scalign::variable_features::{find_variable_genes, Selection, VariableFeatureParams};
use scalign_types::{Dataset, PipelineError, Stage};
use std::collections::BTreeSet;
use std::path::Path;

fn processed(dir: &Path, label: &str, suffix: &str, n_cells: usize, shift: bool, seed: u64) -> Dataset {
    let mut table = synthetic_library(60, n_cells, shift, seed);
    for c in table.cells.iter_mut() {
        *c = c.replace("-1", suffix);
    }
    let path = write_table(dir, &format!("{label}.tsv.gz"), &table);
    let dataset = load_dataset(&path, label).unwrap();
    let dataset = log_normalize(dataset, DEFAULT_SCALE_FACTOR).unwrap();
    let params = VariableFeatureParams {
        selection: Selection::TopN(25),
        ..VariableFeatureParams::default()
    };
    let dataset = find_variable_genes(dataset, &params).unwrap();
    scale_data(dataset, &ScaleParams::default()).unwrap()
}

#[test]
fn merge_of_disjoint_libraries() {
    let dir = tempfile::tempdir().unwrap();
    let a = processed(dir.path(), "ctrl", "-1", 24, false, 1);
    let b = processed(dir.path(), "stim", "-2", 31, true, 2);
    let (n_a, n_b) = (a.n_cells(), b.n_cells());

    let merged = merge(a, b, &MergeParams::default()).unwrap();
    assert_eq!(merged.n_cells(), n_a + n_b);
    assert_eq!(merged.meta.len(), n_a + n_b);
    assert_eq!(merged.counts.n_cells(), n_a + n_b);
    assert_eq!(merged.scaled.n_cells(), n_a + n_b);

    let libraries = merged.meta.library.iter().collect::<BTreeSet<_>>();
    assert_eq!(libraries.len(), 2);
    let [ia, ib] = merged.library_indices();
    assert_eq!((ia.len(), ib.len()), (n_a, n_b));
    assert!(ia.iter().all(|&i| merged.cell_ids()[i].ends_with("-1")));
    assert!(ib.iter().all(|&i| merged.cell_ids()[i].ends_with("-2")));
    assert!(merged.stages.has_run(Stage::Merged));
}

#[test]
fn prefixes_separate_clashing_ids() {
    let dir = tempfile::tempdir().unwrap();
    let a = processed(dir.path(), "ctrl", "-1", 20, false, 3);
    let b = processed(dir.path(), "stim", "-1", 20, true, 4);

    let err = merge(a.clone(), b.clone(), &MergeParams::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidParameter(_))
    ));

    let params = MergeParams {
        add_cell_ids: Some(["ctrl".to_string(), "stim".to_string()]),
        genes: None,
    };
    let merged = merge(a, b, &params).unwrap();
    assert_eq!(merged.n_cells(), 40);
    assert_eq!(merged.cell_ids()[0], "ctrl_BC0000-1");
    assert_eq!(merged.cell_ids()[20], "stim_BC0000-1");
}

#[test]
fn merge_requires_scaled_data() {
    let dir = tempfile::tempdir().unwrap();
    let table = synthetic_library(60, 12, false, 5);
    let a = load_dataset(write_table(dir.path(), "a.tsv.gz", &table), "ctrl").unwrap();
    let b = processed(dir.path(), "stim", "-2", 12, true, 6);
    let err = merge(a, b, &MergeParams::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Ordering {
            required: Stage::Scaled,
            attempted: Stage::Merged
        })
    ));
}
