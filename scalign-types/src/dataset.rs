use crate::embedding::Embedding;
use crate::error::PipelineError;
use crate::marker::MarkerTable;
use crate::matrix::{CountMatrix, NormalizedMatrix, ScaledMatrix};
use crate::metadata::CellMetadata;
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Pipeline stages whose completion is tracked on a `Dataset` or `MergedObject`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    QcFiltered,
    Normalized,
    CellCycleScored,
    Scaled,
    VariableFeatures,
    Merged,
    JointEmbedded,
    VarRatioComputed,
    IntegrationFiltered,
    Aligned,
    Clustered,
    Projected,
    Markers,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::QcFiltered => "QC filtering",
            Stage::Normalized => "normalization",
            Stage::CellCycleScored => "cell-cycle scoring",
            Stage::Scaled => "scaling",
            Stage::VariableFeatures => "variable feature selection",
            Stage::Merged => "merging",
            Stage::JointEmbedded => "joint embedding",
            Stage::VarRatioComputed => "variance-ratio computation",
            Stage::IntegrationFiltered => "integration filtering",
            Stage::Aligned => "subspace alignment",
            Stage::Clustered => "clustering",
            Stage::Projected => "projection",
            Stage::Markers => "marker detection",
        };
        f.write_str(s)
    }
}

/// Ordered record of completed stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLog(Vec<Stage>);

impl StageLog {
    pub fn has_run(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    /// Fail with `PipelineError::Ordering` unless `required` has run.
    pub fn require(&self, required: Stage, attempted: Stage) -> Result<(), PipelineError> {
        if self.has_run(required) {
            Ok(())
        } else {
            Err(PipelineError::Ordering { required, attempted })
        }
    }

    /// Fail with `PipelineError::Ordering` if `later` has already run; `attempted` must precede it.
    pub fn forbid(&self, later: Stage, attempted: Stage) -> Result<(), PipelineError> {
        if self.has_run(later) {
            Err(PipelineError::Ordering {
                required: attempted,
                attempted: later,
            })
        } else {
            Ok(())
        }
    }

    pub fn mark(&mut self, stage: Stage) {
        if !self.has_run(stage) {
            self.0.push(stage);
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }
}

/// One platform's cells: counts, per-cell metadata and the products of the per-dataset stages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub label: String,
    pub counts: CountMatrix,
    pub meta: CellMetadata,
    pub normalized: Option<NormalizedMatrix>,
    pub scaled: Option<ScaledMatrix>,
    /// highly variable genes, best first
    pub variable_genes: Option<Vec<String>>,
    pub stages: StageLog,
}

impl Dataset {
    pub fn new(label: &str, counts: CountMatrix) -> Dataset {
        let meta = CellMetadata::new(counts.cells.clone(), label);
        Dataset {
            label: label.to_string(),
            counts,
            meta,
            normalized: None,
            scaled: None,
            variable_genes: None,
            stages: StageLog::default(),
        }
    }

    pub fn n_cells(&self) -> usize {
        self.counts.n_cells()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    /// The normalized matrix, or an ordering error naming `attempted`.
    pub fn require_normalized(&self, attempted: Stage) -> Result<&NormalizedMatrix, PipelineError> {
        self.stages.require(Stage::Normalized, attempted)?;
        self.normalized.as_ref().ok_or(PipelineError::Ordering {
            required: Stage::Normalized,
            attempted,
        })
    }

    /// Check the cell-axis invariant across counts, metadata and stage products.
    pub fn check(&self) -> Result<(), Error> {
        self.meta.check_cells(&self.counts.cells)?;
        if let Some(n) = &self.normalized {
            if n.cells != self.counts.cells {
                bail!("normalized matrix of {} is out of sync with its counts", self.label);
            }
        }
        if let Some(s) = &self.scaled {
            if s.cells != self.counts.cells {
                bail!("scaled matrix of {} is out of sync with its counts", self.label);
            }
        }
        Ok(())
    }
}

/// Two datasets combined over a concatenated cell axis. The sole object mutated by the joint
/// stages; embeddings and marker tables are only ever added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedObject {
    pub counts: CountMatrix,
    pub normalized: NormalizedMatrix,
    /// scaled values over the genes used for the joint embedding
    pub scaled: ScaledMatrix,
    pub meta: CellMetadata,
    pub libraries: [String; 2],
    pub stages: StageLog,
    embeddings: BTreeMap<String, Embedding>,
    markers: Vec<MarkerTable>,
}

impl MergedObject {
    pub fn new(
        counts: CountMatrix,
        normalized: NormalizedMatrix,
        scaled: ScaledMatrix,
        meta: CellMetadata,
        libraries: [String; 2],
    ) -> Result<MergedObject, Error> {
        meta.check_cells(&counts.cells)?;
        if normalized.cells != counts.cells || scaled.cells != counts.cells {
            bail!("merged matrices disagree on the cell axis");
        }
        let mut stages = StageLog::default();
        stages.mark(Stage::Merged);
        Ok(MergedObject {
            counts,
            normalized,
            scaled,
            meta,
            libraries,
            stages,
            embeddings: BTreeMap::new(),
            markers: Vec::new(),
        })
    }

    pub fn n_cells(&self) -> usize {
        self.counts.n_cells()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.counts.cells
    }

    pub fn embedding(&self, name: &str) -> Option<&Embedding> {
        self.embeddings.get(name)
    }

    pub fn embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.embeddings.values()
    }

    /// The named embedding, or an ordering error: `required` is the stage that produces it.
    pub fn require_embedding(&self, name: &str, required: Stage, attempted: Stage) -> Result<&Embedding, PipelineError> {
        self.embeddings
            .get(name)
            .ok_or(PipelineError::Ordering { required, attempted })
    }

    /// Store an embedding. Recomputing a space replaces the earlier coordinates.
    pub fn add_embedding(&mut self, embedding: Embedding) -> Result<(), Error> {
        if embedding.cell_ids != self.counts.cells {
            bail!("embedding {} does not follow the object's cell order", embedding.name);
        }
        self.embeddings.insert(embedding.name.clone(), embedding);
        Ok(())
    }

    pub fn add_markers(&mut self, table: MarkerTable) {
        self.markers.push(table);
    }

    pub fn markers(&self) -> &[MarkerTable] {
        &self.markers
    }

    /// Column indices of each library's cells, in library order.
    pub fn library_indices(&self) -> [Vec<usize>; 2] {
        [
            self.meta.library_indices(&self.libraries[0]),
            self.meta.library_indices(&self.libraries[1]),
        ]
    }

    /// Keep the cells at `idx` (ascending) across every matrix, metadata column and embedding.
    pub fn subset_cells(&self, idx: &[usize]) -> MergedObject {
        MergedObject {
            counts: self.counts.select_cells(idx),
            normalized: self.normalized.select_cells(idx),
            scaled: self.scaled.select_cells(idx),
            meta: self.meta.subset(idx),
            libraries: self.libraries.clone(),
            stages: self.stages.clone(),
            embeddings: self
                .embeddings
                .iter()
                .map(|(k, e)| (k.clone(), e.subset(idx)))
                .collect(),
            markers: self.markers.clone(),
        }
    }

    pub fn check(&self) -> Result<(), Error> {
        self.meta.check_cells(&self.counts.cells)?;
        for e in self.embeddings.values() {
            if e.cell_ids != self.counts.cells {
                bail!("embedding {} is out of sync with the merged object", e.name);
            }
        }
        Ok(())
    }
}
