//! Data model shared by the scalign crates: count matrices, per-cell metadata, datasets,
//! the merged object, embeddings and marker tables.

/// Datasets, the merged object and the stage log
pub mod dataset;
/// Named per-cell embeddings
pub mod embedding;
/// Pipeline error kinds
pub mod error;
/// Marker tables
pub mod marker;
/// Gene × cell matrices
pub mod matrix;
/// Per-cell metadata columns
pub mod metadata;

pub use dataset::{Dataset, MergedObject, Stage, StageLog};
pub use embedding::Embedding;
pub use error::PipelineError;
pub use marker::{MarkerRow, MarkerSort, MarkerTable};
pub use matrix::{CountMatrix, NormalizedMatrix, ScaledMatrix};
pub use metadata::CellMetadata;
