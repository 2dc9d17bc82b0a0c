//! # scalign: two-library single-cell integration
//!
//! Per-library QC, normalization and variable-gene selection, then a merged object carried
//! through canonical correlation, alignment, graph clustering, t-SNE and marker detection.

#[allow(unused_extern_crates)]
extern crate blas_src;

/// Joint embedding and subspace alignment
pub mod align;

/// Cell-cycle module scores
pub mod cell_cycle;

/// SNN graph construction and community detection
pub mod cluster;

/// Pipeline configuration
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// Merging two datasets
pub mod integrate;

/// Count table loading
pub mod loader;

/// Marker gene detection
pub mod markers;

/// Nearest-neighbor graphs
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// Pathway over-representation client
pub mod pathway;

/// End-to-end workflow and output writers
pub mod pipeline;

/// 2-D/3-D projections
pub mod projection;

/// Quality control
pub mod qc;

/// Merged object snapshots
pub mod snapshot;

/// Statistics functions
pub mod stats;

/// Highly variable genes
pub mod variable_features;
