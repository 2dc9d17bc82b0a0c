//! Two-group differential expression tests over gene × cell matrices.

/// distributions and multiple-testing correction
pub mod dist;
/// sSeq negative-binomial test
pub mod sseq;
/// statistics extension
pub mod stat;
/// the tester capability and comparison groups
pub mod tester;
/// Wilcoxon rank-sum test
pub mod wilcoxon;

pub use crate::dist::{adjusted_pvalue_bh, adjusted_pvalue_bonferroni};
pub use crate::sseq::{compute_sseq_params, SSeqParams, SSeqTester};
pub use crate::tester::{Comparison, DifferentialTester, Side};
pub use crate::wilcoxon::WilcoxonTester;
