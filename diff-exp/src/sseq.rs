//! sSeq negative-binomial test on raw counts.
//!
//! Dispersions are estimated by the method of moments and shrunk towards a high quantile of
//! their distribution (Yu, Huber & Vitek 2013). Pairs of group sums are then compared with an
//! exact test, or with a beta approximation when both sums are large.

use crate::dist;
use crate::stat::Statistics;
use crate::tester::{Comparison, DifferentialTester, Side};
use anyhow::Error;
use log::debug;
use rayon::prelude::*;
use scalign_types::PipelineError;
use sprs::CsMat;

/// Sums above which both groups switch to the asymptotic test
pub const BIG_COUNT_DEFAULT: u64 = 900;
/// Quantile of the moment dispersions used as the shrinkage target
pub const ZETA_QUANTILE_DEFAULT: f64 = 0.995;

/// Global parameters of the sSeq model, estimated over a set of cells
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SSeqParams {
    pub num_cells: usize,
    pub num_genes: usize,
    /// per-cell size factor over every matrix column; zero for cells outside the estimate
    pub size_factors: Vec<f64>,
    pub gene_means: Vec<f64>,
    pub gene_variances: Vec<f64>,
    /// genes with non-zero variance
    pub use_genes: Vec<bool>,
    pub gene_moment_phi: Vec<f64>,
    pub zeta_hat: f64,
    pub delta: f64,
    /// shrunken dispersion
    pub gene_phi: Vec<f64>,
}

/// Per-cell library size over its median across `cells`. Other columns get zero.
fn size_factors(counts: &CsMat<u32>, cells: &[usize]) -> Result<Vec<f64>, Error> {
    let mut totals = vec![0.0; counts.cols()];
    for row in counts.outer_iterator() {
        for (c, &v) in row.iter() {
            totals[c] += v as f64;
        }
    }
    let median = cells.iter().map(|&c| totals[c]).collect::<Vec<_>>().median();
    if !(median > 0.0) {
        return Err(PipelineError::invalid("median library size of the compared cells is zero").into());
    }

    let mut factors = vec![0.0; counts.cols()];
    for &c in cells {
        factors[c] = totals[c] / median;
    }
    Ok(factors)
}

/// Estimate sSeq parameters from the cells in `cells`.
pub fn compute_sseq_params(counts: &CsMat<u32>, cells: &[usize], zeta_quantile: f64) -> Result<SSeqParams, Error> {
    if !(0.0..=1.0).contains(&zeta_quantile) {
        return Err(PipelineError::invalid(format!("zeta quantile {zeta_quantile} outside [0, 1]")).into());
    }
    let size_factors = size_factors(counts, cells)?;
    let cell_count = cells.len() as f64;
    let gene_count = counts.rows() as f64;

    let mut in_set = vec![false; counts.cols()];
    for &c in cells {
        in_set[c] = true;
    }

    // moments of size-normalized counts; V[X] = E[X^2] - E[X]^2
    let (gene_means, gene_variances): (Vec<f64>, Vec<f64>) = counts
        .outer_iterator()
        .map(|row| {
            let (mut s, mut ss) = (0.0, 0.0);
            for (c, &v) in row.iter() {
                if in_set[c] {
                    let x = v as f64 / size_factors[c];
                    s += x;
                    ss += x * x;
                }
            }
            let mean = s / cell_count;
            (mean, (ss / cell_count - mean * mean).max(0.0))
        })
        .unzip();

    let use_genes = gene_variances.iter().map(|&v| v > 0.0).collect::<Vec<_>>();
    let sum_inv_size_factors: f64 = cells.iter().map(|&c| 1.0 / size_factors[c]).filter(|v| v.is_finite()).sum();

    let mut phi_used = Vec::new();
    let gene_moment_phi = use_genes
        .iter()
        .enumerate()
        .map(|(i, &used)| {
            if !used {
                return 0.0;
            }
            let (m, v) = (gene_means[i], gene_variances[i]);
            let phi = ((cell_count * v - m * sum_inv_size_factors) / (m * m * sum_inv_size_factors)).max(0.0);
            phi_used.push(phi);
            phi
        })
        .collect::<Vec<_>>();

    let (zeta_hat, delta) = if phi_used.is_empty() {
        (0.0, 0.0)
    } else {
        let zeta_hat = phi_used.percentile(100.0 * zeta_quantile);
        let mean_phi = phi_used.mean();
        let spread = phi_used.iter().map(|x| (x - mean_phi).powi(2)).sum::<f64>() / (gene_count - 1.0);
        let to_target = phi_used.iter().map(|x| (x - zeta_hat).powi(2)).sum::<f64>() / (gene_count - 2.0);
        let delta = if to_target > 0.0 { spread / to_target } else { 0.0 };
        (zeta_hat, delta)
    };

    let any_dispersed = phi_used.iter().any(|&x| x > 0.0);
    let gene_phi = gene_moment_phi
        .iter()
        .zip(&use_genes)
        .map(|(&phi, &used)| {
            if any_dispersed && used {
                (1.0 - delta) * phi + delta * zeta_hat
            } else {
                0.0
            }
        })
        .collect();

    debug!("sSeq parameters: zeta_hat {zeta_hat:.4}, delta {delta:.4}");

    Ok(SSeqParams {
        num_cells: cells.len(),
        num_genes: counts.rows(),
        size_factors,
        gene_means,
        gene_variances,
        use_genes,
        gene_moment_phi,
        zeta_hat,
        delta,
        gene_phi,
    })
}

/// Negative-binomial exact test on raw counts with shrunken dispersion.
#[derive(Clone, Debug)]
pub struct SSeqTester {
    pub big_count: u64,
    pub zeta_quantile: f64,
}

impl Default for SSeqTester {
    fn default() -> Self {
        SSeqTester {
            big_count: BIG_COUNT_DEFAULT,
            zeta_quantile: ZETA_QUANTILE_DEFAULT,
        }
    }
}

impl DifferentialTester for SSeqTester {
    fn name(&self) -> &str {
        "sseq"
    }

    fn p_values(&self, cmp: &Comparison<'_>, genes: &[usize]) -> Result<Vec<f64>, Error> {
        let cells = cmp.group_a.iter().chain(cmp.group_b).copied().collect::<Vec<_>>();
        let params = compute_sseq_params(cmp.counts, &cells, self.zeta_quantile)?;
        let size_factor_a: f64 = cmp.group_a.iter().map(|&c| params.size_factors[c]).sum();
        let size_factor_b: f64 = cmp.group_b.iter().map(|&c| params.size_factors[c]).sum();

        let p = genes
            .par_iter()
            .map(|&g| {
                let (mut sum_a, mut sum_b) = (0u64, 0u64);
                for (side, v) in cmp.count_entries(g) {
                    match side {
                        Side::A => sum_a += v as u64,
                        Side::B => sum_b += v as u64,
                        Side::Neither => {}
                    }
                }
                let (mu, phi) = (params.gene_means[g], params.gene_phi[g]);
                if params.use_genes[g] && sum_a > self.big_count && sum_b > self.big_count {
                    dist::nb_asymptotic_test(sum_a, sum_b, size_factor_a, size_factor_b, mu, phi)
                } else {
                    dist::nb_exact_test(sum_a, sum_b, size_factor_a, size_factor_b, mu, phi)
                }
            })
            .collect();
        Ok(p)
    }
}
