//! Wilcoxon rank-sum test on normalized expression.

use crate::tester::{Comparison, DifferentialTester, Side};
use anyhow::Error;
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};

/// Two-sided rank-sum test with tie and continuity correction, using the normal approximation.
#[derive(Clone, Debug, Default)]
pub struct WilcoxonTester;

/// Tied group of observations: how many of each side share one value.
#[derive(Clone, Copy, Default)]
struct TieGroup {
    a: usize,
    b: usize,
}

impl TieGroup {
    fn size(&self) -> usize {
        self.a + self.b
    }
}

/// Collapse sorted non-zero values into tie groups, inserting the implicit zeros in place.
fn tie_groups(mut values: Vec<(Side, f64)>, zeros_a: usize, zeros_b: usize) -> Vec<TieGroup> {
    values.sort_by(|x, y| x.1.total_cmp(&y.1));

    let mut groups = Vec::new();
    let mut zeros = Some(TieGroup { a: zeros_a, b: zeros_b });
    let mut current: Option<(f64, TieGroup)> = None;

    for (side, v) in values {
        if v > 0.0 {
            if let Some(z) = zeros.take() {
                if let Some((_, g)) = current.take() {
                    groups.push(g);
                }
                groups.push(z);
            }
        }
        match current.as_mut() {
            Some((cv, g)) if *cv == v => match side {
                Side::A => g.a += 1,
                _ => g.b += 1,
            },
            previous => {
                if let Some((_, g)) = previous {
                    groups.push(*g);
                }
                let g = match side {
                    Side::A => TieGroup { a: 1, b: 0 },
                    _ => TieGroup { a: 0, b: 1 },
                };
                current = Some((v, g));
            }
        }
    }
    if let Some((_, g)) = current {
        groups.push(g);
    }
    if let Some(z) = zeros {
        groups.push(z);
    }
    groups.retain(|g| g.size() > 0);
    groups
}

/// p-value from tie groups in ascending value order.
fn rank_sum_p_value(groups: &[TieGroup], n_a: usize, n_b: usize) -> f64 {
    let n = (n_a + n_b) as f64;
    let (na, nb) = (n_a as f64, n_b as f64);

    let mut rank_sum_a = 0.0;
    let mut tie_sum = 0.0;
    let mut start = 0.0;
    for g in groups {
        let t = g.size() as f64;
        let avg_rank = start + (t + 1.0) / 2.0;
        rank_sum_a += g.a as f64 * avg_rank;
        tie_sum += t * t * t - t;
        start += t;
    }

    let u = rank_sum_a - na * (na + 1.0) / 2.0;
    let diff = u - na * nb / 2.0;
    let sigma = (na * nb / 12.0 * ((n + 1.0) - tie_sum / (n * (n - 1.0)))).sqrt();
    if !(sigma > 0.0) {
        return 1.0;
    }

    let z = (diff - 0.5 * diff.signum()) / sigma;
    match Normal::new(0.0, 1.0) {
        Ok(normal) => (2.0 * normal.sf(z.abs())).min(1.0),
        Err(_) => 1.0,
    }
}

impl DifferentialTester for WilcoxonTester {
    fn name(&self) -> &str {
        "wilcox"
    }

    fn p_values(&self, cmp: &Comparison<'_>, genes: &[usize]) -> Result<Vec<f64>, Error> {
        let (n_a, n_b) = (cmp.group_a.len(), cmp.group_b.len());
        let p = genes
            .par_iter()
            .map(|&g| {
                let values = cmp.normalized_entries(g);
                let nnz_a = values.iter().filter(|(s, _)| *s == Side::A).count();
                let nnz_b = values.len() - nnz_a;
                let groups = tie_groups(values, n_a - nnz_a, n_b - nnz_b);
                rank_sum_p_value(&groups, n_a, n_b)
            })
            .collect();
        Ok(p)
    }
}
