//! Highly variable gene selection on log-normalized data.

use anyhow::Error;
use itertools::Itertools;
use log::{info, warn};
use rayon::prelude::*;
use scalign_types::error::Axis;
use scalign_types::{Dataset, NormalizedMatrix, PipelineError, Stage};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// How genes are picked once dispersions are binned and z-scored
#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
pub enum Selection {
    /// `mean_low < mean < mean_high` and `z > dispersion_low`
    #[default]
    Cutoffs {
        #[default = 0.0125]
        mean_low: f64,
        #[default = 3.0]
        mean_high: f64,
        #[default = 0.5]
        dispersion_low: f64,
    },
    /// The `n` highest-ranked genes
    TopN(usize),
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableFeatureParams {
    /// number of equal-width bins over the gene means
    #[default = 20]
    pub n_bins: usize,
    pub selection: Selection,
}

impl VariableFeatureParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.n_bins == 0 {
            return Err(PipelineError::invalid("variable features need at least one bin"));
        }
        match self.selection {
            Selection::Cutoffs {
                mean_low,
                mean_high,
                dispersion_low,
            } => {
                if mean_low.is_nan() || mean_high.is_nan() || dispersion_low.is_nan() || mean_low > mean_high {
                    return Err(PipelineError::invalid(format!(
                        "bad variable-gene cutoffs: mean ({mean_low}, {mean_high}), dispersion {dispersion_low}"
                    )));
                }
            }
            Selection::TopN(0) => return Err(PipelineError::invalid("TopN needs n > 0")),
            Selection::TopN(_) => {}
        }
        Ok(())
    }
}

/// Per-gene statistics behind the selection.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneDispersion {
    pub gene: String,
    /// ln(1 + mean(expm1(x)))
    pub mean: f64,
    /// ln(var / mean) of expm1(x)
    pub dispersion: f64,
    /// dispersion z-scored within its mean bin
    pub scaled_dispersion: f64,
}

fn mean_and_dispersion(values: impl Iterator<Item = f64>, n: usize) -> (f64, f64) {
    let (mut sum, mut sum_sq) = (0.0, 0.0);
    for v in values {
        let e = v.exp_m1();
        sum += e;
        sum_sq += e * e;
    }
    let n = n as f64;
    let mean = sum / n;
    let var = if n > 1.0 {
        ((sum_sq - n * mean * mean) / (n - 1.0)).max(0.0)
    } else {
        0.0
    };
    let dispersion = if mean > 0.0 { (var / mean).ln() } else { 0.0 };
    let dispersion = if dispersion.is_finite() { dispersion } else { 0.0 };
    (mean.ln_1p(), dispersion)
}

/// Mean, dispersion and binned dispersion z-score of every gene, in matrix order.
pub fn gene_dispersions(normalized: &NormalizedMatrix, n_bins: usize) -> Vec<GeneDispersion> {
    let n_cells = normalized.n_cells();
    let raw = normalized
        .matrix
        .outer_iterator()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|row| mean_and_dispersion(row.iter().map(|(_, &v)| v), n_cells))
        .collect::<Vec<_>>();

    let lo = raw.iter().map(|r| r.0).fold(f64::INFINITY, f64::min);
    let hi = raw.iter().map(|r| r.0).fold(f64::NEG_INFINITY, f64::max);
    let width = (hi - lo) / n_bins as f64;
    let bin_of = |m: f64| {
        if width > 0.0 {
            (((m - lo) / width) as usize).min(n_bins - 1)
        } else {
            0
        }
    };

    let mut bins = vec![Vec::new(); n_bins.max(1)];
    for (g, r) in raw.iter().enumerate() {
        bins[bin_of(r.0)].push(g);
    }

    let mut z = vec![0.0; raw.len()];
    let mut degenerate = 0;
    for members in bins.iter().filter(|b| !b.is_empty()) {
        let n = members.len() as f64;
        let mean = members.iter().map(|&g| raw[g].1).sum::<f64>() / n;
        let sd = if members.len() > 1 {
            (members.iter().map(|&g| (raw[g].1 - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        if sd > 0.0 {
            for &g in members {
                z[g] = (raw[g].1 - mean) / sd;
            }
        } else {
            degenerate += 1;
        }
    }
    if degenerate > 0 {
        warn!("{degenerate} dispersion bins had a single gene or no spread; their genes score 0");
    }

    raw.iter()
        .zip(z)
        .zip(&normalized.genes)
        .map(|((&(mean, dispersion), scaled_dispersion), gene)| GeneDispersion {
            gene: gene.clone(),
            mean,
            dispersion,
            scaled_dispersion,
        })
        .collect()
}

/// Rank genes by scaled dispersion, descending, ties by name, and apply the selection.
pub fn select_variable_genes(stats: &[GeneDispersion], selection: &Selection) -> Vec<String> {
    let mut ranked = stats.iter().collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        b.scaled_dispersion
            .total_cmp(&a.scaled_dispersion)
            .then_with(|| a.gene.cmp(&b.gene))
    });
    match *selection {
        Selection::Cutoffs {
            mean_low,
            mean_high,
            dispersion_low,
        } => ranked
            .into_iter()
            .filter(|s| s.mean > mean_low && s.mean < mean_high && s.scaled_dispersion > dispersion_low)
            .map(|s| s.gene.clone())
            .collect(),
        Selection::TopN(n) => ranked.into_iter().take(n).map(|s| s.gene.clone()).collect(),
    }
}

/// Select the highly variable genes of `dataset` and record them.
pub fn find_variable_genes(mut dataset: Dataset, params: &VariableFeatureParams) -> Result<Dataset, Error> {
    params.validate()?;
    let normalized = dataset.require_normalized(Stage::VariableFeatures)?;
    let stats = gene_dispersions(normalized, params.n_bins);
    let genes = select_variable_genes(&stats, &params.selection);
    if genes.is_empty() {
        return Err(PipelineError::exhausted("variable gene selection", Axis::Genes).into());
    }
    info!(
        "{}: {} of {} genes are highly variable",
        dataset.label,
        genes.len(),
        stats.len()
    );
    dataset.variable_genes = Some(genes);
    dataset.stages.mark(Stage::VariableFeatures);
    Ok(dataset)
}

/// Sorted union of two gene lists
pub fn union_variable_genes(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().chain(b).sorted().dedup().cloned().collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::normalization::log_normalize;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use rand_pcg::Pcg64Mcg;
    use scalign_types::matrix::csr_from_rows;
    use scalign_types::CountMatrix;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// 60 Poisson genes plus 3 bursty genes that are zero in most cells
    fn dataset() -> Dataset {
        let n_cells = 80;
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let mut genes = Vec::new();
        let mut rows = Vec::new();
        for g in 0..60 {
            let lambda = 1.0 + (g % 6) as f64;
            let pois = Poisson::new(lambda).unwrap();
            genes.push(format!("flat{g:02}"));
            rows.push(
                (0..n_cells)
                    .map(|c| (c, pois.sample(&mut rng) as u32))
                    .filter(|&(_, v)| v > 0)
                    .collect(),
            );
        }
        for g in 0..3 {
            genes.push(format!("burst{g}"));
            rows.push((0..n_cells).filter(|c| c % 10 == g).map(|c| (c, 60)).collect());
        }
        let counts = CountMatrix::new(genes, (0..n_cells).map(|c| format!("c{c}")).collect(), csr_from_rows(rows, n_cells))
            .unwrap();
        log_normalize(Dataset::new("d", counts), 1e4).unwrap()
    }

    #[test]
    fn test_mean_and_dispersion() {
        // expm1 values 1, 3 -> mean 2, var 2
        let (m, d) = mean_and_dispersion([2f64.ln(), 4f64.ln()].into_iter(), 2);
        assert!((m - 3f64.ln()).abs() < 1e-12);
        assert!((d - 0.0).abs() < 1e-12);
        assert_eq!(mean_and_dispersion(std::iter::empty(), 5), (0.0, 0.0));
    }

    #[test]
    fn test_bursty_genes_rank_first() {
        let d = find_variable_genes(
            dataset(),
            &VariableFeatureParams {
                n_bins: 1,
                selection: Selection::TopN(3),
            },
        )
        .unwrap();
        let mut top = d.variable_genes.clone().unwrap();
        top.sort();
        assert_eq!(top, names(&["burst0", "burst1", "burst2"]));
        assert!(d.stages.has_run(Stage::VariableFeatures));
    }

    #[test]
    fn test_selection_is_stable() {
        let params = VariableFeatureParams {
            n_bins: 1,
            selection: Selection::Cutoffs {
                mean_low: 0.0125,
                mean_high: 10.0,
                dispersion_low: 0.5,
            },
        };
        let a = find_variable_genes(dataset(), &params).unwrap();
        let b = find_variable_genes(a.clone(), &params).unwrap();
        assert_eq!(a.variable_genes, b.variable_genes);
    }

    #[test]
    fn test_requires_normalization() {
        let raw = Dataset {
            normalized: None,
            stages: Default::default(),
            ..dataset()
        };
        let err = find_variable_genes(raw, &VariableFeatureParams::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Ordering { .. })
        ));
    }

    #[test]
    fn test_union() {
        let a = names(&["b", "a"]);
        let b = names(&["c", "a"]);
        assert_eq!(union_variable_genes(&a, &b), names(&["a", "b", "c"]));
        assert_eq!(union_variable_genes(&a, &b), union_variable_genes(&b, &a));
        let u = union_variable_genes(&a, &b);
        assert_eq!(union_variable_genes(&u, &u), u);
    }
}
