use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Names of the built-in per-cell QC columns.
pub const N_UMI: &str = "nUMI";
pub const N_GENE: &str = "nGene";
pub const PERCENT_MITO: &str = "percent.mito";

/// Per-cell annotations, stored column-wise and kept in the same order as the matrix columns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellMetadata {
    pub cell_ids: Vec<String>,
    /// originating dataset of each cell
    pub library: Vec<String>,
    pub n_umi: Vec<f64>,
    pub n_gene: Vec<f64>,
    pub percent_mito: Vec<f64>,
    pub cluster: Option<Vec<u32>>,
    pub phase: Option<Vec<String>>,
    /// any further numeric columns (module scores, variance ratios, ...)
    pub numeric: BTreeMap<String, Vec<f64>>,
}

impl CellMetadata {
    /// Fresh metadata for `cell_ids`, all tagged with `library`. QC columns start at zero.
    pub fn new(cell_ids: Vec<String>, library: &str) -> CellMetadata {
        let n = cell_ids.len();
        CellMetadata {
            cell_ids,
            library: vec![library.to_string(); n],
            n_umi: vec![0.0; n],
            n_gene: vec![0.0; n],
            percent_mito: vec![0.0; n],
            cluster: None,
            phase: None,
            numeric: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }

    /// Look up a numeric column by name, including the built-in QC columns.
    pub fn numeric_column(&self, name: &str) -> Option<&[f64]> {
        match name {
            N_UMI => Some(&self.n_umi),
            N_GENE => Some(&self.n_gene),
            PERCENT_MITO => Some(&self.percent_mito),
            _ => self.numeric.get(name).map(Vec::as_slice),
        }
    }

    /// Add or replace an extra numeric column.
    pub fn insert_numeric(&mut self, name: &str, values: Vec<f64>) -> Result<(), Error> {
        if values.len() != self.len() {
            bail!("column {} has {} values for {} cells", name, values.len(), self.len());
        }
        if matches!(name, N_UMI | N_GENE | PERCENT_MITO) {
            bail!("column {} is reserved", name);
        }
        self.numeric.insert(name.to_string(), values);
        Ok(())
    }

    pub fn set_clusters(&mut self, labels: Vec<u32>) -> Result<(), Error> {
        if labels.len() != self.len() {
            bail!("{} cluster labels for {} cells", labels.len(), self.len());
        }
        self.cluster = Some(labels);
        Ok(())
    }

    pub fn set_phase(&mut self, phase: Vec<String>) -> Result<(), Error> {
        if phase.len() != self.len() {
            bail!("{} phase labels for {} cells", phase.len(), self.len());
        }
        self.phase = Some(phase);
        Ok(())
    }

    /// Keep the rows at `idx`, in that order.
    pub fn subset(&self, idx: &[usize]) -> CellMetadata {
        fn pick<T: Clone>(v: &[T], idx: &[usize]) -> Vec<T> {
            idx.iter().map(|&i| v[i].clone()).collect()
        }
        CellMetadata {
            cell_ids: pick(&self.cell_ids, idx),
            library: pick(&self.library, idx),
            n_umi: pick(&self.n_umi, idx),
            n_gene: pick(&self.n_gene, idx),
            percent_mito: pick(&self.percent_mito, idx),
            cluster: self.cluster.as_ref().map(|c| pick(c, idx)),
            phase: self.phase.as_ref().map(|p| pick(p, idx)),
            numeric: self.numeric.iter().map(|(k, v)| (k.clone(), pick(v, idx))).collect(),
        }
    }

    /// Stack the rows of `other` below `self`. Optional and extra columns survive only when
    /// both sides carry them.
    pub fn concat(&self, other: &CellMetadata) -> CellMetadata {
        fn join<T: Clone>(a: &[T], b: &[T]) -> Vec<T> {
            a.iter().chain(b.iter()).cloned().collect()
        }
        let numeric = self
            .numeric
            .iter()
            .filter_map(|(k, v)| other.numeric.get(k).map(|w| (k.clone(), join(v, w))))
            .collect();
        CellMetadata {
            cell_ids: join(&self.cell_ids, &other.cell_ids),
            library: join(&self.library, &other.library),
            n_umi: join(&self.n_umi, &other.n_umi),
            n_gene: join(&self.n_gene, &other.n_gene),
            percent_mito: join(&self.percent_mito, &other.percent_mito),
            cluster: None,
            phase: match (&self.phase, &other.phase) {
                (Some(a), Some(b)) => Some(join(a, b)),
                _ => None,
            },
            numeric,
        }
    }

    /// Check that the metadata describes exactly `cells`, in order.
    pub fn check_cells(&self, cells: &[String]) -> Result<(), Error> {
        if self.cell_ids != cells {
            bail!(
                "metadata ({} cells) is out of sync with the matrix ({} cells)",
                self.len(),
                cells.len()
            );
        }
        Ok(())
    }

    /// Indices of cells belonging to `library`
    pub fn library_indices(&self, library: &str) -> Vec<usize> {
        self.library
            .iter()
            .enumerate()
            .filter(|(_, l)| l.as_str() == library)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta(ids: &[&str], lib: &str) -> CellMetadata {
        CellMetadata::new(ids.iter().map(|s| s.to_string()).collect(), lib)
    }

    #[test]
    fn test_subset_keeps_columns_aligned() {
        let mut m = meta(&["a", "b", "c"], "x");
        m.n_umi = vec![1.0, 2.0, 3.0];
        m.insert_numeric("score", vec![0.1, 0.2, 0.3]).unwrap();
        m.set_clusters(vec![0, 1, 0]).unwrap();
        let s = m.subset(&[2, 0]);
        assert_eq!(s.cell_ids, vec!["c", "a"]);
        assert_eq!(s.n_umi, vec![3.0, 1.0]);
        assert_eq!(s.numeric_column("score").unwrap(), &[0.3, 0.1]);
        assert_eq!(s.cluster, Some(vec![0, 0]));
    }

    #[test]
    fn test_concat_drops_one_sided_columns() {
        let mut a = meta(&["a"], "x");
        a.insert_numeric("only_a", vec![1.0]).unwrap();
        a.insert_numeric("both", vec![1.0]).unwrap();
        let mut b = meta(&["b"], "y");
        b.insert_numeric("both", vec![2.0]).unwrap();
        let m = a.concat(&b);
        assert_eq!(m.library, vec!["x", "y"]);
        assert_eq!(m.numeric_column("both").unwrap(), &[1.0, 2.0]);
        assert!(m.numeric_column("only_a").is_none());
        assert_eq!(m.library_indices("y"), vec![1]);
    }

    #[test]
    fn test_reserved_and_length_checks() {
        let mut m = meta(&["a", "b"], "x");
        assert!(m.insert_numeric(N_UMI, vec![1.0, 2.0]).is_err());
        assert!(m.insert_numeric("s", vec![1.0]).is_err());
        assert!(m.set_clusters(vec![0]).is_err());
    }
}
