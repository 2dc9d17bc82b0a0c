use anyhow::{bail, Error};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::collections::{HashMap, HashSet};

/// A genes × cells matrix with named rows and columns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenericGeneCellMatrix<M> {
    pub genes: Vec<String>,
    pub cells: Vec<String>,
    pub matrix: M,
}

/// Raw UMI counts, CSR with genes as rows.
pub type CountMatrix = GenericGeneCellMatrix<CsMat<u32>>;
/// Log-normalized values, same sparsity as the counts they came from.
pub type NormalizedMatrix = GenericGeneCellMatrix<CsMat<f64>>;
/// Dense z-scored values restricted to a gene subset.
pub type ScaledMatrix = GenericGeneCellMatrix<Array2<f64>>;

fn check_unique(names: &[String], what: &str) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(names.len());
    for n in names {
        if !seen.insert(n.as_str()) {
            bail!("duplicate {} name: {}", what, n);
        }
    }
    Ok(())
}

impl<M> GenericGeneCellMatrix<M> {
    /// Map from gene name to row index
    pub fn gene_index(&self) -> HashMap<&str, usize> {
        self.genes.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect()
    }

    /// Map from cell id to column index
    pub fn cell_index(&self) -> HashMap<&str, usize> {
        self.cells.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect()
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }
}

/// Assemble a CSR matrix from per-row `(column, value)` lists. Each row must be sorted by column.
pub fn csr_from_rows<N: Clone>(rows: Vec<Vec<(usize, N)>>, ncols: usize) -> CsMat<N> {
    let nrows = rows.len();
    let nnz = rows.iter().map(Vec::len).sum();
    let mut indptr = Vec::with_capacity(nrows + 1);
    let mut indices = Vec::with_capacity(nnz);
    let mut data = Vec::with_capacity(nnz);
    indptr.push(0);
    for row in rows {
        for (c, v) in row {
            indices.push(c);
            data.push(v);
        }
        indptr.push(indices.len());
    }
    CsMat::new((nrows, ncols), indptr, indices, data)
}

impl<N> GenericGeneCellMatrix<CsMat<N>>
where
    N: Copy + Default + PartialEq + Into<f64>,
{
    /// Build a matrix, checking the shape against the names and that names are unique.
    pub fn new(genes: Vec<String>, cells: Vec<String>, matrix: CsMat<N>) -> Result<Self, Error> {
        if !matrix.is_csr() {
            bail!("gene × cell matrices must be stored as CSR");
        }
        if matrix.rows() != genes.len() || matrix.cols() != cells.len() {
            bail!(
                "matrix shape {:?} does not match {} genes × {} cells",
                matrix.shape(),
                genes.len(),
                cells.len()
            );
        }
        check_unique(&genes, "gene")?;
        check_unique(&cells, "cell")?;
        Ok(GenericGeneCellMatrix { genes, cells, matrix })
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Sum of each column (per-cell total)
    pub fn col_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.n_cells()];
        for row in self.matrix.outer_iterator() {
            for (c, &v) in row.iter() {
                sums[c] += v.into();
            }
        }
        sums
    }

    /// Number of non-zero entries in each column (genes detected per cell)
    pub fn col_nnz(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_cells()];
        for row in self.matrix.outer_iterator() {
            for (c, &v) in row.iter() {
                if v != N::default() {
                    counts[c] += 1;
                }
            }
        }
        counts
    }

    /// Number of non-zero entries in each row (cells in which a gene is detected)
    pub fn row_nnz(&self) -> Vec<usize> {
        self.matrix
            .outer_iterator()
            .map(|row| row.iter().filter(|(_, &v)| v != N::default()).count())
            .collect()
    }

    /// Dense copy of one gene's values across all cells
    pub fn row_dense(&self, row: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.n_cells()];
        if let Some(r) = self.matrix.outer_view(row) {
            for (c, &v) in r.iter() {
                out[c] = v.into();
            }
        }
        out
    }

    /// Select a subset of genes and cells, in the order given.
    pub fn select(&self, genes: &[usize], cells: &[usize]) -> Self {
        let mut remap = vec![None; self.n_cells()];
        for (new, &old) in cells.iter().enumerate() {
            remap[old] = Some(new);
        }
        let rows = genes
            .iter()
            .map(|&g| {
                let mut row = self
                    .matrix
                    .outer_view(g)
                    .map(|r| {
                        r.iter()
                            .filter_map(|(c, &v)| remap[c].map(|nc| (nc, v)))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                row.sort_unstable_by_key(|&(c, _)| c);
                row
            })
            .collect();
        GenericGeneCellMatrix {
            genes: genes.iter().map(|&g| self.genes[g].clone()).collect(),
            cells: cells.iter().map(|&c| self.cells[c].clone()).collect(),
            matrix: csr_from_rows(rows, cells.len()),
        }
    }

    pub fn select_cells(&self, cells: &[usize]) -> Self {
        let genes = (0..self.n_genes()).collect::<Vec<_>>();
        self.select(&genes, cells)
    }

    pub fn select_genes(&self, genes: &[usize]) -> Self {
        let cells = (0..self.n_cells()).collect::<Vec<_>>();
        self.select(genes, &cells)
    }

    /// Select genes by name, in the order given. Fails if any name is absent.
    pub fn select_gene_names(&self, names: &[String]) -> Result<Self, Error> {
        let index = self.gene_index();
        let mut rows = Vec::with_capacity(names.len());
        for n in names {
            match index.get(n.as_str()) {
                Some(&i) => rows.push(i),
                None => bail!("gene {} not present in matrix", n),
            }
        }
        Ok(self.select_genes(&rows))
    }

    /// Concatenate the cell axis of two matrices over identical genes.
    pub fn hstack(&self, other: &Self) -> Result<Self, Error> {
        if self.genes != other.genes {
            bail!("cannot concatenate cells of matrices with different genes");
        }
        let offset = self.n_cells();
        let rows = self
            .matrix
            .outer_iterator()
            .zip(other.matrix.outer_iterator())
            .map(|(a, b)| {
                a.iter()
                    .map(|(c, &v)| (c, v))
                    .chain(b.iter().map(|(c, &v)| (c + offset, v)))
                    .collect::<Vec<_>>()
            })
            .collect();
        let mut cells = self.cells.clone();
        cells.extend(other.cells.iter().cloned());
        GenericGeneCellMatrix::new(self.genes.clone(), cells, csr_from_rows(rows, offset + other.n_cells()))
    }
}

impl ScaledMatrix {
    pub fn new_dense(genes: Vec<String>, cells: Vec<String>, matrix: Array2<f64>) -> Result<Self, Error> {
        if matrix.dim() != (genes.len(), cells.len()) {
            bail!(
                "scaled matrix shape {:?} does not match {} genes × {} cells",
                matrix.dim(),
                genes.len(),
                cells.len()
            );
        }
        check_unique(&genes, "gene")?;
        check_unique(&cells, "cell")?;
        Ok(GenericGeneCellMatrix { genes, cells, matrix })
    }

    pub fn select_cells(&self, cells: &[usize]) -> Self {
        GenericGeneCellMatrix {
            genes: self.genes.clone(),
            cells: cells.iter().map(|&c| self.cells[c].clone()).collect(),
            matrix: self.matrix.select(Axis(1), cells),
        }
    }

    /// Select genes by name, in the order given. Fails if any name is absent.
    pub fn select_gene_names(&self, names: &[String]) -> Result<Self, Error> {
        let index = self.gene_index();
        let mut rows = Vec::with_capacity(names.len());
        for n in names {
            match index.get(n.as_str()) {
                Some(&i) => rows.push(i),
                None => bail!("gene {} not present in scaled data", n),
            }
        }
        Ok(GenericGeneCellMatrix {
            genes: names.to_vec(),
            cells: self.cells.clone(),
            matrix: self.matrix.select(Axis(0), &rows),
        })
    }

    /// Concatenate the cell axis of two scaled matrices over identical genes.
    pub fn hstack(&self, other: &Self) -> Result<Self, Error> {
        if self.genes != other.genes {
            bail!("cannot concatenate cells of scaled matrices with different genes");
        }
        let matrix = ndarray::concatenate(Axis(1), &[self.matrix.view(), other.matrix.view()])?;
        let mut cells = self.cells.clone();
        cells.extend(other.cells.iter().cloned());
        ScaledMatrix::new_dense(self.genes.clone(), cells, matrix)
    }
}
