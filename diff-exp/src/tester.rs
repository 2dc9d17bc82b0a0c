use anyhow::Error;
use scalign_types::PipelineError;
use sprs::CsMat;

/// Which side of a comparison a cell belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    A,
    B,
    Neither,
}

/// Two groups of cells over a shared genes × cells matrix pair.
pub struct Comparison<'a> {
    /// raw UMI counts, CSR with genes as rows
    pub counts: &'a CsMat<u32>,
    /// log-normalized values with the same shape as `counts`
    pub normalized: &'a CsMat<f64>,
    pub group_a: &'a [usize],
    pub group_b: &'a [usize],
    side: Vec<Side>,
}

impl<'a> Comparison<'a> {
    pub fn new(
        counts: &'a CsMat<u32>,
        normalized: &'a CsMat<f64>,
        group_a: &'a [usize],
        group_b: &'a [usize],
    ) -> Result<Comparison<'a>, Error> {
        if counts.shape() != normalized.shape() {
            return Err(PipelineError::invalid("count and normalized matrices differ in shape").into());
        }
        if group_a.is_empty() || group_b.is_empty() {
            return Err(PipelineError::invalid("both comparison groups need at least one cell").into());
        }
        if let Some(&c) = group_a.iter().chain(group_b).find(|&&c| c >= counts.cols()) {
            return Err(PipelineError::invalid(format!("cell index {c} out of range")).into());
        }
        let mut side = vec![Side::Neither; counts.cols()];
        for &c in group_a {
            side[c] = Side::A;
        }
        for &c in group_b {
            if side[c] == Side::A {
                return Err(PipelineError::invalid(format!("cell {c} is in both comparison groups")).into());
            }
            side[c] = Side::B;
        }
        Ok(Comparison {
            counts,
            normalized,
            group_a,
            group_b,
            side,
        })
    }

    pub fn side(&self, cell: usize) -> Side {
        self.side[cell]
    }

    /// Non-zero raw counts of `gene`, tagged by side. Cells outside both groups are skipped.
    pub fn count_entries(&self, gene: usize) -> Vec<(Side, u32)> {
        match self.counts.outer_view(gene) {
            Some(row) => row
                .iter()
                .map(|(c, &v)| (self.side[c], v))
                .filter(|(s, _)| *s != Side::Neither)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Non-zero normalized values of `gene`, tagged by side. Cells outside both groups are skipped.
    pub fn normalized_entries(&self, gene: usize) -> Vec<(Side, f64)> {
        match self.normalized.outer_view(gene) {
            Some(row) => row
                .iter()
                .map(|(c, &v)| (self.side[c], v))
                .filter(|(s, _)| *s != Side::Neither)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A statistical test producing one p-value per gene for a two-group comparison.
/// Implementations must be safe to call from several threads; each gene is independent.
pub trait DifferentialTester: Sync {
    /// Short name recorded on marker tables
    fn name(&self) -> &str;

    /// p-values for `genes` (row indices), in the same order
    fn p_values(&self, cmp: &Comparison<'_>, genes: &[usize]) -> Result<Vec<f64>, Error>;
}
