use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One gene's result in a two-group comparison
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerRow {
    pub gene: String,
    /// natural-log fold change of mean expression, group 1 over group 2
    pub avg_log_fc: f64,
    pub p_val: f64,
    pub p_val_adj: f64,
    /// fraction of group 1 cells with a non-zero count
    pub pct_1: f64,
    /// fraction of group 2 cells with a non-zero count
    pub pct_2: f64,
}

/// Ordering applied to a marker table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerSort {
    /// p-value ascending, ties by log fold change descending
    #[default]
    PValue,
    /// |log fold change| descending
    AbsLogFoldChange,
    /// log fold change descending
    LogFoldChange,
}

fn by_key(key: MarkerSort) -> impl Fn(&MarkerRow, &MarkerRow) -> Ordering {
    move |a, b| {
        let primary = match key {
            MarkerSort::PValue => a.p_val.total_cmp(&b.p_val).then(b.avg_log_fc.total_cmp(&a.avg_log_fc)),
            MarkerSort::AbsLogFoldChange => b.avg_log_fc.abs().total_cmp(&a.avg_log_fc.abs()),
            MarkerSort::LogFoldChange => b.avg_log_fc.total_cmp(&a.avg_log_fc),
        };
        primary.then_with(|| a.gene.cmp(&b.gene))
    }
}

/// Result of a differential expression comparison between two groups of cells.
/// Never mutated after creation; re-sorting yields a new table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerTable {
    ident_1: String,
    ident_2: String,
    test: String,
    sort: MarkerSort,
    rows: Vec<MarkerRow>,
}

impl MarkerTable {
    pub fn new(ident_1: &str, ident_2: &str, test: &str, mut rows: Vec<MarkerRow>, sort: MarkerSort) -> MarkerTable {
        rows.sort_by(by_key(sort));
        MarkerTable {
            ident_1: ident_1.to_string(),
            ident_2: ident_2.to_string(),
            test: test.to_string(),
            sort,
            rows,
        }
    }

    pub fn ident_1(&self) -> &str {
        &self.ident_1
    }

    pub fn ident_2(&self) -> &str {
        &self.ident_2
    }

    /// Name of the statistical test that produced the p-values
    pub fn test(&self) -> &str {
        &self.test
    }

    pub fn sort(&self) -> MarkerSort {
        self.sort
    }

    pub fn rows(&self) -> &[MarkerRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// A copy of this table in a different order.
    pub fn sorted_by(&self, sort: MarkerSort) -> MarkerTable {
        MarkerTable::new(&self.ident_1, &self.ident_2, &self.test, self.rows.clone(), sort)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(gene: &str, fc: f64, p: f64) -> MarkerRow {
        MarkerRow {
            gene: gene.to_string(),
            avg_log_fc: fc,
            p_val: p,
            p_val_adj: p,
            pct_1: 0.5,
            pct_2: 0.5,
        }
    }

    #[test]
    fn test_sorting() {
        let rows = vec![row("a", 0.3, 0.01), row("b", -2.0, 0.5), row("c", 1.0, 0.01)];
        let t = MarkerTable::new("0", "1", "wilcox", rows, MarkerSort::PValue);
        let genes = |t: &MarkerTable| t.rows().iter().map(|r| r.gene.clone()).collect::<Vec<_>>();
        assert_eq!(genes(&t), vec!["c", "a", "b"]);
        assert_eq!(genes(&t.sorted_by(MarkerSort::AbsLogFoldChange)), vec!["b", "c", "a"]);
        assert_eq!(genes(&t.sorted_by(MarkerSort::LogFoldChange)), vec!["c", "a", "b"]);
    }
}
