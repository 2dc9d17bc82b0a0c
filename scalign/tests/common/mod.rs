#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use rand_pcg::Pcg64Mcg;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Dense gene × cell counts with names, written out as a count table by `write_table`.
pub struct Table {
    pub genes: Vec<String>,
    pub cells: Vec<String>,
    pub counts: Vec<Vec<u32>>,
}

impl Table {
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn to_tsv(&self) -> String {
        let mut text = String::from("gene");
        for c in &self.cells {
            text.push('\t');
            text.push_str(c);
        }
        text.push('\n');
        for (g, row) in self.genes.iter().zip(&self.counts) {
            text.push_str(g);
            for v in row {
                text.push('\t');
                text.push_str(&v.to_string());
            }
            text.push('\n');
        }
        text
    }
}

/// Write `table` gzip-compressed into `dir`.
pub fn write_table(dir: &Path, name: &str, table: &Table) -> PathBuf {
    let path = dir.join(name);
    let mut gz = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
    gz.write_all(table.to_tsv().as_bytes()).unwrap();
    gz.finish().unwrap();
    path
}

/// Two planted cell types alternating over the cells (marker genes 0-9 and 10-19). With
/// `shift`, genes 20-29 are raised in every cell, mimicking a platform effect.
pub fn synthetic_library(n_genes: usize, n_cells: usize, shift: bool, seed: u64) -> Table {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut counts = vec![vec![0u32; n_cells]; n_genes];
    for c in 0..n_cells {
        let kind = c % 2;
        for (g, row) in counts.iter_mut().enumerate() {
            let mut lambda = 2.0;
            if g < 20 && g / 10 == kind {
                lambda = 12.0;
            }
            if shift && (20..30).contains(&g) {
                lambda = 6.0;
            }
            row[c] = Poisson::new(lambda).unwrap().sample(&mut rng) as u32;
        }
    }
    Table {
        genes: (0..n_genes).map(|g| format!("GENE{g:03}")).collect(),
        cells: (0..n_cells).map(|c| format!("BC{c:04}-1")).collect(),
        counts,
    }
}
