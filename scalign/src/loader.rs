use anyhow::{Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::info;
use scalign_types::matrix::csr_from_rows;
use scalign_types::{CountMatrix, Dataset, PipelineError};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Open `path`, transparently decompressing it when it starts with the gzip magic bytes.
pub fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>, Error> {
    let file = File::open(path).with_context(|| path.display().to_string())?;
    let mut reader = BufReader::new(file);
    let is_gz = reader
        .fill_buf()
        .with_context(|| path.display().to_string())?
        .starts_with(&GZIP_MAGIC);
    if is_gz {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn parse_count(field: &str) -> Option<u32> {
    let v = field.trim().parse::<f64>().ok()?;
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 {
        Some(v as u32)
    } else {
        None
    }
}

/// Read a tab-separated gene × cell count table. The first record holds the cell ids, with
/// or without a leading corner field; every later record is a gene name followed by one
/// count per cell. `context` names the source in error messages.
pub fn read_count_table<R: Read>(reader: R, context: &str) -> Result<CountMatrix, Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(reader);

    let mut records = rdr.records();
    let header = match records.next() {
        Some(r) => r.with_context(|| context.to_string())?,
        None => return Err(PipelineError::format(context, "table is empty").into()),
    };
    let header = header.iter().map(str::to_string).collect::<Vec<_>>();

    let mut cells: Option<Vec<String>> = None;
    let mut genes = Vec::new();
    let mut rows = Vec::new();

    for record in records {
        let record = record.with_context(|| context.to_string())?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let n_values = record.len().saturating_sub(1);

        // the first gene row tells us whether the header carries a corner field
        if cells.is_none() {
            let ids = if header.len() == n_values {
                header.clone()
            } else if header.len() == n_values + 1 {
                header[1..].to_vec()
            } else {
                return Err(PipelineError::format(
                    context,
                    format!(
                        "line {line}: {n_values} values but the header names {} cells",
                        header.len()
                    ),
                )
                .into());
            };
            cells = Some(ids);
        }
        let n_cells = cells.as_ref().map_or(0, Vec::len);

        if n_values != n_cells {
            return Err(PipelineError::format(
                context,
                format!("line {line}: expected {n_cells} values, found {n_values}"),
            )
            .into());
        }

        let mut fields = record.iter();
        let gene = fields.next().unwrap_or_default().to_string();
        let mut row = Vec::new();
        for (c, field) in fields.enumerate() {
            match parse_count(field) {
                Some(0) => {}
                Some(v) => row.push((c, v)),
                None => {
                    return Err(PipelineError::format(
                        context,
                        format!("line {line}: {field:?} for gene {gene} is not a non-negative integer count"),
                    )
                    .into())
                }
            }
        }
        genes.push(gene);
        rows.push(row);
    }

    let cells = match cells {
        Some(c) if !c.is_empty() => c,
        _ => return Err(PipelineError::format(context, "table has no cells or no gene rows").into()),
    };
    let n_cells = cells.len();
    CountMatrix::new(genes, cells, csr_from_rows(rows, n_cells))
        .map_err(|e| PipelineError::format(context, e.to_string()).into())
}

/// Load a (usually gzip-compressed) count table from `path`.
pub fn load_count_table(path: impl AsRef<Path>) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let matrix = read_count_table(open_maybe_gz(path)?, &path.display().to_string())?;
    info!(
        "loaded {}: {} genes x {} cells, {} non-zero entries",
        path.display(),
        matrix.n_genes(),
        matrix.n_cells(),
        matrix.nnz()
    );
    Ok(matrix)
}

/// Load a count table as a fresh `Dataset` tagged with `label`.
pub fn load_dataset(path: impl AsRef<Path>, label: &str) -> Result<Dataset, Error> {
    Ok(Dataset::new(label, load_count_table(path)?))
}
