//! Save and restore a `MergedObject` between runs.
//!
//! A snapshot is a gzip stream holding an 8-byte magic string, a little-endian format version
//! and the bincode-encoded object.

use anyhow::{Context, Error};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use scalign_types::{MergedObject, PipelineError};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"SCALIGN\0";
const VERSION: u32 = 1;

/// Write `merged` to `path`, replacing any existing file.
pub fn save_snapshot(merged: &MergedObject, path: &Path) -> Result<(), Error> {
    let file = File::create(path).with_context(|| format!("creating snapshot {}", path.display()))?;
    let mut writer = GzEncoder::new(BufWriter::new(file), Compression::default());
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    bincode::serialize_into(&mut writer, merged)?;
    writer.finish()?.flush()?;
    info!("saved {} cells to {}", merged.n_cells(), path.display());
    Ok(())
}

/// Read a snapshot written by `save_snapshot`. Anything else is a format error.
pub fn load_snapshot(path: &Path) -> Result<MergedObject, Error> {
    let context = path.display().to_string();
    let file = File::open(path).with_context(|| format!("opening snapshot {context}"))?;
    let mut bytes = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut bytes)
        .map_err(|e| PipelineError::format(&context, format!("not a gzip stream: {e}")))?;

    let header_len = MAGIC.len() + 4;
    if bytes.len() < header_len || &bytes[..MAGIC.len()] != MAGIC {
        return Err(PipelineError::format(&context, "missing snapshot header").into());
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[MAGIC.len()..header_len]);
    let version = u32::from_le_bytes(version);
    if version != VERSION {
        return Err(PipelineError::format(
            &context,
            format!("snapshot version {version}, expected {VERSION}"),
        )
        .into());
    }

    let merged: MergedObject = bincode::deserialize(&bytes[header_len..])
        .map_err(|e| PipelineError::format(&context, format!("corrupt snapshot: {e}")))?;
    merged
        .check()
        .map_err(|e| PipelineError::format(&context, e.to_string()))?;
    Ok(merged)
}
