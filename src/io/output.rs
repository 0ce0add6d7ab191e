use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::PipelineResult;
use crate::models::{RawSheet, Table};

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Write a sheet as canonical comma-separated UTF-8, without a header row
pub fn write_sheet(sheet: &RawSheet, path: &Path) -> PipelineResult<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in &sheet.rows {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a table as CSV with a header row of its column names
pub fn write_table(table: &Table, path: &Path) -> Result<()> {
    ensure_parent(path).with_context(|| format!("Failed to create directory for {:?}", path))?;
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create file: {:?}", path))?;

    writer
        .write_record(table.column_names())
        .context("Failed to write CSV header")?;
    for row in &table.rows {
        writer
            .write_record(row.iter().map(|value| value.to_string()))
            .with_context(|| format!("Failed to write row to {:?}", path))?;
    }
    writer.flush().context("Failed to flush CSV")?;
    Ok(())
}

/// Write any serializable value as pretty-printed JSON
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    ensure_parent(path).with_context(|| format!("Failed to create directory for {:?}", path))?;
    let file = File::create(path).with_context(|| format!("Failed to create file: {:?}", path))?;
    serde_json::to_writer_pretty(file, value).context("Failed to write JSON")?;
    Ok(())
}
