use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Category, Cell, Column, FieldType, RawSheet, Table, Value};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SNIFF_CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];
const SNIFF_LINES: usize = 20;

/// A reader turning one source file into a [`RawSheet`]
pub trait SheetReader {
    /// Lower-case file extensions this reader accepts, without the dot
    fn extensions(&self) -> &'static [&'static str];

    fn read(&self, path: &Path) -> PipelineResult<RawSheet>;
}

/// Reader for comma, tab, semicolon and pipe separated text exports
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedReader;

static DELIMITED: DelimitedReader = DelimitedReader;

impl DelimitedReader {
    /// Delimiter implied by the extension; `None` means sniff the content
    fn delimiter_for(extension: &str) -> Option<u8> {
        match extension {
            "csv" => Some(b','),
            "tsv" | "tab" => Some(b'\t'),
            "psv" => Some(b'|'),
            _ => None,
        }
    }

    /// Parse already-decoded text into a sheet
    pub fn parse(origin: &str, text: &str, delimiter: u8) -> PipelineResult<RawSheet> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(text.as_bytes());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(Cell::from_raw).collect());
        }
        Ok(RawSheet::new(origin, rows))
    }
}

impl SheetReader for DelimitedReader {
    fn extensions(&self) -> &'static [&'static str] {
        &["csv", "tsv", "tab", "psv", "txt"]
    }

    fn read(&self, path: &Path) -> PipelineResult<RawSheet> {
        let bytes = fs::read(path)?;
        let text = decode(&bytes);
        let delimiter = extension_of(path)
            .as_deref()
            .and_then(Self::delimiter_for)
            .unwrap_or_else(|| sniff_delimiter(&text));
        debug!(
            "Reading {:?} with delimiter {:?}",
            path,
            char::from(delimiter)
        );
        Self::parse(&path.display().to_string(), &text, delimiter)
    }
}

/// Strip a UTF-8 byte order mark and decode, replacing invalid sequences
pub fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Pick the candidate delimiter that occurs most often in the first lines
///
/// Ties go to the earlier candidate, so plain text defaults to a comma.
pub fn sniff_delimiter(text: &str) -> u8 {
    let sample: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();
    let mut best = (b',', 0usize);
    for candidate in SNIFF_CANDIDATES {
        let count: usize = sample
            .iter()
            .map(|line| line.bytes().filter(|&b| b == candidate).count())
            .sum();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// The reader that handles `path`, if any
pub fn reader_for(path: &Path) -> Option<&'static dyn SheetReader> {
    let extension = extension_of(path)?;
    DELIMITED
        .extensions()
        .contains(&extension.as_str())
        .then_some(&DELIMITED as &'static dyn SheetReader)
}

/// Read any supported source file into a sheet
pub fn read_sheet(path: &Path) -> PipelineResult<RawSheet> {
    let reader = reader_for(path)
        .ok_or_else(|| PipelineError::UnsupportedFormat(path.display().to_string()))?;
    reader.read(path)
}

/// All files under `dir`, recursively, in sorted order
pub fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// Source files of one category, as (year, path), ordered by year then path
///
/// Files live in `<root>/<year>/` and end in `_<category>.csv`. Files whose
/// parent directory is not a year are ignored with a warning.
pub fn discover_category_files(root: &Path, category: Category) -> Result<Vec<(i64, PathBuf)>> {
    let suffix = category.file_suffix();
    let files =
        collect_files(root).with_context(|| format!("Failed to scan directory: {:?}", root))?;

    let mut found = Vec::new();
    for path in files {
        if !file_name(&path).ends_with(&suffix) {
            continue;
        }
        let year = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<i64>().ok());
        match year {
            Some(year) => found.push((year, path)),
            None => warn!("Ignoring {:?}: parent directory is not a year", path),
        }
    }
    found.sort();
    Ok(found)
}

/// The single policing-provider source file under `root`
pub fn discover_provider_source(root: &Path) -> Result<PathBuf> {
    let suffix = Category::PolicingProvider.file_suffix();
    let files =
        collect_files(root).with_context(|| format!("Failed to scan directory: {:?}", root))?;
    let mut matches = files
        .into_iter()
        .filter(|p| file_name(p).ends_with(&suffix));

    let first = matches.next().ok_or_else(|| PipelineError::MissingSource {
        pattern: suffix.clone(),
        root: root.display().to_string(),
    })?;
    if let Some(extra) = matches.next() {
        warn!("Multiple policing sources, using {:?} and ignoring {:?}", first, extra);
    }
    Ok(first)
}

fn parse_value(raw: &str, column: &Column, origin: &str, row: usize) -> PipelineResult<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::zero(column.ty));
    }
    let parsed = match column.ty {
        FieldType::Text => Some(Value::Text(raw.to_string())),
        FieldType::Int => raw
            .parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().map(|f| f.trunc() as i64))
            .map(Value::Int),
        FieldType::Float => raw.parse::<f64>().ok().map(Value::Float),
        FieldType::Bool => raw.parse::<bool>().ok().map(Value::Bool),
    };
    parsed.ok_or_else(|| PipelineError::CellType {
        origin: origin.to_string(),
        row,
        column: column.name.clone(),
        value: raw.to_string(),
    })
}

/// Read a headed CSV table written by this crate, checking its header
/// against `columns`
pub fn read_table(path: &Path, columns: &[Column]) -> Result<Table> {
    let origin = path.display().to_string();
    let mut reader = ReaderBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to open table: {:?}", path))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {:?}", path))?
        .clone();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    if headers.iter().collect::<Vec<_>>() != names {
        anyhow::bail!(
            "{:?} has columns [{}], expected [{}]",
            path,
            headers.iter().collect::<Vec<_>>().join(", "),
            names.join(", ")
        );
    }

    let mut table = Table::new(columns.to_vec());
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read {:?}", path))?;
        let row = columns
            .iter()
            .zip(record.iter())
            .map(|(column, raw)| parse_value(raw, column, &origin, idx + 1))
            .collect::<PipelineResult<Vec<_>>>()?;
        table.rows.push(row);
    }
    Ok(table)
}
