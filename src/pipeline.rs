use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::io::{
    discover_category_files, discover_provider_source, read_sheet, read_table, write_json,
    write_table,
};
use crate::models::{
    provider_rows_table, Category, Column, FieldType, ProviderMap, ProviderRow, Table, Value,
    YearTable, MUNICIPALITY, PANEL_CATEGORIES, YEAR,
};
use crate::stages::{
    assemble_panels, build_master, convert_tree, coverage_report, extract_category,
    extract_provider_source, find_coverage_gaps, reconcile_amalgamations, resolve_providers,
    rows_per_year, scan_provider_rows, ConvertResult, CoverageGap, Panels,
};

/// Subdirectory of the output root holding canonical CSV
pub const RAW_DIR: &str = "raw";
/// Subdirectory of the output root holding cleaned per-year tables
pub const CLEAN_DIR: &str = "clean";
/// Subdirectory of the output root holding final panels
pub const FINAL_DIR: &str = "final";
pub const COVERAGE_FILE: &str = "inconsistent_munis.csv";
pub const SUMMARY_FILE: &str = "run_summary.json";

/// Cleaned tables produced by extraction
#[derive(Debug, Default)]
pub struct Extracted {
    pub tables: BTreeMap<Category, Vec<YearTable>>,
    pub provider_rows: Vec<ProviderRow>,
}

/// Row counts of one category panel
#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub rows_before_amalgamation: usize,
    pub rows: usize,
    pub rows_per_year: BTreeMap<i64, usize>,
}

/// Machine-readable record of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub first_year: i64,
    pub last_year: i64,
    pub categories: BTreeMap<Category, CategorySummary>,
    pub provider_count: usize,
    pub master_rows: usize,
    pub master_municipalities: usize,
    pub coverage_gaps: Vec<CoverageGap>,
}

/// Everything `finalize` computes, before anything is written
#[derive(Debug)]
pub struct FinalOutputs {
    pub panels: Panels,
    pub providers: ProviderMap,
    pub master: Table,
    pub coverage: Table,
    pub summary: RunSummary,
}

/// Convert the raw source tree into canonical CSV
pub fn convert(src_root: &Path, dst_root: &Path) -> Result<ConvertResult> {
    convert_tree(src_root, dst_root)
        .with_context(|| format!("Failed to convert source tree {:?}", src_root))
}

/// Extract every category table and the policing source under `src_root`
pub fn extract_all(src_root: &Path, config: &PipelineConfig) -> Result<Extracted> {
    let mut extracted = Extracted::default();

    for category in PANEL_CATEGORIES {
        let files = discover_category_files(src_root, category)?;
        let mut tables = Vec::with_capacity(files.len());
        for (year, path) in files {
            if tables.iter().any(|t: &(i64, PathBuf, Table)| t.0 == year) {
                warn!("{}: more than one table for {}, see {:?}", category, year, path);
            }
            let sheet = read_sheet(&path).with_context(|| format!("Failed to read {:?}", path))?;
            let table = extract_category(&sheet, category, &config.extract)?;
            tables.push((year, path, table));
        }
        info!("Stage 1: extracted {} {} tables", tables.len(), category);
        extracted.tables.insert(
            category,
            tables
                .into_iter()
                .map(|(year, _, table)| YearTable { year, table })
                .collect(),
        );
    }

    let source = discover_provider_source(src_root)?;
    let sheet = read_sheet(&source).with_context(|| format!("Failed to read {:?}", source))?;
    let raw = extract_provider_source(&sheet, &config.extract);
    extracted.provider_rows = scan_provider_rows(raw);
    info!(
        "Stage 1: extracted {} policing rows from {:?}",
        extracted.provider_rows.len(),
        source
    );

    Ok(extracted)
}

/// Extract and write cleaned tables, mirroring the source layout
///
/// Per-year tables go to `<clean>/<year>/<file name>` and the policing
/// rows to `<clean>/<file name>`.
pub fn extract(src_root: &Path, clean_root: &Path, config: &PipelineConfig) -> Result<Extracted> {
    let extracted = extract_all(src_root, config)?;

    for category in PANEL_CATEGORIES {
        let files = discover_category_files(src_root, category)?;
        let tables = extracted.tables.get(&category).map(Vec::as_slice).unwrap_or(&[]);
        for ((year, path), year_table) in files.iter().zip(tables) {
            let name = path.file_name().unwrap_or_default();
            write_table(&year_table.table, &clean_root.join(year.to_string()).join(name))?;
        }
    }

    let source = discover_provider_source(src_root)?;
    let name = source.file_name().unwrap_or_default();
    write_table(&provider_rows_table(&extracted.provider_rows), &clean_root.join(name))?;
    Ok(extracted)
}

/// Read the cleaned tables written by [`extract`]
pub fn load_clean(clean_root: &Path) -> Result<Extracted> {
    let mut extracted = Extracted::default();

    for category in PANEL_CATEGORIES {
        let columns = category.columns();
        let tables = discover_category_files(clean_root, category)?
            .into_iter()
            .map(|(year, path)| read_table(&path, &columns).map(|table| YearTable { year, table }))
            .collect::<Result<Vec<_>>>()?;
        extracted.tables.insert(category, tables);
    }

    let source = discover_provider_source(clean_root)?;
    let table = read_table(&source, &Category::PolicingProvider.columns())?;
    extracted.provider_rows = table
        .rows
        .iter()
        .map(|row| {
            let text = |i: usize| row[i].as_str().unwrap_or_default();
            let provider = Some(text(2)).filter(|p| !p.is_empty());
            ProviderRow::new(text(0), text(1), provider)
        })
        .collect();
    Ok(extracted)
}

/// Run stages 2 to 6 in memory
///
/// The provider vocabulary is the comparative panel before amalgamation, so
/// legacy municipalities get providers too.
pub fn compute_final(extracted: Extracted, config: &PipelineConfig) -> Result<FinalOutputs> {
    let years = config.years();
    let panels = assemble_panels(extracted.tables, &years)?;

    let vocabulary = panels
        .get(&Category::Comparative)
        .map(|panel| panel.table.distinct_text(MUNICIPALITY))
        .unwrap_or_default();
    let providers = resolve_providers(&extracted.provider_rows, &vocabulary, &config.providers)?;

    let reconciled = reconcile_amalgamations(&panels, &config.amalgamation)?;
    let master = build_master(&reconciled, &providers, &config.master)?;
    let coverage = coverage_report(&master);

    let categories = reconciled
        .iter()
        .map(|(category, panel)| {
            let before = panels.get(category).map(|p| p.height()).unwrap_or(0);
            (
                *category,
                CategorySummary {
                    rows_before_amalgamation: before,
                    rows: panel.height(),
                    rows_per_year: rows_per_year(panel),
                },
            )
        })
        .collect();

    let summary = RunSummary {
        first_year: config.first_year,
        last_year: config.last_year,
        categories,
        provider_count: providers.len(),
        master_rows: master.height(),
        master_municipalities: master.distinct_text(MUNICIPALITY).len(),
        coverage_gaps: find_coverage_gaps(&master),
    };

    Ok(FinalOutputs {
        panels: reconciled,
        providers,
        master,
        coverage,
        summary,
    })
}

/// Write the final panels, provider map, master panel, coverage report and
/// run summary under `out_root`
pub fn write_final(outputs: &FinalOutputs, out_root: &Path) -> Result<()> {
    let final_root = out_root.join(FINAL_DIR);
    for (category, panel) in &outputs.panels {
        write_table(&panel.table, &final_root.join(format!("data_{}.csv", category)))?;
    }
    write_table(
        &outputs.providers.to_table(),
        &final_root.join(format!("data_{}.csv", Category::PolicingProvider)),
    )?;
    write_table(&outputs.master, &final_root.join("data_master.csv"))?;
    write_table(&outputs.coverage, &out_root.join(COVERAGE_FILE))?;
    write_json(&outputs.summary, &final_root.join(SUMMARY_FILE))?;
    info!("Final outputs written to {:?}", final_root);
    Ok(())
}

/// Build the final outputs from cleaned tables
pub fn finalize(clean_root: &Path, out_root: &Path, config: &PipelineConfig) -> Result<RunSummary> {
    let extracted = load_clean(clean_root)?;
    let outputs = compute_final(extracted, config)?;
    write_final(&outputs, out_root)?;
    Ok(outputs.summary)
}

/// Recompute the coverage report from a written master panel
pub fn coverage(master_path: &Path, out_path: &Path) -> Result<Table> {
    let columns = master_key_columns();
    let master = read_master_keys(master_path, &columns)?;
    let report = coverage_report(&master);
    write_table(&report, out_path)?;
    Ok(report)
}

fn master_key_columns() -> Vec<Column> {
    vec![
        Column::new(YEAR, FieldType::Int),
        Column::new(MUNICIPALITY, FieldType::Text),
    ]
}

/// Read only the Year and Municipality columns of a master panel file
fn read_master_keys(path: &Path, columns: &[Column]) -> Result<Table> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to open {:?}", path))?;
    let headers = reader.headers()?.clone();
    let positions = columns
        .iter()
        .map(|c| {
            headers
                .iter()
                .position(|h| h == c.name)
                .with_context(|| format!("{:?} has no '{}' column", path, c.name))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut table = Table::new(columns.to_vec());
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read {:?}", path))?;
        let year = record
            .get(positions[0])
            .and_then(|y| y.trim().parse::<i64>().ok())
            .with_context(|| format!("Invalid Year in {:?}", path))?;
        let municipality = record.get(positions[1]).unwrap_or_default().to_string();
        table
            .rows
            .push(vec![Value::Int(year), Value::Text(municipality)]);
    }
    Ok(table)
}

/// Run every stage from raw sources to final outputs
///
/// Nothing under `final/` is written unless every stage succeeded.
pub fn run(input_root: &Path, out_root: &Path, config: &PipelineConfig) -> Result<RunSummary> {
    let raw_root = out_root.join(RAW_DIR);
    let clean_root = out_root.join(CLEAN_DIR);

    convert(input_root, &raw_root)?;
    let extracted = extract(&raw_root, &clean_root, config)?;
    let outputs = compute_final(extracted, config)?;
    write_final(&outputs, out_root)?;
    Ok(outputs.summary)
}
