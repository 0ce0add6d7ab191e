use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Category, Cell, FieldType, RawProviderRow, RawSheet, Table, Value, MUNICIPALITY,
};
use crate::names::{normalize_municipality, title_case};

/// Configuration for Stage 1 extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Municipalities that open the data block of every source table
    pub anchors: Vec<String>,
    /// Minimum share of non-empty cells for a column to be kept
    pub min_column_fill: f64,
    /// Raw column holding the policing-source labels
    pub provider_label_column: usize,
    /// Raw column holding the policing-source provider codes
    pub provider_code_column: usize,
    /// Labels longer than this are footnotes
    pub max_label_chars: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            anchors: vec!["Fredericton".to_string(), "Moncton".to_string()],
            min_column_fill: 0.1,
            provider_label_column: 0,
            provider_code_column: 8,
            max_label_chars: 80,
        }
    }
}

static TAX_BASE_SKIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(GROUP|TOTAL|of|\*)").expect("invalid tax base skip pattern"));
static MUNICIPAL_CODES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"MUNI|BNPP|KVPF").expect("invalid provider code pattern"));

/// Find the first data row: the first row whose second cell, title-cased,
/// starts with one of the anchor municipalities
pub fn find_data_start(sheet: &RawSheet, anchors: &[String]) -> PipelineResult<usize> {
    let anchors: Vec<String> = anchors.iter().map(|a| title_case(a)).collect();
    sheet
        .rows
        .iter()
        .position(|row| {
            row.get(1)
                .and_then(Cell::as_text)
                .map(|text| {
                    let text = title_case(&text);
                    anchors.iter().any(|a| text.starts_with(a.as_str()))
                })
                .unwrap_or(false)
        })
        .ok_or_else(|| PipelineError::HeaderNotFound {
            origin: sheet.origin.clone(),
            anchors: anchors.join(", "),
        })
}

/// Pick the raw columns bound to the category schema
///
/// Columns that are mostly empty below the data start are footnote or
/// spacer columns and are skipped; the remaining ones bind to the schema by
/// position.
fn select_columns(
    sheet: &RawSheet,
    start: usize,
    category: Category,
    config: &ExtractConfig,
) -> PipelineResult<Vec<usize>> {
    let height = sheet.height().saturating_sub(start) as f64;
    let threshold = height * config.min_column_fill;
    let kept: Vec<usize> = (0..sheet.width())
        .filter(|&col| sheet.non_null_count(col, start) as f64 >= threshold)
        .collect();

    let arity = category.raw_arity();
    if kept.len() < arity {
        return Err(PipelineError::ColumnCount {
            origin: sheet.origin.clone(),
            category,
            expected: arity,
            found: kept.len(),
        });
    }

    debug!(
        "{}: data starts at row {}, using raw columns {:?}",
        sheet.origin,
        start,
        &kept[..arity]
    );
    Ok(kept[..arity].to_vec())
}

/// Extract a cleaned table for one (category, year) source sheet
pub fn extract_category(
    sheet: &RawSheet,
    category: Category,
    config: &ExtractConfig,
) -> PipelineResult<Table> {
    if category == Category::PolicingProvider {
        return Err(PipelineError::UnsupportedFormat(format!(
            "{} is read with extract_provider_source",
            sheet.origin
        )));
    }

    let start = find_data_start(sheet, &config.anchors)?;
    let columns = select_columns(sheet, start, category, config)?;

    let mut table = if category == Category::TaxBase {
        extract_tax_base(sheet, start, &columns)?
    } else {
        extract_indexed(sheet, start, &columns, category)?
    };

    normalize_names(&mut table);

    debug!(
        "{}: extracted {} {} rows",
        sheet.origin,
        table.height(),
        category
    );
    Ok(table)
}

/// Generic path: keep rows with a numeric Index and coerce strictly
fn extract_indexed(
    sheet: &RawSheet,
    start: usize,
    columns: &[usize],
    category: Category,
) -> PipelineResult<Table> {
    let schema = category.schema();
    let mut table = Table::new(category.columns());

    for (row_idx, row) in sheet.rows.iter().enumerate().skip(start) {
        if !row[columns[0]].is_index() {
            continue;
        }

        let mut values = Vec::with_capacity(schema.len());
        for (field, &col) in schema.iter().zip(&columns[1..]) {
            let value = coerce(&row[col], field.ty).ok_or_else(|| PipelineError::CellType {
                origin: sheet.origin.clone(),
                row: row_idx + 1,
                column: field.name.to_string(),
                value: row[col].to_string(),
            })?;
            values.push(value);
        }
        table.rows.push(values);
    }

    Ok(table)
}

/// Tax-base path
///
/// Multi-district municipalities are listed as a total row followed by
/// component rows with Index 0; the components are folded into the total.
/// Coercion is lenient: unreadable cells count as missing.
fn extract_tax_base(sheet: &RawSheet, start: usize, columns: &[usize]) -> PipelineResult<Table> {
    let schema = Category::TaxBase.schema();
    let mut totals: Vec<(String, Vec<f64>)> = Vec::new();

    for row in sheet.rows.iter().skip(start) {
        let Some(name) = row[columns[1]].as_text() else {
            continue;
        };
        if TAX_BASE_SKIP.is_match(&name) {
            continue;
        }

        let index = lenient_f64(&row[columns[0]]);
        let amounts: Vec<f64> = columns[2..].iter().map(|&col| lenient_f64(&row[col])).collect();

        if index == 0.0 {
            match totals.last_mut() {
                Some((_, base)) => {
                    for (acc, amount) in base.iter_mut().zip(&amounts) {
                        *acc += amount;
                    }
                }
                None => debug!("{}: component row '{}' has no total row", sheet.origin, name),
            }
        } else {
            totals.push((name, amounts));
        }
    }

    let mut table = Table::new(Category::TaxBase.columns());
    for (name, amounts) in totals {
        let mut values = Vec::with_capacity(schema.len());
        values.push(Value::Text(name));
        values.extend(amounts.into_iter().map(|a| Value::Int(a as i64)));
        table.rows.push(values);
    }
    Ok(table)
}

/// Coerce a raw cell to a declared type; missing values become zero.
/// Returns `None` when a non-empty cell cannot be read as that type.
fn coerce(cell: &Cell, ty: FieldType) -> Option<Value> {
    match (ty, cell) {
        (_, Cell::Empty) => Some(Value::zero(ty)),
        (FieldType::Text, _) => cell.as_text().map(Value::Text),
        (FieldType::Float, Cell::Number(n)) => Some(Value::Float(*n)),
        (FieldType::Float, Cell::Text(s)) => s.trim().parse().ok().map(Value::Float),
        (FieldType::Int, Cell::Number(n)) => Some(Value::Int(*n as i64)),
        (FieldType::Int, Cell::Text(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .map(Value::Int)
        }
        (FieldType::Bool, _) => None,
    }
}

fn lenient_f64(cell: &Cell) -> f64 {
    match cell {
        Cell::Number(n) => *n,
        Cell::Text(s) => s.trim().parse().unwrap_or(0.0),
        Cell::Empty => 0.0,
    }
}

fn normalize_names(table: &mut Table) {
    let Some(col) = table.column_index(MUNICIPALITY) else {
        return;
    };
    for row in &mut table.rows {
        if let Value::Text(name) = &row[col] {
            row[col] = Value::Text(normalize_municipality(name));
        }
    }
}

/// Read the (label, provider code) pairs of the policing source
///
/// The first row is the source header. Codes are reduced to their upper-cased
/// four-letter prefix, with the municipal force codes folded into `Municipal`.
pub fn extract_provider_source(sheet: &RawSheet, config: &ExtractConfig) -> Vec<RawProviderRow> {
    let rows: Vec<RawProviderRow> = (1..sheet.height())
        .filter_map(|row_idx| {
            let label = sheet.cell(row_idx, config.provider_label_column).as_text()?;
            if label.chars().count() > config.max_label_chars {
                return None;
            }
            let code = sheet
                .cell(row_idx, config.provider_code_column)
                .as_text()
                .map(|code| normalize_provider_code(&code));
            Some(RawProviderRow { label, code })
        })
        .collect();

    debug!("{}: read {} policing rows", sheet.origin, rows.len());
    rows
}

fn normalize_provider_code(code: &str) -> String {
    let prefix: String = code.chars().take(4).collect::<String>().to_uppercase();
    MUNICIPAL_CODES.replace(&prefix, "Municipal").into_owned()
}
