use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Category, CategoryPanel, Column, Table, Value, YearTable, YEAR};

/// All category panels, keyed by category
pub type Panels = BTreeMap<Category, CategoryPanel>;

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Execute Stage 3 for one category: stack the per-year tables into a panel
///
/// Every configured year must be present and carry the category schema.
/// Tables for years outside the configured range are ignored. A change in
/// row count between consecutive years is logged, since it usually means a
/// municipality was added, dropped or spelled differently.
pub fn assemble_panel(
    category: Category,
    mut tables: Vec<YearTable>,
    years: &[i64],
) -> PipelineResult<CategoryPanel> {
    tables.sort_by_key(|t| t.year);
    let expected = category.columns();

    for &year in years {
        if !tables.iter().any(|t| t.year == year) {
            return Err(PipelineError::MissingYear { category, year });
        }
    }

    let mut panel = Table::new(category.panel_columns());
    let mut input_rows = 0;
    let mut previous: Option<(i64, usize)> = None;

    for year_table in tables {
        if !years.contains(&year_table.year) {
            debug!("{}: skipping table for {}", category, year_table.year);
            continue;
        }
        if year_table.table.columns != expected {
            return Err(PipelineError::SchemaMismatch {
                category,
                year: year_table.year,
                expected: column_list(&expected),
                found: column_list(&year_table.table.columns),
            });
        }

        let count = year_table.table.height();
        if let Some((prev_year, prev_count)) = previous {
            if prev_count != count {
                warn!(
                    "{}: row count changed from {} ({}) to {} ({})",
                    category, prev_count, prev_year, count, year_table.year
                );
            }
        }
        previous = Some((year_table.year, count));
        input_rows += count;

        for row in year_table.table.rows {
            let mut values = Vec::with_capacity(row.len() + 1);
            values.push(Value::Int(year_table.year));
            values.extend(row);
            panel.rows.push(values);
        }
    }

    info!(
        "Stage 3: {} panel has {} rows over {} years",
        category,
        input_rows,
        years.len()
    );
    Ok(CategoryPanel::new(category, panel))
}

/// Execute Stage 3 for every category
pub fn assemble_panels(
    tables: BTreeMap<Category, Vec<YearTable>>,
    years: &[i64],
) -> PipelineResult<Panels> {
    tables
        .into_iter()
        .map(|(category, year_tables)| {
            assemble_panel(category, year_tables, years).map(|panel| (category, panel))
        })
        .collect()
}

/// Row count per year of a panel
pub fn rows_per_year(panel: &CategoryPanel) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for row in 0..panel.height() {
        if let Some(year) = panel.table.get(row, YEAR).and_then(Value::as_i64) {
            *counts.entry(year).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MUNICIPALITY;

    fn revenue_table(names: &[&str]) -> Table {
        let mut table = Table::new(Category::BudgetRevenues.columns());
        for (i, name) in names.iter().enumerate() {
            let mut row = vec![Value::Text(name.to_string())];
            row.extend((0..9).map(|j| Value::Int((i * 10 + j) as i64)));
            table.rows.push(row);
        }
        table
    }

    #[test]
    fn test_assemble_panel_orders_years() {
        let tables = vec![
            YearTable {
                year: 2002,
                table: revenue_table(&["Moncton", "Dieppe"]),
            },
            YearTable {
                year: 2001,
                table: revenue_table(&["Moncton", "Dieppe", "Shediac"]),
            },
        ];

        let panel = assemble_panel(Category::BudgetRevenues, tables, &[2001, 2002]).unwrap();

        assert_eq!(panel.height(), 5);
        assert_eq!(panel.table.columns[0].name, YEAR);
        assert_eq!(panel.table.get(0, YEAR), Some(&Value::Int(2001)));
        assert_eq!(panel.table.get(3, YEAR), Some(&Value::Int(2002)));
        assert_eq!(
            panel.table.get(2, MUNICIPALITY),
            Some(&Value::Text("Shediac".to_string()))
        );
        assert_eq!(rows_per_year(&panel), BTreeMap::from([(2001, 3), (2002, 2)]));
    }

    #[test]
    fn test_missing_year_is_fatal() {
        let tables = vec![YearTable {
            year: 2001,
            table: revenue_table(&["Moncton"]),
        }];
        let err = assemble_panel(Category::BudgetRevenues, tables, &[2001, 2002]).unwrap_err();
        assert!(matches!(err, PipelineError::MissingYear { year: 2002, .. }));
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let mut table = revenue_table(&["Moncton"]);
        table.columns[1].name = "Levy".to_string();
        let tables = vec![YearTable { year: 2001, table }];
        let err = assemble_panel(Category::BudgetRevenues, tables, &[2001]).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_years_outside_range_are_ignored() {
        let tables = vec![
            YearTable {
                year: 1999,
                table: revenue_table(&["Moncton"]),
            },
            YearTable {
                year: 2001,
                table: revenue_table(&["Moncton"]),
            },
        ];
        let panel = assemble_panel(Category::BudgetRevenues, tables, &[2001]).unwrap();
        assert_eq!(panel.height(), 1);
    }
}
