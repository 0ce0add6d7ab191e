use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::stage3_panel::Panels;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Category, Column, FieldType, ProviderMap, Table, Value, MUNICIPALITY, PANEL_CATEGORIES, YEAR,
};

/// Source fields carried into the master panel, renamed, per category
const MASTER_FIELDS: [(Category, &[(&str, &str)]); 4] = [
    (
        Category::BudgetRevenues,
        &[("Warrant", "TaxRev"), ("Total Revenue", "TotalRev")],
    ),
    (
        Category::BudgetExpenditures,
        &[("Police", "PolExp"), ("Total Expenditures", "TotalExp")],
    ),
    (
        Category::Comparative,
        &[
            ("Latest Census Population", "LatestCensusPop"),
            ("Average Tax Rate", "AvgTaxRate"),
        ],
    ),
    (Category::TaxBase, &[("Total Tax Base for Rate", "TaxBase")]),
];

/// Configuration for Stage 5 master joining
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Provider labels that get a `Provider_<label>` indicator column
    pub providers: Vec<String>,
    /// Applied to monetary totals before per-capita division
    pub scale_factor: f64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            providers: vec!["PPSA".to_string(), "MPSA".to_string()],
            scale_factor: 0.001,
        }
    }
}

fn project(category: Category, panels: &Panels) -> PipelineResult<Table> {
    let panel = panels
        .get(&category)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: category.id().to_string(),
            context: "master join inputs".to_string(),
        })?;
    let fields = MASTER_FIELDS
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, f)| *f)
        .unwrap_or(&[]);

    let mut mapping = vec![(YEAR, YEAR), (MUNICIPALITY, MUNICIPALITY)];
    mapping.extend_from_slice(fields);
    panel
        .table
        .project(&mapping)
        .map_err(|column| PipelineError::MissingColumn {
            column,
            context: format!("{} panel", category),
        })
}

/// Every category must cover exactly the same municipalities
fn check_municipality_sets(projected: &[(Category, Table)]) -> PipelineResult<()> {
    let Some((_, reference)) = projected.first() else {
        return Ok(());
    };
    let reference = reference.distinct_text(MUNICIPALITY);
    for (category, table) in &projected[1..] {
        let names = table.distinct_text(MUNICIPALITY);
        if names != reference {
            let differing: Vec<String> = reference.symmetric_difference(&names).cloned().collect();
            return Err(PipelineError::MunicipalitySetMismatch {
                category: *category,
                differing,
            });
        }
    }
    Ok(())
}

fn index_rows(table: &Table) -> HashMap<(i64, String), usize> {
    (0..table.height())
        .filter_map(|row| table.entity_key(row).map(|key| (key, row)))
        .collect()
}

/// Inner-join the projected tables on (Year, Municipality)
///
/// Rows keep the order of the first table. A key absent from any table is
/// reported against the first category that carries it.
fn inner_join(projected: &[(Category, Table)]) -> PipelineResult<Table> {
    let indexes: Vec<HashMap<(i64, String), usize>> =
        projected.iter().map(|(_, t)| index_rows(t)).collect();

    let common: BTreeSet<&(i64, String)> = indexes[0]
        .keys()
        .filter(|key| indexes[1..].iter().all(|index| index.contains_key(*key)))
        .collect();

    for ((category, table), index) in projected.iter().zip(&indexes) {
        let mut dropped: Vec<&(i64, String)> =
            index.keys().filter(|key| !common.contains(key)).collect();
        if !dropped.is_empty() {
            dropped.sort();
            return Err(PipelineError::JoinDroppedRows {
                category: *category,
                count: dropped.len(),
                first: format!("{} {}", dropped[0].1, dropped[0].0),
            });
        }
        debug!("{}: {} rows joined", category, table.height());
    }

    let (_, base) = &projected[0];
    let mut columns = base.columns.clone();
    for (_, table) in &projected[1..] {
        columns.extend(table.columns[2..].iter().cloned());
    }

    let mut joined = Table::new(columns);
    for row in 0..base.height() {
        let Some(key) = base.entity_key(row) else {
            continue;
        };
        let mut values = base.rows[row].clone();
        for ((_, table), index) in projected[1..].iter().zip(&indexes[1..]) {
            let other = index[&key];
            values.extend(table.rows[other][2..].iter().cloned());
        }
        joined.rows.push(values);
    }
    Ok(joined)
}

fn number(table: &Table, row: usize, name: &str) -> f64 {
    table.get(row, name).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Execute Stage 5: join the reconciled panels into the master panel
///
/// Monetary totals are scaled by `scale_factor` and divided by the latest
/// census population. The average tax rate is converted from percent.
pub fn build_master(
    panels: &Panels,
    providers: &ProviderMap,
    config: &MasterConfig,
) -> PipelineResult<Table> {
    let projected: Vec<(Category, Table)> = PANEL_CATEGORIES
        .iter()
        .map(|&category| project(category, panels).map(|table| (category, table)))
        .collect::<PipelineResult<_>>()?;

    check_municipality_sets(&projected)?;
    let joined = inner_join(&projected)?;

    let municipalities = joined.distinct_text(MUNICIPALITY);
    let missing: Vec<String> = municipalities
        .iter()
        .filter(|m| !providers.contains(m))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingProvider(missing));
    }

    for label in &config.providers {
        if !municipalities
            .iter()
            .any(|m| providers.get(m) == Some(label.as_str()))
        {
            return Err(PipelineError::MissingColumn {
                column: format!("Provider_{}", label),
                context: "no municipality has this policing provider".to_string(),
            });
        }
    }

    let mut columns = vec![
        Column::new(YEAR, FieldType::Int),
        Column::new(MUNICIPALITY, FieldType::Text),
        Column::new("AvgTaxRate", FieldType::Float),
        Column::new("PolExpCapita", FieldType::Float),
        Column::new("OtherExpCapita", FieldType::Float),
        Column::new("OtherRevCapita", FieldType::Float),
        Column::new("TaxBaseCapita", FieldType::Float),
    ];
    for label in &config.providers {
        columns.push(Column::new(format!("Provider_{}", label), FieldType::Bool));
    }
    columns.push(Column::new("LatestCensusPop", FieldType::Int));

    let scale = config.scale_factor;
    let mut master = Table::new(columns);
    for row in 0..joined.height() {
        let municipality = joined
            .get(row, MUNICIPALITY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let population = number(&joined, row, "LatestCensusPop");
        let pol_exp = number(&joined, row, "PolExp") * scale;
        let total_exp = number(&joined, row, "TotalExp") * scale;
        let tax_rev = number(&joined, row, "TaxRev") * scale;
        let total_rev = number(&joined, row, "TotalRev") * scale;
        let tax_base = number(&joined, row, "TaxBase") * scale;

        let mut values = vec![
            joined.get(row, YEAR).cloned().unwrap_or(Value::Int(0)),
            Value::Text(municipality.to_string()),
            Value::Float(number(&joined, row, "AvgTaxRate") / 100.0),
            Value::Float(pol_exp / population),
            Value::Float((total_exp - pol_exp) / population),
            Value::Float((total_rev - tax_rev) / population),
            Value::Float(tax_base / population),
        ];
        let provider = providers.get(municipality);
        for label in &config.providers {
            values.push(Value::Bool(provider == Some(label.as_str())));
        }
        values.push(Value::Int(population as i64));
        master.rows.push(values);
    }

    info!(
        "Stage 5: master panel has {} rows for {} municipalities",
        master.height(),
        master.distinct_text(MUNICIPALITY).len()
    );
    Ok(master)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CategoryPanel;

    fn panel(category: Category, entities: &[(i64, &str)], fields: &[(&str, Value)]) -> CategoryPanel {
        let mut table = Table::new(category.panel_columns());
        for (year, muni) in entities {
            let mut values: Vec<Value> = table.columns.iter().map(|c| Value::zero(c.ty)).collect();
            values[0] = Value::Int(*year);
            values[1] = Value::Text(muni.to_string());
            for (name, value) in fields {
                let idx = table.column_index(name).unwrap();
                values[idx] = value.clone();
            }
            table.rows.push(values);
        }
        CategoryPanel::new(category, table)
    }

    fn panels_for(entities: &[(i64, &str)]) -> Panels {
        let mut panels = Panels::new();
        panels.insert(
            Category::BudgetRevenues,
            panel(
                Category::BudgetRevenues,
                entities,
                &[("Warrant", Value::Int(400)), ("Total Revenue", Value::Int(1000))],
            ),
        );
        panels.insert(
            Category::BudgetExpenditures,
            panel(
                Category::BudgetExpenditures,
                entities,
                &[("Police", Value::Int(100)), ("Total Expenditures", Value::Float(600.0))],
            ),
        );
        panels.insert(
            Category::Comparative,
            panel(
                Category::Comparative,
                entities,
                &[
                    ("Latest Census Population", Value::Int(10)),
                    ("Average Tax Rate", Value::Float(150.0)),
                ],
            ),
        );
        panels.insert(
            Category::TaxBase,
            panel(
                Category::TaxBase,
                entities,
                &[("Total Tax Base for Rate", Value::Int(5000))],
            ),
        );
        panels
    }

    fn providers() -> ProviderMap {
        let mut map = ProviderMap::new();
        map.insert("Moncton".to_string(), "MPSA".to_string());
        map.insert("Dieppe".to_string(), "PPSA".to_string());
        map
    }

    fn close(value: Option<&Value>, expected: f64) -> bool {
        (value.and_then(Value::as_f64).unwrap() - expected).abs() < 1e-12
    }

    #[test]
    fn test_master_columns_and_derivations() {
        let panels = panels_for(&[(2001, "Moncton"), (2001, "Dieppe")]);
        let master = build_master(&panels, &providers(), &MasterConfig::default()).unwrap();

        assert_eq!(
            master.column_names(),
            vec![
                "Year",
                "Municipality",
                "AvgTaxRate",
                "PolExpCapita",
                "OtherExpCapita",
                "OtherRevCapita",
                "TaxBaseCapita",
                "Provider_PPSA",
                "Provider_MPSA",
                "LatestCensusPop",
            ]
        );
        assert_eq!(master.height(), 2);
        assert!(close(master.get(0, "AvgTaxRate"), 1.5));
        assert!(close(master.get(0, "PolExpCapita"), 0.01));
        assert!(close(master.get(0, "OtherExpCapita"), 0.05));
        assert!(close(master.get(0, "OtherRevCapita"), 0.06));
        assert!(close(master.get(0, "TaxBaseCapita"), 0.5));
        assert_eq!(master.get(0, "LatestCensusPop"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_provider_indicators() {
        let panels = panels_for(&[(2001, "Moncton"), (2001, "Dieppe")]);
        let master = build_master(&panels, &providers(), &MasterConfig::default()).unwrap();

        for label in ["Provider_PPSA", "Provider_MPSA"] {
            let col = master.column_index(label).unwrap();
            assert_eq!(master.columns[col].ty, FieldType::Bool);
        }
        assert_eq!(master.get(0, "Provider_MPSA"), Some(&Value::Bool(true)));
        assert_eq!(master.get(0, "Provider_PPSA"), Some(&Value::Bool(false)));
        assert_eq!(master.get(1, "Provider_PPSA"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_municipality_set_mismatch() {
        let mut panels = panels_for(&[(2001, "Moncton"), (2001, "Dieppe")]);
        let other = panels_for(&[(2001, "Moncton"), (2001, "Shediac")]);
        panels.insert(Category::TaxBase, other[&Category::TaxBase].clone());

        let err = build_master(&panels, &providers(), &MasterConfig::default()).unwrap_err();
        match err {
            PipelineError::MunicipalitySetMismatch {
                category,
                differing,
            } => {
                assert_eq!(category, Category::TaxBase);
                assert_eq!(differing, vec!["Dieppe".to_string(), "Shediac".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dropped_rows_are_fatal() {
        let mut panels = panels_for(&[(2001, "Moncton"), (2002, "Moncton")]);
        let other = panels_for(&[(2001, "Moncton")]);
        panels.insert(Category::Comparative, other[&Category::Comparative].clone());

        let err = build_master(&panels, &providers(), &MasterConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::JoinDroppedRows {
                category: Category::BudgetRevenues,
                count: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_unused_provider_label_is_fatal() {
        let panels = panels_for(&[(2001, "Moncton")]);
        let mut map = ProviderMap::new();
        map.insert("Moncton".to_string(), "MPSA".to_string());

        let err = build_master(&panels, &map, &MasterConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { .. }));
    }

    #[test]
    fn test_missing_provider_is_fatal() {
        let panels = panels_for(&[(2001, "Moncton"), (2001, "Riverview")]);
        let err = build_master(&panels, &providers(), &MasterConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingProvider(names) if names == vec!["Riverview".to_string()]));
    }
}
