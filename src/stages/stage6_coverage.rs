use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::info;

use crate::models::{Column, FieldType, Table, Value, MUNICIPALITY};

/// A municipality absent from some years of the master panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageGap {
    pub municipality: String,
    pub missing_years: Vec<i64>,
}

/// Municipalities observed in fewer distinct years than the panel spans
///
/// Missing years are taken from the full `min..=max` range of the panel. A
/// municipality present in every observed year is not reported, even when
/// that range has holes.
pub fn find_coverage_gaps(master: &Table) -> Vec<CoverageGap> {
    let mut years_of: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
    for row in 0..master.height() {
        if let Some((year, municipality)) = master.entity_key(row) {
            years_of.entry(municipality).or_default().insert(year);
        }
    }

    let all_years: BTreeSet<i64> = years_of.values().flatten().copied().collect();
    let (Some(&first), Some(&last)) = (all_years.first(), all_years.last()) else {
        return Vec::new();
    };

    years_of
        .into_iter()
        .filter(|(_, years)| years.len() < all_years.len())
        .map(|(municipality, years)| CoverageGap {
            municipality,
            missing_years: (first..=last).filter(|y| !years.contains(y)).collect(),
        })
        .collect()
}

/// Execute Stage 6: report municipalities with incomplete year coverage
///
/// The result has columns Municipality and MissingYears, sorted by
/// municipality; years are joined with `", "`.
pub fn coverage_report(master: &Table) -> Table {
    let gaps = find_coverage_gaps(master);
    let mut table = Table::new(vec![
        Column::new(MUNICIPALITY, FieldType::Text),
        Column::new("MissingYears", FieldType::Text),
    ]);
    for gap in &gaps {
        let years: Vec<String> = gap.missing_years.iter().map(i64::to_string).collect();
        table.rows.push(vec![
            Value::Text(gap.municipality.clone()),
            Value::Text(years.join(", ")),
        ]);
    }
    info!(
        "Stage 6: {} municipalities with incomplete coverage",
        table.height()
    );
    table
}
