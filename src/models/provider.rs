use std::collections::BTreeMap;

use serde::Serialize;

use super::table::{Column, FieldType, Table, Value, MUNICIPALITY};

/// A (label, provider code) pair read positionally from the policing source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProviderRow {
    pub label: String,
    /// Normalized provider code; `None` when the cell was blank
    pub code: Option<String>,
}

impl RawProviderRow {
    pub fn new(label: &str, code: Option<&str>) -> Self {
        Self {
            label: label.to_string(),
            code: code.map(str::to_string),
        }
    }
}

/// One entry of the policing source after the block scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRow {
    /// Per-row community label, suffix stripped and corrected
    pub district: String,
    /// Name of the block the row was listed under
    pub municipality: String,
    /// Provider label; `None` when the source cell was blank
    pub provider: Option<String>,
}

impl ProviderRow {
    pub fn new(district: &str, municipality: &str, provider: Option<&str>) -> Self {
        Self {
            district: district.to_string(),
            municipality: municipality.to_string(),
            provider: provider.map(str::to_string),
        }
    }
}

/// Cleaned policing rows as a table: District, Municipality, Policing Provider
pub fn provider_rows_table(rows: &[ProviderRow]) -> Table {
    let mut table = Table::new(vec![
        Column::new("District", FieldType::Text),
        Column::new(MUNICIPALITY, FieldType::Text),
        Column::new("Policing Provider", FieldType::Text),
    ]);
    for row in rows {
        table.rows.push(vec![
            Value::Text(row.district.clone()),
            Value::Text(row.municipality.clone()),
            Value::Text(row.provider.clone().unwrap_or_default()),
        ]);
    }
    table
}

/// Municipality to policing provider, ordered by municipality
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderMap {
    entries: BTreeMap<String, String>,
}

impl ProviderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, municipality: &str) -> Option<&str> {
        self.entries.get(municipality).map(String::as_str)
    }

    pub fn insert(&mut self, municipality: String, provider: String) -> Option<String> {
        self.entries.insert(municipality, provider)
    }

    pub fn contains(&self, municipality: &str) -> bool {
        self.entries.contains_key(municipality)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(m, p)| (m.as_str(), p.as_str()))
    }

    /// Final table form: Municipality, Policing Provider
    pub fn to_table(&self) -> Table {
        let mut table = Table::new(vec![
            Column::new(MUNICIPALITY, FieldType::Text),
            Column::new("Policing Provider", FieldType::Text),
        ]);
        for (muni, provider) in self.iter() {
            table.rows.push(vec![
                Value::Text(muni.to_string()),
                Value::Text(provider.to_string()),
            ]);
        }
        table
    }
}
