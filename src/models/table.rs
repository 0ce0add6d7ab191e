use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const YEAR: &str = "Year";
pub const MUNICIPALITY: &str = "Municipality";

/// Declared type of a table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Int,
    Float,
    Bool,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: FieldType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    /// Numeric view of the value; text is `None`, booleans are 0/1
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Zero of the given type, used to fill missing values
    pub fn zero(ty: FieldType) -> Self {
        match ty {
            FieldType::Text => Value::Text(String::new()),
            FieldType::Int => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::Bool => Value::Bool(false),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// A rectangular, typed table with named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Get a value by row number and column name
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let col = self.column_index(name)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }

    /// Distinct text values of a column, sorted
    pub fn distinct_text(&self, name: &str) -> BTreeSet<String> {
        let Some(col) = self.column_index(name) else {
            return BTreeSet::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row[col].as_str().map(str::to_string))
            .collect()
    }

    /// The (Year, Municipality) key of a row, if the table has both columns
    pub fn entity_key(&self, row: usize) -> Option<(i64, String)> {
        let year = self.get(row, YEAR)?.as_i64()?;
        let muni = self.get(row, MUNICIPALITY)?.as_str()?.to_string();
        Some((year, muni))
    }

    /// Append a column filled with `value`
    pub fn push_column(&mut self, column: Column, value: Value) {
        self.columns.push(column);
        for row in &mut self.rows {
            row.push(value.clone());
        }
    }

    /// Prepend a column filled with `value`
    pub fn insert_column_front(&mut self, column: Column, value: Value) {
        self.columns.insert(0, column);
        for row in &mut self.rows {
            row.insert(0, value.clone());
        }
    }

    /// Remove a column by name; returns false if it did not exist
    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(col) = self.column_index(name) else {
            return false;
        };
        self.columns.remove(col);
        for row in &mut self.rows {
            row.remove(col);
        }
        true
    }

    /// Keep only the named columns, renamed, in the given order
    ///
    /// Returns the missing source column name on failure.
    pub fn project(&self, mapping: &[(&str, &str)]) -> Result<Table, String> {
        let mut indices = Vec::with_capacity(mapping.len());
        let mut columns = Vec::with_capacity(mapping.len());
        for (from, to) in mapping {
            let idx = self.column_index(from).ok_or_else(|| from.to_string())?;
            indices.push(idx);
            columns.push(Column::new(*to, self.columns[idx].ty));
        }
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Table { columns, rows })
    }
}
