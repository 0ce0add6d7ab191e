use std::fmt;

/// A single untyped spreadsheet cell as read from a source file
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    /// Infer a cell from its raw textual form
    ///
    /// Blank strings are empty cells, anything that parses as a float is a
    /// number, and everything else is kept verbatim as text.
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Cell::Empty;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Cell::Number(n),
            _ => Cell::Text(raw.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Text rendering of the cell, `None` when empty
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Number(n) => Some(format_number(*n)),
            Cell::Text(s) => Some(s.clone()),
        }
    }

    /// True when the cell holds a non-negative whole number, either as a
    /// number or as a string made only of ASCII digits
    pub fn is_index(&self) -> bool {
        match self {
            Cell::Number(n) => *n >= 0.0 && n.fract() == 0.0,
            Cell::Text(s) => {
                let s = s.trim();
                !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
            }
            Cell::Empty => false,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Number(n) => write!(f, "{}", format_number(*n)),
            Cell::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Render whole floats without a trailing `.0`
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A rectangular grid of cells with no guaranteed header row
#[derive(Debug, Clone, Default)]
pub struct RawSheet {
    /// Where the sheet came from, used in error messages
    pub origin: String,
    pub rows: Vec<Vec<Cell>>,
}

impl RawSheet {
    /// Build a sheet, padding every row to the widest one
    pub fn new(origin: impl Into<String>, mut rows: Vec<Vec<Cell>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for row in &mut rows {
            row.resize(width, Cell::Empty);
        }
        Self {
            origin: origin.into(),
            rows,
        }
    }

    /// Convenience constructor from raw strings
    pub fn from_strings(origin: impl Into<String>, rows: &[Vec<&str>]) -> Self {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|raw| Cell::from_raw(raw)).collect())
            .collect();
        Self::new(origin, rows)
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Cell::Empty)
    }

    /// Number of non-empty cells in a column starting at `from_row`
    pub fn non_null_count(&self, col: usize, from_row: usize) -> usize {
        self.rows
            .iter()
            .skip(from_row)
            .filter(|row| row.get(col).is_some_and(|c| !c.is_empty()))
            .count()
    }
}
