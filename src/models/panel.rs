use super::category::Category;
use super::table::Table;

/// One category's per-year tables stacked into a long panel keyed by
/// (Year, Municipality)
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryPanel {
    pub category: Category,
    pub table: Table,
}

impl CategoryPanel {
    pub fn new(category: Category, table: Table) -> Self {
        Self { category, table }
    }

    pub fn height(&self) -> usize {
        self.table.height()
    }
}

/// A cleaned table for one (category, year) pair
#[derive(Debug, Clone, PartialEq)]
pub struct YearTable {
    pub year: i64,
    pub table: Table,
}
