use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::table::{Column, FieldType, MUNICIPALITY, YEAR};

/// The five source data categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "pol_prov")]
    PolicingProvider,
    #[serde(rename = "bgt_exps")]
    BudgetExpenditures,
    #[serde(rename = "bgt_revs")]
    BudgetRevenues,
    #[serde(rename = "cmp_data")]
    Comparative,
    #[serde(rename = "tax_base")]
    TaxBase,
}

/// Categories that form per-year panels, in master join order
pub const PANEL_CATEGORIES: [Category; 4] = [
    Category::BudgetRevenues,
    Category::BudgetExpenditures,
    Category::Comparative,
    Category::TaxBase,
];

/// A statically declared schema field
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn text(name: &'static str) -> Field {
    Field {
        name,
        ty: FieldType::Text,
    }
}

const fn int(name: &'static str) -> Field {
    Field {
        name,
        ty: FieldType::Int,
    }
}

const fn float(name: &'static str) -> Field {
    Field {
        name,
        ty: FieldType::Float,
    }
}

const POLICING_PROVIDER: &[Field] = &[
    text("District"),
    text(MUNICIPALITY),
    text("Policing Provider"),
];

const BUDGET_EXPENDITURES: &[Field] = &[
    text(MUNICIPALITY),
    float("General Government"),
    int("Police"),
    int("Fire Protection"),
    int("Water Cost Transfer"),
    int("Emergency Measures"),
    int("Other Protection Services"),
    int("Transportation"),
    int("Environmental Health"),
    int("Public Health"),
    int("Environmental Development"),
    int("Recreation & Cultural"),
    float("Debt Costs"),
    int("Transfers"),
    int("Deficits"),
    float("Total Expenditures"),
];

const BUDGET_REVENUES: &[Field] = &[
    text(MUNICIPALITY),
    int("Warrant"),
    int("Unconditional Grant"),
    int("Services to Other Governments"),
    int("Sale of Services"),
    int("Own-Source Revenue"),
    int("Conditional Transfers"),
    int("Other Transfers"),
    int("Biennial Surplus"),
    int("Total Revenue"),
];

const COMPARATIVE: &[Field] = &[
    text(MUNICIPALITY),
    int("Latest Census Population"),
    int("Penultimate Census Population"),
    float("Provincial Kilometrage"),
    float("Regional Kilometrage"),
    float("Municipal Kilometrage"),
    float("Total Kilometrage"),
    float("Population/Kilometrage"),
    int("Tax Base"),
    float("Tax Base/Capita"),
    float("Tax Base/Kilometrage"),
    int("Total Budget"),
    float("Fiscal Capacity"),
    float("Average Tax Rate"),
];

const TAX_BASE: &[Field] = &[
    text(MUNICIPALITY),
    int("General Residential Assessment"),
    int("Federal Residential Assessment"),
    int("Provincial Residential Assessment"),
    int("Total Residential Assessment"),
    int("General Non-Residential Assessment"),
    int("Federal Non-Residential Assessment"),
    int("Provincial Non-Residential Assessment"),
    int("Total Non-Residential Assessment"),
    int("Total Municipal Assessment Base"),
    int("Total Municipal Tax Base"),
    int("Total Tax Base for Rate"),
];

impl Category {
    /// Identifier embedded in source file names, e.g. `2004_bgt_exps.csv`
    pub fn id(self) -> &'static str {
        match self {
            Category::PolicingProvider => "pol_prov",
            Category::BudgetExpenditures => "bgt_exps",
            Category::BudgetRevenues => "bgt_revs",
            Category::Comparative => "cmp_data",
            Category::TaxBase => "tax_base",
        }
    }

    /// Fixed schema of a cleaned table for this category (without Index or Year)
    pub fn schema(self) -> &'static [Field] {
        match self {
            Category::PolicingProvider => POLICING_PROVIDER,
            Category::BudgetExpenditures => BUDGET_EXPENDITURES,
            Category::BudgetRevenues => BUDGET_REVENUES,
            Category::Comparative => COMPARATIVE,
            Category::TaxBase => TAX_BASE,
        }
    }

    /// Number of raw columns bound positionally, including the leading Index
    pub fn raw_arity(self) -> usize {
        self.schema().len() + 1
    }

    /// Columns of the cleaned per-year table
    pub fn columns(self) -> Vec<Column> {
        self.schema()
            .iter()
            .map(|f| Column::new(f.name, f.ty))
            .collect()
    }

    /// Columns of the category panel: Year followed by the schema
    pub fn panel_columns(self) -> Vec<Column> {
        let mut columns = vec![Column::new(YEAR, FieldType::Int)];
        columns.extend(self.columns());
        columns
    }

    /// Source file suffix used for discovery
    pub fn file_suffix(self) -> String {
        format!("_{}.csv", self.id())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pol_prov" => Ok(Category::PolicingProvider),
            "bgt_exps" => Ok(Category::BudgetExpenditures),
            "bgt_revs" => Ok(Category::BudgetRevenues),
            "cmp_data" => Ok(Category::Comparative),
            "tax_base" => Ok(Category::TaxBase),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}
