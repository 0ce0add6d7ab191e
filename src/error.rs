use std::io;

use thiserror::Error;

use crate::models::Category;

/// Broad class of a pipeline failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source layout broke an extraction assumption
    Structural,
    /// Entity or provider data disagrees across sources
    Consistency,
    Io,
}

/// Fatal pipeline errors; every variant aborts the run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no data start row found in '{origin}': no row has an anchor municipality ({anchors}) in its second cell")]
    HeaderNotFound { origin: String, anchors: String },
    #[error("'{origin}' has {found} usable columns but the {category} schema needs {expected}")]
    ColumnCount {
        origin: String,
        category: Category,
        expected: usize,
        found: usize,
    },
    #[error("'{origin}' row {row}: cannot read '{value}' in column '{column}' as a number")]
    CellType {
        origin: String,
        row: usize,
        column: String,
        value: String,
    },
    #[error("{category} table for {year} has columns [{found}], expected [{expected}]")]
    SchemaMismatch {
        category: Category,
        year: i64,
        expected: String,
        found: String,
    },
    #[error("no {category} table for year {year}")]
    MissingYear { category: Category, year: i64 },
    #[error("column '{column}' not found in {context}")]
    MissingColumn { column: String, context: String },
    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),
    #[error("no source file matching '*{pattern}' under {root}")]
    MissingSource { pattern: String, root: String },

    #[error("district {district} has multiple policing providers: {providers:?}")]
    ConflictingDistrictProviders {
        district: String,
        providers: Vec<String>,
    },
    #[error("municipality {municipality} has multiple policing providers: {providers:?}")]
    ConflictingMunicipalityProviders {
        municipality: String,
        providers: Vec<String>,
    },
    #[error("municipality {municipality} has different policing providers: {first} and {second}")]
    ProviderMismatch {
        municipality: String,
        first: String,
        second: String,
    },
    #[error("missing policing provider data for the following municipalities: {0:?}")]
    MissingProvider(Vec<String>),
    #[error("municipalities are not the same across datasets: {category} differs by {differing:?}")]
    MunicipalitySetMismatch {
        category: Category,
        differing: Vec<String>,
    },
    #[error("joining {category} dropped {count} (Year, Municipality) rows, first: {first}")]
    JoinDroppedRows {
        category: Category,
        count: usize,
        first: String,
    },
    #[error("{category} has duplicate rows for {municipality} in {year}")]
    DuplicateEntity {
        category: Category,
        year: i64,
        municipality: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::HeaderNotFound { .. }
            | PipelineError::ColumnCount { .. }
            | PipelineError::CellType { .. }
            | PipelineError::SchemaMismatch { .. }
            | PipelineError::MissingYear { .. }
            | PipelineError::MissingColumn { .. }
            | PipelineError::UnsupportedFormat(_)
            | PipelineError::MissingSource { .. } => ErrorKind::Structural,
            PipelineError::ConflictingDistrictProviders { .. }
            | PipelineError::ConflictingMunicipalityProviders { .. }
            | PipelineError::ProviderMismatch { .. }
            | PipelineError::MissingProvider(_)
            | PipelineError::MunicipalitySetMismatch { .. }
            | PipelineError::JoinDroppedRows { .. }
            | PipelineError::DuplicateEntity { .. } => ErrorKind::Consistency,
            PipelineError::Io(_) | PipelineError::Csv(_) => ErrorKind::Io,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_provider_names_municipalities() {
        let err = PipelineError::MissingProvider(vec!["Hanwell".to_string()]);
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.to_string().contains("missing policing provider"));
        assert!(err.to_string().contains("Hanwell"));
    }

    #[test]
    fn test_structural_kind() {
        let err = PipelineError::MissingYear {
            category: Category::TaxBase,
            year: 2003,
        };
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert_eq!(err.to_string(), "no tax_base table for year 2003");
    }
}
