pub mod config;
pub mod error;
pub mod io;
pub mod models;
pub mod names;
pub mod pipeline;
pub mod stages;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use models::{Category, CategoryPanel, ProviderMap, RawSheet, Table, Value};
pub use names::normalize_municipality;
pub use pipeline::{convert, coverage, extract, finalize, run, RunSummary};
pub use stages::{
    assemble_panels, build_master, coverage_report, reconcile_amalgamations, resolve_providers,
    AmalgamationConfig, ExtractConfig, MasterConfig, Panels, ProviderConfig,
};
