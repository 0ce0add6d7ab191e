use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::io::{collect_files, reader_for, write_sheet};

/// Result of Stage 0 conversion
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvertResult {
    /// Canonical CSV files written
    pub converted: Vec<PathBuf>,
    /// Source files with no matching reader
    pub skipped: Vec<PathBuf>,
}

/// Convert one source file into canonical CSV at `dst`
///
/// Returns the (rows, columns) of the written sheet.
pub fn convert_file(src: &Path, dst: &Path) -> PipelineResult<(usize, usize)> {
    let reader =
        reader_for(src).ok_or_else(|| PipelineError::UnsupportedFormat(src.display().to_string()))?;
    let sheet = reader.read(src)?;
    write_sheet(&sheet, dst)?;
    debug!(
        "Converted {:?} -> {:?} ({} x {})",
        src,
        dst,
        sheet.height(),
        sheet.width()
    );
    Ok((sheet.height(), sheet.width()))
}

/// Execute Stage 0: convert every supported file under `src_root`
///
/// The relative layout is mirrored under `dst_root` with each extension
/// replaced by `.csv`. Unsupported files are skipped with a warning.
pub fn convert_tree(src_root: &Path, dst_root: &Path) -> PipelineResult<ConvertResult> {
    let mut result = ConvertResult::default();

    for src in collect_files(src_root)? {
        if reader_for(&src).is_none() {
            warn!("Skipping unsupported file {:?}", src);
            result.skipped.push(src);
            continue;
        }
        let relative = src.strip_prefix(src_root).unwrap_or(&src);
        let dst = dst_root.join(relative).with_extension("csv");
        convert_file(&src, &dst)?;
        result.converted.push(dst);
    }

    info!(
        "Stage 0: converted {} files ({} skipped)",
        result.converted.len(),
        result.skipped.len()
    );
    Ok(result)
}
