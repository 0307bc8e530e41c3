//! JSON result artifacts.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use xds_types::SuiteResults;

pub const SUMMARY_FILE: &str = "summary.json";

/// Writes one `<variant>.json` per variant plus the cross-variant summary
/// into `dir`. Returns the written paths, summary last.
pub fn write_results(dir: &Path, results: &SuiteResults) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create results directory {}", dir.display()))?;

    let mut written = Vec::with_capacity(results.results_by_variant.len() + 1);
    for variant in &results.results_by_variant {
        let path = dir.join(format!("{}.json", variant.variant.slug()));
        write_json_atomic(&path, variant)?;
        written.push(path);
    }
    let summary = dir.join(SUMMARY_FILE);
    write_json_atomic(&summary, results)?;
    written.push(summary);
    Ok(written)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut content = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    content.push('\n');
    write_text_atomic(path, &content)
}

/// Writes text using a temp file + rename so readers never observe partial data.
fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.exists() && path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let temp_path = parent_dir.join(format!(
        ".{}.tmp-{}-{stamp}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("results"),
        std::process::id(),
    ));
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}
