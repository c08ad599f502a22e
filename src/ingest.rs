//! Document registration.
//!
//! Ingest only records the document (pending status + checkpoint) and
//! where its bytes live; all heavy work happens later in the batch run,
//! so ingest stays fast and crash-safe.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSetBuilder};
use sqlx::SqlitePool;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::extract;
use crate::store;

/// Register a file, or every matching file under a directory.
/// Returns the new document ids in registration order.
pub async fn register_path(
    pool: &SqlitePool,
    config: &Config,
    path: &Path,
    name: Option<String>,
    source: &str,
) -> Result<Vec<String>> {
    if path.is_file() {
        let id = register_file(pool, path, name, source).await?;
        return Ok(vec![id]);
    }
    if !path.is_dir() {
        bail!("path does not exist: {}", path.display());
    }

    let mut builder = GlobSetBuilder::new();
    for glob in &config.ingest.include_globs {
        builder.add(Glob::new(glob).with_context(|| format!("invalid glob: {}", glob))?);
    }
    let include = builder.build()?;

    let mut ids = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        if !include.is_match(rel) {
            continue;
        }
        // Directory scans skip files we cannot extract instead of failing.
        if mime_for_path(entry.path()).is_none() {
            continue;
        }
        let id = register_file(pool, entry.path(), None, source).await?;
        ids.push(id);
    }

    if ids.is_empty() {
        bail!("no ingestible files found under {}", path.display());
    }
    Ok(ids)
}

async fn register_file(
    pool: &SqlitePool,
    path: &Path,
    name: Option<String>,
    source: &str,
) -> Result<String> {
    let mime = mime_for_path(path)
        .ok_or_else(|| anyhow::anyhow!("unsupported file type: {}", path.display()))?;

    let display_name = name.unwrap_or_else(|| default_name(path));
    let canonical = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;

    let id = store::register_document(
        pool,
        &display_name,
        source,
        mime,
        &canonical.to_string_lossy(),
    )
    .await?;
    Ok(id)
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(extract::mime_for_extension)
}

/// "cao_metaal_2026.pdf" → "cao metaal 2026"
fn default_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .replace(['_', '-'], " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_name_cleans_separators() {
        assert_eq!(
            default_name(&PathBuf::from("/x/cao_metaal-2026.pdf")),
            "cao metaal 2026"
        );
    }

    #[test]
    fn mime_detection_by_extension() {
        assert_eq!(
            mime_for_path(&PathBuf::from("a.pdf")),
            Some(extract::MIME_PDF)
        );
        assert_eq!(
            mime_for_path(&PathBuf::from("a.docx")),
            Some(extract::MIME_DOCX)
        );
        assert_eq!(mime_for_path(&PathBuf::from("a.exe")), None);
        assert_eq!(mime_for_path(&PathBuf::from("noext")), None);
    }
}
