//! Directory scanner feeding [`crate::ingest::Ingestor::ingest_path`].

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A readable text file found under the scan root.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated on every platform.
    pub relative: String,
    pub content: String,
}

impl FileItem {
    pub fn source(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Files under `root` matching `include_globs` (all files when empty) and
/// none of `exclude_globs`. `.git`, `target` and `node_modules` are always
/// excluded. Files that are not valid UTF-8 are skipped.
pub fn scan_directory(
    root: &Path,
    include_globs: &[String],
    exclude_globs: &[String],
    follow_symlinks: bool,
) -> Result<Vec<FileItem>> {
    if !root.exists() {
        return Err(Error::NotFound(format!("path {}", root.display())));
    }

    let include_set = if include_globs.is_empty() {
        None
    } else {
        Some(build_globset(include_globs)?)
    };

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();

    let walker = WalkDir::new(root).follow_links(follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(|e| Error::invalid(format!("walk error: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let rel_str = if rel_str.is_empty() {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            rel_str
        };

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if let Some(include) = &include_set {
            if !include.is_match(&rel_str) {
                continue;
            }
        }

        match std::fs::read_to_string(path) {
            Ok(content) => items.push(FileItem {
                path: path.to_path_buf(),
                relative: rel_str,
                content,
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
            }
        }
    }

    // Sort for deterministic ordering
    items.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(items)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::invalid(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::invalid(format!("bad glob set: {}", e)))
}
