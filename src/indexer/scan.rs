//! Source file discovery.
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::fingerprint::fingerprint;
use super::languages::language_for_extension;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("source root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("invalid exclusion pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },
}

/// A readable source file with its content loaded.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the scan root, `/`-separated.
    pub relative_path: String,
    pub language: &'static str,
    pub fingerprint: String,
    pub content: String,
}

/// A file that looked like source but could not be loaded.
#[derive(Debug, Clone, Serialize)]
pub struct ScanFailure {
    pub path: String,
    pub reason: String,
}

impl ScanFailure {
    /// True if `path` is this entry or lies beneath it.
    pub fn covers(&self, path: &str) -> bool {
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<ScannedFile>,
    pub failures: Vec<ScanFailure>,
}

fn build_exclusions(patterns: &[String]) -> Result<GlobSet, ScanError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ScanError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ScanError::InvalidPattern {
        pattern: patterns.join(", "),
        source,
    })
}

/// The entry a walk error is about, if it names one.
fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ignore::Error::Loop { child, .. } => Some(child.as_path()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

fn failure_path(root: &Path, err: &ignore::Error) -> String {
    match error_path(err) {
        Some(path) => relative_path(root, path),
        None => root.display().to_string(),
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel,
        // Scanning a single file
        _ => path.file_name().map(Path::new).unwrap_or(path),
    };
    rel.to_string_lossy().replace('\\', "/")
}

/// Walks `root` (honouring `.gitignore`), keeping files with a known source
/// extension that match none of `exclusions`.
pub fn scan(root: &Path, exclusions: &[String]) -> Result<ScanResult, ScanError> {
    if !root.exists() {
        return Err(ScanError::RootNotFound(root.to_path_buf()));
    }
    let excluded = build_exclusions(exclusions)?;

    let mut result = ScanResult::default();

    // Walk builder respects .gitignore by default
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .require_git(false)
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {e}");
                result.failures.push(ScanFailure {
                    path: failure_path(root, &e),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let Some(language) = language_for_extension(&ext) else {
            continue;
        };

        let rel = relative_path(root, path);
        if excluded.is_match(&rel) {
            debug!("Excluded {rel}");
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read {rel}: {e}");
                result.failures.push(ScanFailure {
                    path: rel,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                warn!("Skipping {rel}: not valid UTF-8");
                result.failures.push(ScanFailure {
                    path: rel,
                    reason: "not valid UTF-8".to_string(),
                });
                continue;
            }
        };

        result.files.push(ScannedFile {
            relative_path: rel,
            language,
            fingerprint: fingerprint(&content),
            content,
        });
    }

    result
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    info!(
        "Scanned {}: {} source files, {} unreadable",
        root.display(),
        result.files.len(),
        result.failures.len()
    );
    Ok(result)
}
