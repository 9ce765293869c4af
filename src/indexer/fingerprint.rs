//! Content fingerprints, chunk ids and project keys.
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("valid regex"));
static SSH_REMOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+@([^:/]+):(.+)$").expect("valid regex"));

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `sha256:<hex>` of the file content.
pub fn fingerprint(content: &str) -> String {
    format!("sha256:{}", sha256_hex(content.as_bytes()))
}

/// Stable chunk id: first 32 hex chars of sha256(`path:start:end`).
pub fn chunk_id(path: &str, start_line: usize, end_line: usize) -> String {
    let mut id = sha256_hex(format!("{path}:{start_line}:{end_line}").as_bytes());
    id.truncate(32);
    id
}

/// Replace anything outside `[A-Za-z0-9_-]` with `_`, trimmed of underscores.
pub fn sanitize_key(raw: &str) -> String {
    let sanitized = UNSAFE_CHARS.replace_all(raw, "_");
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize a git remote so SSH and HTTPS clones of one repository agree:
/// `git@host:user/repo.git` and `https://host/user/repo` both become
/// `host/user/repo`.
pub fn normalize_remote_url(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_suffix(".git").unwrap_or(url);
    if let Some(caps) = SSH_REMOTE.captures(url) {
        return format!("{}/{}", &caps[1], &caps[2]);
    }
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("ssh://"))
        .unwrap_or(url);
    // ssh://git@host/path
    match url.split_once('@') {
        Some((user, rest)) if !user.contains('/') => rest.to_string(),
        _ => url.to_string(),
    }
}

fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Reads `remote "origin"`'s url out of `.git/config`.
fn origin_url(git_root: &Path) -> Option<String> {
    let config = std::fs::read_to_string(git_root.join(".git").join("config")).ok()?;
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == r#"[remote "origin"]"#;
            continue;
        }
        if in_origin {
            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == "url" {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

/// Stable key of the project rooted at `root`.
///
/// An explicit key wins. Otherwise a repository with an `origin` remote is
/// keyed by its name and remote (so every clone shares one index), and any
/// other directory by its name and canonical path.
pub fn project_key(root: &Path, explicit: Option<&str>) -> String {
    if let Some(key) = explicit {
        return sanitize_key(key);
    }

    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    if let Some(git_root) = find_git_root(&canonical) {
        if let Some(url) = origin_url(&git_root) {
            let name = git_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let hash = sha256_hex(normalize_remote_url(&url).as_bytes());
            return format!("{}_{}", sanitize_key(&name), &hash[..8]);
        }
    }

    let name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hash = sha256_hex(canonical.to_string_lossy().as_bytes());
    format!("{}_{}", sanitize_key(&name), &hash[..8])
}
