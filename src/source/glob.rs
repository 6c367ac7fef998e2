//! Wildcard expansion of source patterns.
//!
//! Resolves a potentially globbed identifier to a sorted list of concrete
//! identifiers:
//!
//! - `my-app/*.js`  — every `.js` file directly inside `my-app/`
//! - `my-app/**.js` — every `.js` file under `my-app/`, recursively
//! - `my-app/foo.js` — returned as-is (no glob characters)
//!
//! Partial filename patterns (`foo*.js`) are not supported. Results are
//! sorted bytewise so expansion order is deterministic across platforms.

use jwalk::WalkDir;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Trailing wildcard component: optional directory prefix, `*` or `**`, dot,
/// extension.
static GLOB_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:.*/)?(\*\*?)\.(\w+)$").expect("valid glob regex"));

/// Expand a pattern into concrete identifiers relative to `src_dir`.
///
/// Non-globbed patterns come back as a single-element list, untouched;
/// existence is the caller's concern either way.
pub fn expand(pattern: &str, src_dir: &Path) -> Vec<String> {
    let Some(captures) = GLOB_PATTERN.captures(pattern) else {
        return vec![pattern.to_string()];
    };

    let recursive = captures[1].len() == 2;
    let extension = format!(".{}", &captures[2]);

    // Strip the `*.ext` / `**.ext` tail, keeping any directory prefix
    let star_len = if recursive { 2 } else { 1 };
    let prefix = &pattern[..pattern.len() - extension.len() - star_len];
    let root = src_dir.join(prefix);

    let mut identifiers = if recursive {
        collect_recursive(&root, src_dir, &extension)
    } else {
        collect_flat(&root, src_dir, &extension)
    };

    identifiers.sort();
    identifiers
}

fn collect_flat(root: &Path, src_dir: &Path, extension: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| to_identifier(&path, src_dir, extension))
        .collect()
}

fn collect_recursive(root: &Path, src_dir: &Path, extension: &str) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| to_identifier(&entry.path(), src_dir, extension))
        .collect()
}

/// Convert a hit back to an identifier relative to the source dir, with
/// forward slashes.
fn to_identifier(path: &Path, src_dir: &Path, extension: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if !name.ends_with(extension) {
        return None;
    }
    let relative = path.strip_prefix(src_dir).ok()?;
    let identifier = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Some(identifier)
}
