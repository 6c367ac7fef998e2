//! Transitive import freshness for preprocessed sources.
//!
//! A preprocessed file (e.g. a `.less` stylesheet) is only as fresh as the
//! newest file it transitively imports. [`ImportGraph`] parses `@import`
//! directives, walks the closure with cycle protection, and reports the
//! effective last-modified time: the max over the file itself and everything
//! it reaches.
//!
//! The parsed import list is memoized per (path, own mtime), so editing a
//! file drops its memo without any explicit invalidation. The effective
//! timestamp itself is always derived from live stats over that graph: a
//! deep import's edit must propagate to importers whose own mtime (and
//! therefore memo key) is unchanged.

use dashmap::DashMap;
use regex::Regex;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::KindConfig;
use crate::source::SourceDescriptor;
use crate::utils::mtime::mtime_ms;
use crate::utils::path::normalize_path;

/// `@import "target"` — one capture per directive, possibly several per line.
static IMPORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@import\s*"(.*?)""#).expect("valid import regex"));

type MemoKey = (PathBuf, u64);

/// Import graph with per-file memoization.
///
/// Safe for concurrent use: entries are keyed by content identity and never
/// mutated in place.
pub struct ImportGraph {
    /// Direct imports per (path, own mtime)
    imports: DashMap<MemoKey, Vec<PathBuf>>,
    /// Extensions appended when an import target does not exist as written
    /// (e.g. `@import "colors"` meaning `colors.less`)
    fallback_extensions: Vec<String>,
}

impl ImportGraph {
    pub fn new(fallback_extensions: Vec<String>) -> Self {
        Self {
            imports: DashMap::new(),
            fallback_extensions,
        }
    }

    /// Effective last-modified time of a file, epoch millis.
    ///
    /// Max over the file's own mtime and the mtimes of every file it
    /// transitively imports. Missing files contribute 0.
    pub fn effective_mtime(&self, path: &Path) -> u64 {
        let root = normalize_path(path);
        let mut visited = FxHashSet::default();
        self.walk(&root, &mut visited)
    }

    /// Effective mtime of one manifest component: transitive for
    /// preprocessed inputs, a live stat otherwise.
    pub fn component_mtime(&self, descriptor: &SourceDescriptor, config: &KindConfig) -> u64 {
        if config.is_preprocessed(&descriptor.path) {
            self.effective_mtime(&descriptor.path)
        } else {
            descriptor.current_mtime_ms()
        }
    }

    fn walk(&self, path: &Path, visited: &mut FxHashSet<PathBuf>) -> u64 {
        if !visited.insert(path.to_path_buf()) {
            return 0;
        }

        let own = mtime_ms(path).unwrap_or(0);
        let mut latest = own;
        for import in self.direct_imports(path, own) {
            latest = latest.max(self.walk(&import, visited));
        }
        latest
    }

    /// Direct imports of a file, memoized by (path, own mtime).
    fn direct_imports(&self, path: &Path, own_mtime: u64) -> Vec<PathBuf> {
        let key = (path.to_path_buf(), own_mtime);
        if let Some(memo) = self.imports.get(&key) {
            crate::debug!("deps"; "import memo hit for {}", path.display());
            return memo.clone();
        }

        let imports = match self.parse_imports(path) {
            Ok(list) => list,
            Err(e) => {
                // Missing dependency tracking degrades staleness detection;
                // it must not fail the build
                crate::log!("error"; "could not read imports from {}: {e}", path.display());
                Vec::new()
            }
        };

        self.imports.insert(key, imports.clone());
        imports
    }

    fn parse_imports(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let text = std::fs::read_to_string(path)?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));

        let mut found = Vec::new();
        for line in text.lines() {
            for captures in IMPORT_PATTERN.captures_iter(line) {
                found.push(self.resolve_import(parent, &captures[1]));
            }
        }
        Ok(found)
    }

    /// Resolve an import target relative to the importing file, retrying
    /// with the fallback extensions when the literal target is missing.
    fn resolve_import(&self, parent: &Path, target: &str) -> PathBuf {
        let literal = parent.join(target);
        if literal.exists() {
            return normalize_path(&literal);
        }

        for ext in &self.fallback_extensions {
            let mut with_ext = literal.clone().into_os_string();
            with_ext.push(ext);
            let candidate = PathBuf::from(with_ext);
            if candidate.exists() {
                return normalize_path(&candidate);
            }
        }

        normalize_path(&literal)
    }

    /// Drop all memoized import lists.
    pub fn clear(&self) {
        self.imports.clear();
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.imports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn graph() -> ImportGraph {
        ImportGraph::new(vec![".less".to_string()])
    }

    fn set_mtime(path: &Path, epoch_secs: u64) {
        let time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(epoch_secs);
        let file = fs::File::options().append(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    #[test]
    fn plain_file_uses_own_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.css");
        fs::write(&path, "body {}").unwrap();
        set_mtime(&path, 1_000);

        assert_eq!(graph().effective_mtime(&path), 1_000_000);
    }

    #[test]
    fn import_raises_effective_mtime() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.less");
        let colors = dir.path().join("colors.less");
        fs::write(&main, "@import \"colors.less\";\nbody {}").unwrap();
        fs::write(&colors, "@c: #fff;").unwrap();
        set_mtime(&main, 1_000);
        set_mtime(&colors, 2_000);

        assert_eq!(graph().effective_mtime(&main), 2_000_000);
    }

    #[test]
    fn transitive_edit_propagates_through_unchanged_importers() {
        let dir = TempDir::new().unwrap();
        let x = dir.path().join("x.less");
        let y = dir.path().join("y.less");
        let z = dir.path().join("z.less");
        fs::write(&x, "@import \"y.less\";").unwrap();
        fs::write(&y, "@import \"z.less\";").unwrap();
        fs::write(&z, "@z: 1;").unwrap();
        set_mtime(&x, 1_000);
        set_mtime(&y, 1_100);
        set_mtime(&z, 1_200);

        let graph = graph();
        assert_eq!(graph.effective_mtime(&x), 1_200_000);

        // Touch only the deepest import; x and y keep their mtimes (and
        // their import memos), yet the new timestamp must surface
        set_mtime(&z, 5_000);
        assert_eq!(graph.effective_mtime(&x), 5_000_000);
    }

    #[test]
    fn import_cycles_terminate() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.less");
        let b = dir.path().join("b.less");
        fs::write(&a, "@import \"b.less\";").unwrap();
        fs::write(&b, "@import \"a.less\";").unwrap();
        set_mtime(&a, 1_000);
        set_mtime(&b, 2_000);

        assert_eq!(graph().effective_mtime(&a), 2_000_000);
    }

    #[test]
    fn missing_extension_falls_back() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.less");
        let colors = dir.path().join("colors.less");
        fs::write(&main, "@import \"colors\";").unwrap();
        fs::write(&colors, "@c: #fff;").unwrap();
        set_mtime(&main, 1_000);
        set_mtime(&colors, 3_000);

        assert_eq!(graph().effective_mtime(&main), 3_000_000);
    }

    #[test]
    fn edit_invalidates_import_memo() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.less");
        fs::write(&main, "body {}").unwrap();
        set_mtime(&main, 1_000);

        let graph = graph();
        graph.effective_mtime(&main);
        assert_eq!(graph.memo_len(), 1);

        // New mtime means a new memo key; the old entry is dead weight, not
        // a stale answer
        fs::write(&main, "@import \"other.less\";").unwrap();
        set_mtime(&main, 2_000);
        graph.effective_mtime(&main);
        assert_eq!(graph.memo_len(), 3); // old main, new main, other.less
    }

    #[test]
    fn unreadable_file_degrades_to_import_free() {
        let dir = TempDir::new().unwrap();
        let ghost = dir.path().join("ghost.less");
        // Never created: parse sees a missing file and reports no imports
        assert_eq!(graph().effective_mtime(&ghost), 0);
    }
}
