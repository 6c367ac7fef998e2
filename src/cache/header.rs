//! Artifact manifest header: the staleness oracle embedded in every artifact.
//!
//! The first line of every built artifact records, per component, whether it
//! was transformed and what its mtime was at build time. Comparing those
//! pairs against the live files detects input changes independently of the
//! cache key, which is what lets the content-independent `Always` key still
//! notice edits.

use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use crate::source::ResolvedManifest;

/// Signature token identifying artifacts built by this pipeline.
pub const SIGNATURE: &str = "baler-1.0";

const FLAG_TRANSFORMED: char = 't';
const FLAG_VERBATIM: char = 'v';

/// `/*baler-1.0|<flag><ts>:<flag><ts>:...*/`
static HEADER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/\*baler-1\.0\|(.*?)\*/$").expect("valid header regex"));

/// Build the header line for a manifest.
///
/// Wrapped in a block comment so the artifact stays valid script/style text.
pub fn build(manifest: &ResolvedManifest) -> String {
    let entries: Vec<String> = manifest
        .iter()
        .map(|d| {
            let flag = if d.transform {
                FLAG_TRANSFORMED
            } else {
                FLAG_VERBATIM
            };
            format!("{flag}{}", d.mtime_ms)
        })
        .collect();

    format!("/*{SIGNATURE}|{}*/\n", entries.join(":"))
}

/// Parse the ordered (transform, mtime) pairs out of an artifact.
///
/// Returns `None` for a missing signature or any malformed pair; callers
/// treat that as "stale, rebuild".
pub fn parse(artifact: &[u8]) -> Option<Vec<(bool, u64)>> {
    let line_end = artifact.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&artifact[..line_end]).ok()?;
    let captures = HEADER_PATTERN.captures(line)?;

    let body = &captures[1];
    if body.is_empty() {
        return Some(Vec::new());
    }

    body.split(':')
        .map(|entry| {
            let transform = match entry.chars().next()? {
                FLAG_TRANSFORMED => true,
                FLAG_VERBATIM => false,
                _ => return None,
            };
            let mtime = entry[1..].parse::<u64>().ok()?;
            Some((transform, mtime))
        })
        .collect()
}

/// Whether an artifact's header exactly matches the manifest against the
/// files as they are *now*: same length, pairwise equal flags and mtimes.
pub fn matches_manifest(artifact: &[u8], manifest: &ResolvedManifest) -> bool {
    let Some(entries) = parse(artifact) else {
        return false;
    };
    if entries.len() != manifest.len() {
        return false;
    }

    manifest
        .iter()
        .zip(entries)
        .all(|(d, (transform, mtime))| d.transform == transform && d.current_mtime_ms() == mtime)
}

/// Whether a file on disk starts with the signature header.
///
/// Used by the sweep to distinguish built artifacts from unrelated files
/// that happen to share the output directory. Only the first line is read,
/// and no more than a small bound of it.
pub fn file_has_signature(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };

    let mut line = String::new();
    let mut reader = BufReader::new(file.take(8 * 1024));
    if reader.read_line(&mut line).is_err() {
        return false;
    }

    HEADER_PATTERN.is_match(line.trim_end_matches(['\r', '\n']))
}

/// A minimal valid header for store tests.
#[cfg(test)]
pub fn test_header() -> String {
    format!("/*{SIGNATURE}|t0*/\n")
}
