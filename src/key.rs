//! Cache key derivation.
//!
//! Keys are blake3 digests over the ordered component identifiers (plus
//! each component's effective mtime under the `Change` strategy), truncated
//! and remapped into ASCII letters so they are safe in a URL path segment
//! and survive the host's URL escaping unchanged.

use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::fmt;

/// Length of the derived key stem, before the extension suffix.
const KEY_LEN: usize = 32;

/// A derived cache key: fixed-length letter stem plus the artifact
/// extension (e.g. `QJcKeFbbAdeHfcAcbGdeeBbfDbcAGaff.js`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from ordered (identifier, mtime) pairs.
    ///
    /// `mtime` is `None` except under the `Change` strategy, where it is the
    /// component's effective last-modified time.
    pub fn derive<'a>(
        parts: impl IntoIterator<Item = (&'a str, Option<u64>)>,
        extension: &str,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (identifier, mtime) in parts {
            hasher.update(identifier.as_bytes());
            hasher.update(&[0]);
            if let Some(ms) = mtime {
                hasher.update(&ms.to_le_bytes());
            }
        }

        let digest = hex::encode(hasher.finalize().as_bytes());
        Self(format!("{}{extension}", letters_only(&digest[..KEY_LEN])))
    }

    /// A key fixed by the caller rather than derived (single-file artifacts
    /// keep their own name, e.g. `widget.min.js`).
    pub fn fixed(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministically remap any non-letter character to a letter.
fn letters_only(digest: &str) -> String {
    digest
        .bytes()
        .map(|b| {
            if b.is_ascii_alphabetic() {
                b as char
            } else {
                (b'A' + b % 26) as char
            }
        })
        .collect()
}

/// Escape a key for embedding in a URL (the exposure seam).
pub fn escape(key: &str) -> String {
    utf8_percent_encode(key, NON_ALPHANUMERIC).to_string()
}

/// Reverse [`escape`].
pub fn unescape(key: &str) -> String {
    percent_decode_str(key).decode_utf8_lossy().into_owned()
}
