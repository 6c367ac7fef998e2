//! Source descriptors and manifests.
//!
//! A [`SourceDescriptor`] is the immutable record of one registered source
//! file; a [`ResolvedManifest`] is the ordered list of descriptors that
//! defines one artifact.

pub mod glob;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{BalerError, Result};
use crate::utils::mtime::mtime_ms;
use crate::utils::path::normalize_path;

/// The two bundled asset kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Script,
    Style,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Script => "script",
            Self::Style => "style",
        })
    }
}

/// One registered source file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Logical path as given at registration, relative to the source dir
    pub identifier: String,
    /// Absolute location on disk
    pub path: PathBuf,
    /// Whether this input is run through the transformation (false = copied
    /// verbatim)
    pub transform: bool,
    /// Last-modified time captured at registration, epoch millis
    pub mtime_ms: u64,
}

impl SourceDescriptor {
    /// Resolve an identifier against a source directory.
    ///
    /// Fails with [`BalerError::SourceNotFound`] if no file exists there.
    pub fn resolve(identifier: &str, transform: bool, src_dir: &Path) -> Result<Self> {
        let path = normalize_path(&src_dir.join(identifier));
        let Some(mtime) = mtime_ms(&path) else {
            return Err(BalerError::SourceNotFound {
                identifier: identifier.to_string(),
                path,
            });
        };

        Ok(Self {
            identifier: identifier.to_string(),
            path,
            transform,
            mtime_ms: mtime,
        })
    }

    /// Live re-stat of the file's mtime (0 if the file vanished).
    ///
    /// Staleness checks compare against the file as it is now, not as it
    /// was at registration.
    #[inline]
    pub fn current_mtime_ms(&self) -> u64 {
        mtime_ms(&self.path).unwrap_or(0)
    }

    /// Final path segment of the identifier (for transform diagnostics).
    pub fn file_name(&self) -> &str {
        self.identifier
            .rsplit('/')
            .next()
            .unwrap_or(&self.identifier)
    }
}

/// The ordered list of source descriptors defining one artifact.
///
/// Order is the position of each component's marker in the rendered output,
/// not registration order.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub kind: AssetKind,
    pub components: Vec<SourceDescriptor>,
}

impl ResolvedManifest {
    /// An empty manifest (nothing registered, nothing to build).
    pub fn empty(kind: AssetKind) -> Self {
        Self {
            kind,
            components: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceDescriptor> {
        self.components.iter()
    }

    /// Identifiers in manifest order.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|d| d.identifier.as_str())
    }
}
