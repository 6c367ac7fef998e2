//! Error types for the bundling pipeline.
//!
//! Usage errors (duplicate registration, unclosed scope, missing source) and
//! consistency errors (marker mismatches) indicate a bug in the embedding
//! templates or in the pipeline itself and abort the current render's asset
//! handling. Build errors (timeout, commit failure, transform failure) affect
//! only the one key being built.

use std::path::PathBuf;
use thiserror::Error;

use crate::source::AssetKind;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BalerError>;

/// Errors surfaced by the bundling pipeline.
#[derive(Debug, Error)]
pub enum BalerError {
    /// The same identifier was registered twice within one render scope.
    #[error(
        "the same {kind} file was added to the bundle twice: `{identifier}`\n\
         check that the file is not included by two different bundle tags"
    )]
    DuplicateRegistration { kind: AssetKind, identifier: String },

    /// A registered identifier does not resolve to an existing file.
    #[error("cannot add `{identifier}` to the bundle: no such file at {}", .path.display())]
    SourceNotFound { identifier: String, path: PathBuf },

    /// `close()` was called more than once; the output location is ambiguous.
    #[error(
        "the {kind} bundle scope was closed more than once; \
         there must be exactly one output tag in the rendered template"
    )]
    ScopeAlreadyClosed { kind: AssetKind },

    /// Files were registered but the scope was never closed, so they would
    /// never be emitted.
    #[error(
        "{} {kind} files were registered but no output tag closed the scope: {}",
        .identifiers.len(),
        .identifiers.join(", ")
    )]
    UnclosedScope {
        kind: AssetKind,
        identifiers: Vec<String>,
    },

    /// The number of markers found in the rendered output differs from the
    /// number of registrations. The renderer produced output the scanner
    /// cannot see, or a registration happened in a code path that never
    /// rendered.
    #[error(
        "found {found} bundle markers in the rendered output but {registered} \
         files were registered; markers must not be emitted into output that \
         bypasses the scanner (e.g. error pages)"
    )]
    MarkerCountMismatch { found: usize, registered: usize },

    /// A marker was scanned whose identifier was never registered.
    #[error("bundle marker for `{identifier}` found in output but the file was never registered")]
    UnknownMarker { identifier: String },

    /// Waiting on another producer exceeded the maximum build duration.
    #[error("timed out waiting for artifact `{key}` to be built by another producer")]
    BuildTimeout { key: String },

    /// Atomic publish of a finished artifact failed.
    #[error(
        "wrote artifact to temporary path {} but could not move it to {}",
        .tmp.display(),
        .dest.display()
    )]
    CommitFailed {
        tmp: PathBuf,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The opaque transformation rejected a component.
    #[error(transparent)]
    Transform(#[from] crate::transform::TransformError),

    /// Storage or source I/O failure for the current build attempt.
    #[error("I/O error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl BalerError {
    /// Attach a path to a raw I/O error.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
