//! The opaque transformation seam.
//!
//! Concrete minifiers and preprocessors live outside this crate; the build
//! engine only needs something that maps source text to output text and may
//! fail on malformed input.

use std::fmt;

/// An opaque transformation applied to components whose `transform` flag is
/// set. Implementations must be shareable across builder threads.
pub trait Transform: Send + Sync {
    /// Transform one component, appending the result to `out`.
    ///
    /// `file_name` identifies the component in diagnostics only.
    fn transform(
        &self,
        file_name: &str,
        source: &str,
        out: &mut String,
    ) -> Result<(), TransformError>;
}

/// Failure reported by a [`Transform`] implementation.
#[derive(Debug, Clone)]
pub struct TransformError {
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
}

impl TransformError {
    pub fn new(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            message: message.into(),
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}: {}", self.file, self.message),
            None => write!(f, "{}: {}", self.file, self.message),
        }
    }
}

impl std::error::Error for TransformError {}

/// Copies input to output untouched. Useful as a default and in tests.
pub struct Passthrough;

impl Transform for Passthrough {
    fn transform(
        &self,
        _file_name: &str,
        source: &str,
        out: &mut String,
    ) -> Result<(), TransformError> {
        out.push_str(source);
        Ok(())
    }
}

/// A visibly-broken stylesheet describing a preprocessing failure.
///
/// Substituted for the component's output so a broken import degrades the
/// page visibly instead of failing the whole response.
pub fn error_stylesheet(err: &TransformError) -> String {
    let description = err.to_string().replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "body:before {{ display: block; color: #c00; white-space: pre; \
         font-family: monospace; background: #fdd9e1; \
         border-top: 1px solid pink; border-bottom: 1px solid pink; \
         padding: 10px; content: \"[STYLE ERROR] {description}\"; }}\n"
    )
}
