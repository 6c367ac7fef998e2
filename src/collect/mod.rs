//! Per-render asset collection and order recovery.
//!
//! Template fragments register source files in whatever order the renderer
//! happens to execute them, which is not necessarily the order their output
//! lands in the page. Each registration therefore emits an opaque marker
//! instead of a real reference; once rendering completes, the finished text
//! is scanned left-to-right and the markers' positions give the true output
//! order.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::config::{CachingStrategy, KindConfig};
use crate::deps::ImportGraph;
use crate::error::{BalerError, Result};
use crate::key::CacheKey;
use crate::source::{AssetKind, ResolvedManifest, SourceDescriptor};

/// Marker delimiters. HTML comment syntax cannot collide with ordinary
/// script/style output, and the `baler` token keeps human-authored comments
/// out of the scan.
const MARKER_END: &str = " -->";

/// Collects registrations for one asset kind within one render operation.
///
/// Owns all per-render mutable state; construct one per render, never share
/// across requests.
pub struct AssetCollector {
    kind: AssetKind,
    config: KindConfig,
    strategy: CachingStrategy,
    graph: Arc<ImportGraph>,
    registry: FxHashMap<String, SourceDescriptor>,
    request_key: Option<CacheKey>,
    marker_start: String,
}

impl AssetCollector {
    pub fn new(
        kind: AssetKind,
        config: KindConfig,
        strategy: CachingStrategy,
        graph: Arc<ImportGraph>,
    ) -> Self {
        Self {
            kind,
            config,
            strategy,
            graph,
            registry: FxHashMap::default(),
            request_key: None,
            marker_start: format!("<!-- baler {kind}: "),
        }
    }

    /// Register a source file for this bundle.
    ///
    /// Returns the marker text to emit in place of a real reference. Fails
    /// if the identifier is already registered in this scope or does not
    /// resolve to an existing file.
    pub fn register(&mut self, identifier: &str, transform: bool) -> Result<String> {
        if self.registry.contains_key(identifier) {
            return Err(BalerError::DuplicateRegistration {
                kind: self.kind,
                identifier: identifier.to_string(),
            });
        }

        let descriptor = SourceDescriptor::resolve(identifier, transform, &self.config.src_dir)?;
        crate::debug!("collect"; "adding {identifier} to {} bundle", self.kind);
        self.registry.insert(identifier.to_string(), descriptor);

        Ok(self.marker_for(identifier))
    }

    /// Close the registration scope and return the request key.
    ///
    /// Must be called exactly once per scope; a second call means the
    /// template emitted two output tags and the output location is
    /// ambiguous.
    pub fn close(&mut self) -> Result<CacheKey> {
        if self.request_key.is_some() {
            return Err(BalerError::ScopeAlreadyClosed { kind: self.kind });
        }

        let key = self.derive_request_key();
        crate::debug!(
            "collect";
            "closing {} scope with key {key} for {} files", self.kind, self.registry.len()
        );
        self.request_key = Some(key.clone());
        Ok(key)
    }

    /// The request key, if the scope has been closed.
    #[inline]
    pub fn request_key(&self) -> Option<&CacheKey> {
        self.request_key.as_ref()
    }

    #[inline]
    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    #[inline]
    pub fn registration_count(&self) -> usize {
        self.registry.len()
    }

    /// Recover output order by scanning the rendered text.
    ///
    /// Returns descriptors in the exact order their markers appear. Every
    /// marker must correspond to a registration and vice versa; a mismatch
    /// means the renderer produced output the scanner cannot see, or a
    /// registration happened in a code path that never rendered.
    pub fn reconcile(&self, rendered: &str) -> Result<ResolvedManifest> {
        if self.request_key.is_none() {
            if self.registry.is_empty() {
                // Nothing registered, nothing expected in the output
                return Ok(ResolvedManifest::empty(self.kind));
            }
            let mut identifiers: Vec<String> = self.registry.keys().cloned().collect();
            identifiers.sort();
            return Err(BalerError::UnclosedScope {
                kind: self.kind,
                identifiers,
            });
        }

        let found = self.scan(rendered);
        if found.len() != self.registry.len() {
            return Err(BalerError::MarkerCountMismatch {
                found: found.len(),
                registered: self.registry.len(),
            });
        }

        let mut components = Vec::with_capacity(found.len());
        for identifier in found {
            let Some(descriptor) = self.registry.get(&identifier) else {
                return Err(BalerError::UnknownMarker { identifier });
            };
            components.push(descriptor.clone());
        }

        Ok(ResolvedManifest {
            kind: self.kind,
            components,
        })
    }

    /// One linear pass over the rendered output, extracting the identifier
    /// between each delimiter pair.
    fn scan(&self, content: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut rest = content;

        while let Some(start) = rest.find(&self.marker_start) {
            let after = &rest[start + self.marker_start.len()..];
            let Some(end) = after.find(MARKER_END) else {
                break;
            };
            found.push(after[..end].to_string());
            rest = &after[end + MARKER_END.len()..];
        }

        found
    }

    fn marker_for(&self, identifier: &str) -> String {
        format!("{}{identifier}{MARKER_END}", self.marker_start)
    }

    /// Request key over the *sorted* registered identifiers: registration
    /// order is renderer-dependent and output order is not yet known, so
    /// sorting is the only deterministic choice at close time.
    fn derive_request_key(&self) -> CacheKey {
        let mut identifiers: Vec<&str> = self.registry.keys().map(String::as_str).collect();
        identifiers.sort_unstable();

        let salt_mtimes = self.strategy == CachingStrategy::Change;
        let parts = identifiers.into_iter().map(|id| {
            let descriptor = &self.registry[id];
            let mtime = salt_mtimes
                .then(|| self.graph.component_mtime(descriptor, &self.config));
            (id, mtime)
        });

        CacheKey::derive(parts, &self.config.extension)
    }
}
