//! Explicit per-render context.
//!
//! One `RenderSession` brackets one render operation: `begin` before the
//! template runs, registrations and scope closes while it runs, `finish`
//! with the completed output text. All per-render mutable state lives here;
//! nothing is ambient or global.

use std::sync::Arc;

use crate::cache::BundleCache;
use crate::collect::AssetCollector;
use crate::error::Result;
use crate::key::CacheKey;
use crate::source::{AssetKind, glob};

pub struct RenderSession {
    cache: Arc<BundleCache>,
    script: AssetCollector,
    style: AssetCollector,
}

impl RenderSession {
    /// Begin a render's asset collection scope.
    pub fn begin(cache: Arc<BundleCache>) -> Self {
        let config = cache.config();
        let script = AssetCollector::new(
            AssetKind::Script,
            config.script.clone(),
            config.strategy,
            Arc::clone(cache.graph(AssetKind::Script)),
        );
        let style = AssetCollector::new(
            AssetKind::Style,
            config.style.clone(),
            config.strategy,
            Arc::clone(cache.graph(AssetKind::Style)),
        );

        Self {
            cache,
            script,
            style,
        }
    }

    /// Whether the pipeline is switched on. When off, the host should emit
    /// plain source references and never call the registration methods.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.cache.config().enabled
    }

    /// Register one source file, returning the marker to emit in its place.
    pub fn register(&mut self, kind: AssetKind, identifier: &str, transform: bool) -> Result<String> {
        self.collector_mut(kind).register(identifier, transform)
    }

    /// Register a potentially-globbed pattern.
    ///
    /// Expands `*.ext` / `**.ext` patterns against the kind's source dir and
    /// registers every match; the returned text carries one marker per line.
    pub fn register_pattern(
        &mut self,
        kind: AssetKind,
        pattern: &str,
        transform: bool,
    ) -> Result<String> {
        let src_dir = self.cache.config().kind(kind).src_dir.clone();
        let collector = self.collector_mut(kind);

        let mut markers = String::new();
        for identifier in glob::expand(pattern, &src_dir) {
            markers.push_str(&collector.register(&identifier, transform)?);
            markers.push('\n');
        }
        Ok(markers)
    }

    /// Close the kind's registration scope, returning the request key the
    /// host turns into the artifact URL.
    pub fn close(&mut self, kind: AssetKind) -> Result<CacheKey> {
        self.collector_mut(kind).close()
    }

    /// Complete the render: recover output order from the rendered text and
    /// publish each closed scope's manifest.
    ///
    /// Returns the (kind, request key) pairs that were published. Scopes
    /// with no registrations and no close are skipped silently; everything
    /// else is validated per the collector's reconciliation rules.
    pub fn finish(self, rendered: &str) -> Result<Vec<(AssetKind, CacheKey)>> {
        let mut published = Vec::new();

        for collector in [&self.script, &self.style] {
            let manifest = collector.reconcile(rendered)?;
            if let Some(key) = collector.request_key() {
                self.cache.publish(key, manifest)?;
                published.push((collector.kind(), key.clone()));
            }
        }

        Ok(published)
    }

    fn collector_mut(&mut self, kind: AssetKind) -> &mut AssetCollector {
        match kind {
            AssetKind::Script => &mut self.script,
            AssetKind::Style => &mut self.style,
        }
    }
}
