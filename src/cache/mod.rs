//! Single-flight build cache.
//!
//! `BundleCache` is the shared engine behind every render: given a resolved
//! manifest it returns the cached artifact or builds it, guaranteeing at
//! most one concurrent producer per cache key, committing atomically, and
//! embedding the manifest header that later staleness checks read back.

pub mod header;
mod registry;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use registry::ManifestRegistry;

use crate::config::{CachingStrategy, Config};
use crate::deps::ImportGraph;
use crate::error::{BalerError, Result};
use crate::key::CacheKey;
use crate::source::{AssetKind, ResolvedManifest, SourceDescriptor};
use crate::store::{ArtifactStore, WriteHandle, open_store};
use crate::transform::{Transform, error_stylesheet};

/// Per-key wait slot for in-process waiters.
#[derive(Default)]
struct BuildSlot {
    lock: Mutex<()>,
    cond: Condvar,
}

/// The shared build engine. One instance per process, used by every
/// concurrent render.
pub struct BundleCache {
    config: Arc<Config>,
    script_store: Arc<dyn ArtifactStore>,
    style_store: Arc<dyn ArtifactStore>,
    script_graph: Arc<ImportGraph>,
    style_graph: Arc<ImportGraph>,
    registry: ManifestRegistry,
    slots: DashMap<String, Arc<BuildSlot>>,
}

impl BundleCache {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let max_build = config.max_build();

        Self {
            script_store: open_store(config.storage, &config.script.out_dir, max_build),
            style_store: open_store(config.storage, &config.style.out_dir, max_build),
            script_graph: Arc::new(ImportGraph::new(
                config.script.preprocessed_extensions.clone(),
            )),
            style_graph: Arc::new(ImportGraph::new(
                config.style.preprocessed_extensions.clone(),
            )),
            registry: ManifestRegistry::new(config.manifest_ttl()),
            slots: DashMap::new(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The import graph for an asset kind (shared with collectors so key
    /// derivation and builds agree on effective mtimes).
    #[inline]
    pub fn graph(&self, kind: AssetKind) -> &Arc<ImportGraph> {
        match kind {
            AssetKind::Script => &self.script_graph,
            AssetKind::Style => &self.style_graph,
        }
    }

    #[inline]
    fn store(&self, kind: AssetKind) -> &Arc<dyn ArtifactStore> {
        match kind {
            AssetKind::Script => &self.script_store,
            AssetKind::Style => &self.style_store,
        }
    }

    /// Register a reconciled manifest under its request key.
    ///
    /// Re-verifies that every component still exists: the gap between
    /// registration and publication is small, but a vanished file here
    /// would otherwise surface much later as a confusing build failure.
    pub fn publish(&self, request_key: &CacheKey, manifest: ResolvedManifest) -> Result<()> {
        for descriptor in manifest.iter() {
            if !descriptor.path.exists() {
                return Err(BalerError::SourceNotFound {
                    identifier: descriptor.identifier.clone(),
                    path: descriptor.path.clone(),
                });
            }
        }

        crate::debug!(
            "cache";
            "publishing manifest of {} files under key {request_key}", manifest.len()
        );
        self.registry.insert(request_key, manifest);
        Ok(())
    }

    /// Fetch (building if needed) the artifact for a previously published
    /// request key.
    ///
    /// Returns `None` when the key is unknown or its manifest expired —
    /// normally a very long delay between rendering and the fetch. The host
    /// should answer with a benign explanation, not an error page.
    pub fn get_for_request(
        &self,
        request_key: &str,
        transform: &dyn Transform,
    ) -> Result<Option<Vec<u8>>> {
        let Some(manifest) = self.registry.get(request_key) else {
            crate::debug!("cache"; "no manifest for request key {request_key}");
            return Ok(None);
        };
        self.get_or_build(&manifest, transform).map(Some)
    }

    /// Return the cached artifact for a manifest, or build it.
    pub fn get_or_build(
        &self,
        manifest: &ResolvedManifest,
        transform: &dyn Transform,
    ) -> Result<Vec<u8>> {
        let key = self.artifact_key(manifest);
        self.get_or_build_at(&key, manifest, transform)
    }

    /// Build (or fetch) a single file as its own artifact.
    ///
    /// The artifact keeps the source's name with `.min` inserted before the
    /// extension, e.g. `widget.js` → `widget.min.js`.
    pub fn single_file(
        &self,
        kind: AssetKind,
        identifier: &str,
        transform: &dyn Transform,
    ) -> Result<Vec<u8>> {
        let kind_config = self.config.kind(kind);
        let descriptor = SourceDescriptor::resolve(identifier, true, &kind_config.src_dir)?;
        let key = CacheKey::fixed(min_name(identifier));
        let manifest = ResolvedManifest {
            kind,
            components: vec![descriptor],
        };
        self.get_or_build_at(&key, &manifest, transform)
    }

    /// Sweep both stores. Returns the number of artifacts removed.
    pub fn clear(&self) -> usize {
        self.script_store.clear(&self.config.script.extension)
            + self.style_store.clear(&self.config.style.extension)
    }

    // -------------------------------------------------------------------------
    // Build path
    // -------------------------------------------------------------------------

    fn get_or_build_at(
        &self,
        key: &CacheKey,
        manifest: &ResolvedManifest,
        transform: &dyn Transform,
    ) -> Result<Vec<u8>> {
        let store = self.store(manifest.kind);
        crate::debug!("cache"; "caching strategy is {}", self.config.strategy);

        if let Some(bytes) = self.cached(store, key, manifest)? {
            crate::debug!("cache"; "using existing artifact {key}");
            return Ok(bytes);
        }

        let deadline = Instant::now() + self.config.max_build();
        loop {
            match store.start_write(key.as_str())? {
                Some(handle) => {
                    let slot = self.slot(key.as_str());
                    let result = self.write_artifact(handle, key, manifest, transform);

                    // Wake waiters whether the build succeeded or not; on
                    // failure they will retry and surface their own error
                    {
                        let _guard = slot.lock.lock();
                        slot.cond.notify_all();
                    }
                    self.slots.remove(key.as_str());

                    result?;
                    return store.open(key.as_str());
                }
                None => {
                    // Another producer owns this key: wait for it, bounded
                    // by the maximum build duration
                    let slot = self.slot(key.as_str());
                    let timed_out = {
                        let mut guard = slot.lock.lock();
                        // The producer may have committed between our
                        // start_write and taking the slot lock
                        if let Some(bytes) = self.cached(store, key, manifest)? {
                            return Ok(bytes);
                        }
                        slot.cond.wait_until(&mut guard, deadline).timed_out()
                    };

                    // The other producer's result supersedes our need to
                    // build; re-check before concluding anything
                    if let Some(bytes) = self.cached(store, key, manifest)? {
                        return Ok(bytes);
                    }
                    if timed_out {
                        return Err(BalerError::BuildTimeout {
                            key: key.as_str().to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Strategy-gated cache check.
    ///
    /// Under `Change` the key already embeds every component's mtime, so
    /// existence alone proves freshness. Under `Always` the key never
    /// changes, so the embedded header is compared against the live files.
    fn cached(
        &self,
        store: &Arc<dyn ArtifactStore>,
        key: &CacheKey,
        manifest: &ResolvedManifest,
    ) -> Result<Option<Vec<u8>>> {
        if self.config.strategy == CachingStrategy::Never {
            return Ok(None);
        }
        if !store.exists(key.as_str()) {
            crate::debug!("cache"; "artifact {key} does not yet exist");
            return Ok(None);
        }

        let bytes = store.open(key.as_str())?;
        let fresh = match self.config.strategy {
            CachingStrategy::Never => false,
            CachingStrategy::Change => true,
            CachingStrategy::Always => header::matches_manifest(&bytes, manifest),
        };

        if !fresh {
            crate::debug!("cache"; "component files for {key} have changed");
        }
        Ok(fresh.then_some(bytes))
    }

    fn write_artifact(
        &self,
        mut handle: Box<dyn WriteHandle>,
        key: &CacheKey,
        manifest: &ResolvedManifest,
        transform: &dyn Transform,
    ) -> Result<()> {
        let kind_config = self.config.kind(manifest.kind);
        crate::debug!(
            "cache";
            "generating artifact {key} from {} component files", manifest.len()
        );
        let started = Instant::now();

        let io_err = |e| BalerError::io(std::path::PathBuf::from(key.as_str()), e);

        handle
            .write_all(header::build(manifest).as_bytes())
            .map_err(io_err)?;

        for descriptor in manifest.iter() {
            let source = std::fs::read_to_string(&descriptor.path)
                .map_err(|e| BalerError::io(descriptor.path.clone(), e))?;

            if descriptor.transform {
                let mut out = String::new();
                match transform.transform(descriptor.file_name(), &source, &mut out) {
                    Ok(()) => handle.write_all(out.as_bytes()).map_err(io_err)?,
                    Err(err)
                        if manifest.kind == AssetKind::Style
                            && kind_config.is_preprocessed(&descriptor.path) =>
                    {
                        // A broken style import degrades the page visibly
                        // instead of failing the whole response
                        crate::log!(
                            "error";
                            "style preprocessing failed, substituting error stylesheet: {err}"
                        );
                        handle
                            .write_all(error_stylesheet(&err).as_bytes())
                            .map_err(io_err)?;
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                // Verbatim components are copied exactly once
                handle.write_all(source.as_bytes()).map_err(io_err)?;
            }
        }

        handle.commit()?;
        crate::debug!(
            "cache";
            "artifact {key} generated in {} ms", started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Artifact key over the ordered manifest.
    fn artifact_key(&self, manifest: &ResolvedManifest) -> CacheKey {
        let kind_config = self.config.kind(manifest.kind);
        let graph = self.graph(manifest.kind);
        let salt_mtimes = self.config.strategy == CachingStrategy::Change;

        let parts = manifest.iter().map(|descriptor| {
            let mtime = salt_mtimes.then(|| graph.component_mtime(descriptor, kind_config));
            (descriptor.identifier.as_str(), mtime)
        });

        CacheKey::derive(parts, &kind_config.extension)
    }

    fn slot(&self, key: &str) -> Arc<BuildSlot> {
        self.slots.entry(key.to_string()).or_default().clone()
    }
}

/// `app/widget.js` → `app/widget.min.js`
fn min_name(identifier: &str) -> String {
    match identifier.rfind('.') {
        Some(dot) => format!("{}.min{}", &identifier[..dot], &identifier[dot..]),
        None => format!("{identifier}.min"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KindConfig, StorageKind};
    use crate::transform::{Passthrough, TransformError};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Uppercases input and counts invocations.
    struct CountingTransform(AtomicUsize);

    impl CountingTransform {
        fn new() -> Self {
            Self(AtomicUsize::new(0))
        }

        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Transform for CountingTransform {
        fn transform(
            &self,
            _file_name: &str,
            source: &str,
            out: &mut String,
        ) -> std::result::Result<(), TransformError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            out.push_str(&source.to_uppercase());
            Ok(())
        }
    }

    /// Always fails.
    struct BrokenTransform;

    impl Transform for BrokenTransform {
        fn transform(
            &self,
            file_name: &str,
            _source: &str,
            _out: &mut String,
        ) -> std::result::Result<(), TransformError> {
            Err(TransformError::new(file_name, "unexpected token").with_line(3))
        }
    }

    fn test_config(root: &Path, strategy: CachingStrategy, storage: StorageKind) -> Config {
        let mut config = Config::default();
        config.strategy = strategy;
        config.storage = storage;
        config.script = KindConfig {
            src_dir: root.join("js"),
            out_dir: root.join("js/bundle"),
            extension: ".js".to_string(),
            preprocessed_extensions: Vec::new(),
        };
        config.style = KindConfig {
            src_dir: root.join("css"),
            out_dir: root.join("css/bundle"),
            extension: ".css".to_string(),
            preprocessed_extensions: vec![".less".to_string()],
        };
        fs::create_dir_all(root.join("js")).unwrap();
        fs::create_dir_all(root.join("css")).unwrap();
        config
    }

    fn script_manifest(cache: &BundleCache, names: &[&str]) -> ResolvedManifest {
        let src_dir = &cache.config().script.src_dir;
        let components = names
            .iter()
            .map(|name| SourceDescriptor::resolve(name, true, src_dir).unwrap())
            .collect();
        ResolvedManifest {
            kind: AssetKind::Script,
            components,
        }
    }

    fn touch_later(path: &Path, secs_ahead: u64) {
        let time = std::time::SystemTime::now() + std::time::Duration::from_secs(secs_ahead);
        let file = fs::File::options().append(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    #[test]
    fn builds_header_plus_components_in_order() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();
        fs::write(dir.path().join("js/b.js"), "var b;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["b.js", "a.js"]);
        let bytes = cache.get_or_build(&manifest, &CountingTransform::new()).unwrap();

        let text = String::from_utf8(bytes).unwrap();
        let (first_line, body) = text.split_once('\n').unwrap();
        assert!(first_line.starts_with("/*baler-1.0|t"));
        assert_eq!(body, "VAR B;VAR A;");
    }

    #[test]
    fn verbatim_components_are_copied_exactly_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        fs::write(dir.path().join("js/lib.min.js"), "already(min);").unwrap();

        let cache = BundleCache::new(config);
        let src_dir = cache.config().script.src_dir.clone();
        let descriptor = SourceDescriptor::resolve("lib.min.js", false, &src_dir).unwrap();
        let manifest = ResolvedManifest {
            kind: AssetKind::Script,
            components: vec![descriptor],
        };

        let counting = CountingTransform::new();
        let bytes = cache.get_or_build(&manifest, &counting).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(counting.calls(), 0);
        assert_eq!(text.matches("already(min);").count(), 1);
    }

    #[test]
    fn second_build_is_a_cache_hit() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Disk);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js"]);
        let counting = CountingTransform::new();

        let first = cache.get_or_build(&manifest, &counting).unwrap();
        let second = cache.get_or_build(&manifest, &counting).unwrap();

        assert_eq!(counting.calls(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn always_strategy_rebuilds_on_header_mismatch() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Disk);
        let source = dir.path().join("js/a.js");
        fs::write(&source, "var a;").unwrap();

        let cache = BundleCache::new(config);
        let counting = CountingTransform::new();
        let first = cache
            .get_or_build(&script_manifest(&cache, &["a.js"]), &counting)
            .unwrap();

        // Mutate the component: same identifier, new bytes and mtime. The
        // key is unchanged, the header comparison must catch it
        fs::write(&source, "var changed;").unwrap();
        touch_later(&source, 5);

        let second = cache
            .get_or_build(&script_manifest(&cache, &["a.js"]), &counting)
            .unwrap();

        assert_eq!(counting.calls(), 2);
        assert_ne!(first, second);
        assert!(String::from_utf8(second).unwrap().contains("VAR CHANGED;"));
    }

    #[test]
    fn change_strategy_moves_to_a_new_key_on_edit() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Change, StorageKind::Disk);
        let source = dir.path().join("js/a.js");
        fs::write(&source, "var a;").unwrap();

        let cache = BundleCache::new(config);
        let out_dir = cache.config().script.out_dir.clone();
        cache
            .get_or_build(&script_manifest(&cache, &["a.js"]), &CountingTransform::new())
            .unwrap();

        touch_later(&source, 5);
        cache
            .get_or_build(&script_manifest(&cache, &["a.js"]), &CountingTransform::new())
            .unwrap();

        // The old key's artifact is an orphan awaiting an explicit sweep
        let artifacts = fs::read_dir(&out_dir).unwrap().count();
        assert_eq!(artifacts, 2);
    }

    #[test]
    fn never_strategy_rebuilds_every_time() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Never, StorageKind::Memory);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js"]);
        let counting = CountingTransform::new();

        cache.get_or_build(&manifest, &counting).unwrap();
        cache.get_or_build(&manifest, &counting).unwrap();
        assert_eq!(counting.calls(), 2);
    }

    #[test]
    fn single_flight_under_concurrency() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Disk);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();
        fs::write(dir.path().join("js/b.js"), "var b;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js", "b.js"]);
        let counting = CountingTransform::new();

        let results: Vec<Vec<u8>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| cache.get_or_build(&manifest, &counting).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Exactly one execution of the transformation per component
        assert_eq!(counting.calls(), 2);
        for bytes in &results[1..] {
            assert_eq!(bytes, &results[0]);
        }
    }

    #[test]
    fn request_key_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js"]);
        let request_key = CacheKey::fixed("requestkeyAAAA.js");

        cache.publish(&request_key, manifest).unwrap();
        let bytes = cache
            .get_for_request(request_key.as_str(), &Passthrough)
            .unwrap()
            .expect("manifest should be registered");
        assert!(bytes.starts_with(b"/*baler-1.0|"));
    }

    #[test]
    fn unknown_request_key_is_none() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        let cache = BundleCache::new(config);

        let result = cache.get_for_request("ghost.js", &Passthrough).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn publish_reverifies_component_existence() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        let source = dir.path().join("js/a.js");
        fs::write(&source, "var a;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js"]);

        fs::remove_file(&source).unwrap();
        let err = cache
            .publish(&CacheKey::fixed("k.js"), manifest)
            .unwrap_err();
        assert!(matches!(err, BalerError::SourceNotFound { .. }));
    }

    #[test]
    fn broken_style_preprocessing_substitutes_error_stylesheet() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        fs::write(dir.path().join("css/main.less"), "@import \"ghost\";").unwrap();

        let cache = BundleCache::new(config);
        let style_src = cache.config().style.src_dir.clone();
        let descriptor = SourceDescriptor::resolve("main.less", true, &style_src).unwrap();
        let manifest = ResolvedManifest {
            kind: AssetKind::Style,
            components: vec![descriptor],
        };

        let bytes = cache.get_or_build(&manifest, &BrokenTransform).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("[STYLE ERROR] main.less:3: unexpected token"));
    }

    #[test]
    fn broken_script_transform_propagates() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Memory);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js"]);
        let err = cache.get_or_build(&manifest, &BrokenTransform).unwrap_err();
        assert!(matches!(err, BalerError::Transform(_)));
    }

    #[test]
    fn failed_build_releases_the_producer_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Disk);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();

        let cache = BundleCache::new(config);
        let manifest = script_manifest(&cache, &["a.js"]);

        assert!(cache.get_or_build(&manifest, &BrokenTransform).is_err());

        // The failed producer must not leave the key locked
        let bytes = cache.get_or_build(&manifest, &CountingTransform::new()).unwrap();
        assert!(bytes.starts_with(b"/*baler-1.0|"));
    }

    #[test]
    fn single_file_artifact_keeps_min_name() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Disk);
        fs::write(dir.path().join("js/widget.js"), "var w;").unwrap();

        let cache = BundleCache::new(config);
        let out_dir = cache.config().script.out_dir.clone();
        cache
            .single_file(AssetKind::Script, "widget.js", &CountingTransform::new())
            .unwrap();

        assert!(out_dir.join("widget.min.js").is_file());
    }

    #[test]
    fn clear_sweeps_both_kinds() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CachingStrategy::Always, StorageKind::Disk);
        fs::write(dir.path().join("js/a.js"), "var a;").unwrap();
        fs::write(dir.path().join("css/site.css"), "body {}").unwrap();

        let cache = BundleCache::new(config);
        cache
            .get_or_build(&script_manifest(&cache, &["a.js"]), &CountingTransform::new())
            .unwrap();
        let style_src = cache.config().style.src_dir.clone();
        let style = ResolvedManifest {
            kind: AssetKind::Style,
            components: vec![SourceDescriptor::resolve("site.css", true, &style_src).unwrap()],
        };
        cache.get_or_build(&style, &CountingTransform::new()).unwrap();

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.clear(), 0);
    }

    #[test]
    fn min_name_insertion() {
        assert_eq!(min_name("widget.js"), "widget.min.js");
        assert_eq!(min_name("app/widget.js"), "app/widget.min.js");
        assert_eq!(min_name("noext"), "noext.min");
    }
}
