//! Baler - a build-once cache for bundled script and style assets.
//!
//! Source files are registered while a page renders, placeholder markers are
//! scanned out of the finished output to recover their true order, and the
//! bundled (optionally transformed) artifact is built at most once per cache
//! key, behind a pluggable storage backend.

pub mod cache;
pub mod collect;
pub mod config;
pub mod deps;
pub mod error;
pub mod key;
pub mod logger;
pub mod session;
pub mod source;
pub mod store;
pub mod transform;
pub mod utils;

pub use cache::BundleCache;
pub use collect::AssetCollector;
pub use config::{CachingStrategy, Config, KindConfig, StorageKind};
pub use error::{BalerError, Result};
pub use key::CacheKey;
pub use session::RenderSession;
pub use source::{AssetKind, ResolvedManifest, SourceDescriptor};
pub use store::{ArtifactStore, open_store};
pub use transform::{Passthrough, Transform, TransformError};
