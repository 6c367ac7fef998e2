//! Caching strategy selection.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Policy governing whether and how input timestamps participate in
/// cache-hit decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingStrategy {
    /// Keys hash identifiers only; the artifact header catches edits.
    #[default]
    Always,
    /// The cache is bypassed entirely; every request rebuilds.
    Never,
    /// Keys additionally fold in each component's effective mtime, so any
    /// edit produces a new key.
    Change,
}

impl CachingStrategy {
    const ALL: [CachingStrategy; 3] = [Self::Always, Self::Never, Self::Change];

    fn name(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::Change => "change",
        }
    }
}

impl fmt::Display for CachingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CachingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lc = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name() == lc)
            .ok_or_else(|| {
                format!(
                    "could not parse caching strategy from `{s}`; must be one of always, never, change"
                )
            })
    }
}
