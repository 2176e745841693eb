use crate::backup::result_error::result::Result;
use derive_more::{Display, From};
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::result;

/// Glob relative to the archived directory. A match excludes the entry and
/// everything below it.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct ExcludeGlob {
    glob: Glob,
}

impl ExcludeGlob {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()?
            .into())
    }

    pub fn pattern(&self) -> &str {
        self.glob.glob()
    }
}

/// Directories app data keeps only as disposable caches.
pub fn default_excludes() -> Vec<ExcludeGlob> {
    ["cache", "code_cache", "no_backup"]
        .into_iter()
        .filter_map(|p| ExcludeGlob::new(p).ok())
        .collect()
}

struct ExcludeGlobVisitor;

impl Visitor<'_> for ExcludeGlobVisitor {
    type Value = ExcludeGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(ExcludeGlob::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ExcludeGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(ExcludeGlobVisitor)
    }
}

pub struct ExcludeMatcher {
    set: GlobSet,
}

impl ExcludeMatcher {
    pub fn build(globs: &[ExcludeGlob]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            builder.add(glob.glob.clone());
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .any(|p| self.set.is_match(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_excludes_cover_subtrees() {
        let matcher = ExcludeMatcher::build(&default_excludes()).unwrap();
        assert!(matcher.is_excluded(Path::new("cache")));
        assert!(matcher.is_excluded(Path::new("cache/a/b.bin")));
        assert!(matcher.is_excluded(Path::new("code_cache/x")));
        assert!(!matcher.is_excluded(Path::new("files/cache")));
        assert!(!matcher.is_excluded(Path::new("shared_prefs/p.xml")));
    }

    #[test]
    fn test_literal_separator() {
        let matcher = ExcludeMatcher::build(&[ExcludeGlob::new("files/*.log").unwrap()]).unwrap();
        assert!(matcher.is_excluded(Path::new("files/a.log")));
        assert!(!matcher.is_excluded(Path::new("files/sub/a.log")));
    }

    #[test]
    fn test_deserialize() {
        let globs: Vec<ExcludeGlob> = serde_json::from_str(r#"["cache","files/**/*.tmp"]"#).unwrap();
        assert_eq!(globs[1].pattern(), "files/**/*.tmp");
        assert!(serde_json::from_str::<Vec<ExcludeGlob>>(r#"["a[b"]"#).is_err());
        assert_eq!(serde_json::to_string(&globs).unwrap(), r#"["cache","files/**/*.tmp"]"#);
    }
}
