// src/watch/patterns.rs

use std::fmt;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::errors::{Result, WatchrunError};

/// Compiled `exclude_dirs` patterns.
///
/// Patterns are relative to the watch root and name directories:
///
/// - `"node_modules"` excludes exactly `node_modules/` and everything below.
/// - `"tmp*"` excludes every top-level directory whose name starts with
///   `tmp` (`tmp`, `tmp1`, `tmpfoo`, ...) and everything below them.
///
/// `*` never crosses a `/`, so `"tmp*"` does not reach into `src/tmp1`;
/// write `"src/tmp*"` or `"**/tmp*"` for that.
#[derive(Clone)]
pub struct ExcludeSet {
    patterns: Vec<String>,
    set: Option<GlobSet>,
}

impl fmt::Debug for ExcludeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExcludeSet")
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns: Vec<String> = patterns
            .iter()
            .map(|p| p.trim().trim_start_matches("./").trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();

        if patterns.is_empty() {
            return Ok(Self::empty());
        }

        let mut builder = GlobSetBuilder::new();
        for pat in &patterns {
            // The directory itself, and anything underneath it.
            for glob in [pat.clone(), format!("{pat}/**")] {
                let compiled = GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|source| WatchrunError::PatternError {
                        pattern: pat.clone(),
                        source,
                    })?;
                builder.add(compiled);
            }
        }

        let set = builder.build().map_err(|source| WatchrunError::PatternError {
            pattern: patterns.join(", "),
            source,
        })?;

        Ok(Self {
            patterns,
            set: Some(set),
        })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_none()
    }

    /// Is the directory at root-relative path `rel_dir` (forward slashes,
    /// `""` for the root itself) excluded?
    pub fn is_excluded(&self, rel_dir: &str) -> bool {
        if rel_dir.is_empty() {
            return false;
        }
        match &self.set {
            Some(set) => set.is_match(rel_dir),
            None => false,
        }
    }
}
