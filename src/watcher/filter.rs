//! Path predicates applied to raw events before debouncing.

use std::path::{Component, Path, PathBuf};

use {regex::RegexSet, tracing::trace};

use crate::{config::WatchConfig, error::WatchError};

/// Decides which paths are reported to consumers.
#[derive(Debug, Clone)]
pub struct PathFilter {
    /// Whether dot-prefixed entries are reported.
    include_hidden: bool,
    /// Compiled exclude patterns.
    excludes: RegexSet,
    /// Watched roots; only components below a root count as hidden.
    roots: Vec<PathBuf>,
}

impl PathFilter {
    /// Builds a filter from the session configuration.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidPattern` if an exclude pattern does not compile.
    pub fn from_config(config: &WatchConfig) -> Result<Self, WatchError> {
        Ok(Self {
            include_hidden: config.include_hidden,
            excludes: RegexSet::new(&config.exclude_patterns)?,
            roots: Vec::new(),
        })
    }

    /// Sets the resolved roots used by the hidden-entry check.
    #[must_use]
    pub fn with_roots(mut self, roots: impl IntoIterator<Item = PathBuf>) -> Self {
        self.roots = roots.into_iter().collect();
        self
    }

    /// Returns `true` if events on `path` should be reported.
    #[must_use]
    pub fn allows(&self, path: &Path) -> bool {
        if !self.include_hidden && self.is_hidden(path) {
            trace!("Filtered hidden path: {:?}", path);
            return false;
        }
        if !self.excludes.is_empty() && self.excludes.is_match(&path.to_string_lossy()) {
            trace!("Filtered excluded path: {:?}", path);
            return false;
        }
        true
    }

    /// A path is hidden if any component below its root starts with a dot.
    /// Paths outside every root are judged by their file name alone.
    fn is_hidden(&self, path: &Path) -> bool {
        let dotted = |name: &std::ffi::OsStr| name.as_encoded_bytes().first() == Some(&b'.');

        match self.roots.iter().find_map(|root| path.strip_prefix(root).ok()) {
            Some(relative) => relative.components().any(|component| match component {
                Component::Normal(name) => dotted(name),
                _ => false,
            }),
            None => path.file_name().is_some_and(dotted),
        }
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self {
            include_hidden: true,
            excludes: RegexSet::empty(),
            roots: Vec::new(),
        }
    }
}

/// Lexically normalizes a path: drops `.` components and resolves `..`
/// against preceding components. Symlinks are left untouched.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Whether `path` lies inside `root`, either anywhere below it
/// (`recursive`) or as a direct child.
#[must_use]
pub fn is_within(path: &Path, root: &Path, recursive: bool) -> bool {
    if recursive {
        path.starts_with(root) && path != root
    } else {
        path.parent() == Some(root)
    }
}
