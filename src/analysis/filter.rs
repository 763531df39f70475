use std::sync::Arc;

use arc_swap::ArcSwapOption;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid key filter {pattern:?}: {source}")]
pub struct FilterError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Key filter swapped atomically while shards and producers keep running.
#[derive(Debug)]
pub struct KeyFilter {
    inner: ArcSwapOption<Regex>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self {
            inner: ArcSwapOption::empty(),
        }
    }

    /// Installs `pattern`. Empty clears the filter. An invalid pattern
    /// leaves the current filter in place.
    pub fn set_pattern(&self, pattern: &str) -> Result<(), FilterError> {
        if pattern.is_empty() {
            self.inner.store(None);
            return Ok(());
        }

        let re = Regex::new(pattern).map_err(|source| FilterError {
            pattern: pattern.to_string(),
            source,
        })?;
        self.inner.store(Some(Arc::new(re)));
        Ok(())
    }

    /// The installed pattern, if any.
    pub fn pattern(&self) -> Option<String> {
        self.inner.load_full().map(|re| re.as_str().to_string())
    }

    /// Returns the regex to match against, or `None` when everything passes.
    pub(crate) fn current(&self) -> Option<Arc<Regex>> {
        self.inner.load_full()
    }
}

impl Default for KeyFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = KeyFilter::new();
        assert!(filter.current().is_none());
        assert!(filter.pattern().is_none());
    }

    #[test]
    fn test_set_and_clear() {
        let filter = KeyFilter::new();
        filter.set_pattern("^user:").unwrap();
        let re = filter.current().unwrap();
        assert!(re.is_match("user:42"));
        assert!(!re.is_match("session:1"));

        filter.set_pattern("").unwrap();
        assert!(filter.current().is_none());
    }

    // -- Error cases --

    #[test]
    fn test_invalid_pattern_keeps_previous() {
        let filter = KeyFilter::new();
        filter.set_pattern("^a").unwrap();

        let err = filter.set_pattern("(unclosed").unwrap_err();
        assert_eq!(err.pattern, "(unclosed");
        assert_eq!(filter.pattern().as_deref(), Some("^a"));
    }
}
