//! Glob key patterns
//!
//! `*` matches any run of characters (including `:`), `?` a single character.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{Error, Result};

/// Compiled glob pattern over cache key names
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    matcher: GlobMatcher,
}

impl KeyPattern {
    /// Compile a glob pattern
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|e| Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.kind().to_string(),
            })?;

        Ok(Self {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// Check a key against the pattern
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }

    /// Original pattern text
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_matching() {
        let pattern = KeyPattern::new("lesson:*").unwrap();
        assert!(pattern.matches("lesson:1"));
        assert!(pattern.matches("lesson:1:notes"));
        assert!(!pattern.matches("student:1"));
        assert!(!pattern.matches("xlesson:1"));
    }

    #[test]
    fn test_infix_wildcard() {
        let pattern = KeyPattern::new("user:*:profile").unwrap();
        assert!(pattern.matches("user:7:profile"));
        assert!(!pattern.matches("user:7:settings"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = KeyPattern::new("lesson:[").unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
    }

    proptest! {
        #[test]
        fn prop_prefix_star_matches_any_suffix(prefix in "[a-z]{1,8}", suffix in "[a-z0-9:]{0,16}") {
            let pattern = KeyPattern::new(&format!("{}:*", prefix)).unwrap();
            let key = format!("{}:{}", prefix, suffix);
            prop_assert!(pattern.matches(&key));
        }

        #[test]
        fn prop_literal_matches_only_itself(key in "[a-z0-9:]{1,16}", other in "[a-z0-9:]{1,16}") {
            let pattern = KeyPattern::new(&key).unwrap();
            prop_assert!(pattern.matches(&key));
            prop_assert_eq!(pattern.matches(&other), key == other);
        }
    }
}
