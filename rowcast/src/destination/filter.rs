use globset::{Glob, GlobMatcher};

use crate::error::{ErrorKind, RowcastResult};
use crate::rowcast_error;

/// A shell-style name filter attached to a destination binding.
///
/// Matched against the event name for processed sinks and the source table
/// name for raw sinks. The common `*` case skips glob compilation entirely.
#[derive(Debug, Clone)]
pub struct DestinationFilter {
    pattern: String,
    matcher: Option<GlobMatcher>,
}

impl DestinationFilter {
    /// Compiles a filter pattern; invalid globs are startup failures.
    pub fn new(pattern: &str) -> RowcastResult<DestinationFilter> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return Ok(DestinationFilter {
                pattern: "*".to_string(),
                matcher: None,
            });
        }

        let matcher = Glob::new(pattern)
            .map_err(|err| {
                rowcast_error!(
                    ErrorKind::ConfigError,
                    "invalid destination filter pattern",
                    format!("`{pattern}`: {err}")
                )
            })?
            .compile_matcher();

        Ok(DestinationFilter {
            pattern: pattern.to_string(),
            matcher: Some(matcher),
        })
    }

    /// Matches everything.
    pub fn match_all() -> DestinationFilter {
        DestinationFilter {
            pattern: "*".to_string(),
            matcher: None,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(matcher) => matcher.is_match(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        let filter = DestinationFilter::new("*").unwrap();
        assert!(filter.matches("user_signed_up"));
        assert!(filter.matches(""));
    }

    #[test]
    fn globs_match_by_prefix() {
        let filter = DestinationFilter::new("user_*").unwrap();
        assert!(filter.matches("user_signed_up"));
        assert!(!filter.matches("order_completed"));
    }

    #[test]
    fn empty_patterns_default_to_match_all() {
        let filter = DestinationFilter::new("  ").unwrap();
        assert_eq!(filter.pattern(), "*");
        assert!(filter.matches("anything"));
    }

    #[test]
    fn invalid_globs_fail() {
        assert!(DestinationFilter::new("user_[").is_err());
    }
}
