//! Capture scope
//!
//! Decides whether a request is captured and handed to interceptors, from its
//! method and URL alone.

use crate::errors::Result;
use regex::Regex;

/// A compiled URL pattern, matched from the start of the URL.
#[derive(Debug, Clone)]
pub struct UrlPattern {
  source: String,
  anchored: Regex,
}

impl UrlPattern {
  /// Compile `pattern`; it must match at the beginning of the URL
  pub fn new(pattern: &str) -> Result<Self> {
    Ok(Self {
      source: pattern.to_string(),
      anchored: Regex::new(&format!("^(?:{})", pattern))?,
    })
  }

  /// The pattern as it was supplied
  pub fn as_str(&self) -> &str {
    &self.source
  }

  /// Whether the pattern matches a prefix of `url`
  pub fn matches(&self, url: &str) -> bool {
    self.anchored.is_match(url)
  }

  /// Whether the pattern matches every URL, e.g. `.*`
  pub fn is_catch_all(&self) -> bool {
    self.anchored.is_match("")
  }
}

impl PartialEq for UrlPattern {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
  }
}

/// Anything that can stand in for a list of URL patterns.
///
/// A single string is a one element list.
pub trait IntoPatterns {
  /// Convert into owned pattern strings
  fn into_patterns(self) -> Vec<String>;
}

impl IntoPatterns for &str {
  fn into_patterns(self) -> Vec<String> {
    vec![self.to_string()]
  }
}

impl IntoPatterns for String {
  fn into_patterns(self) -> Vec<String> {
    vec![self]
  }
}

impl<S: Into<String>> IntoPatterns for Vec<S> {
  fn into_patterns(self) -> Vec<String> {
    self.into_iter().map(Into::into).collect()
  }
}

impl<S: AsRef<str>> IntoPatterns for &[S] {
  fn into_patterns(self) -> Vec<String> {
    self.iter().map(|s| s.as_ref().to_string()).collect()
  }
}

impl<S: Into<String>, const N: usize> IntoPatterns for [S; N] {
  fn into_patterns(self) -> Vec<String> {
    self.into_iter().map(Into::into).collect()
  }
}

fn compile(patterns: impl IntoPatterns) -> Result<Vec<UrlPattern>> {
  patterns
    .into_patterns()
    .iter()
    .map(|p| UrlPattern::new(p))
    .collect()
}

/// The rule set governing capture.
///
/// Lists are only ever replaced whole; the `with_*` builders return a new
/// filter so a shared filter can be swapped atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeFilter {
  include: Vec<UrlPattern>,
  exclude: Vec<UrlPattern>,
  ignored_methods: Vec<String>,
}

impl Default for ScopeFilter {
  fn default() -> Self {
    Self {
      include: Vec::new(),
      exclude: Vec::new(),
      ignored_methods: vec!["OPTIONS".to_string()],
    }
  }
}

impl ScopeFilter {
  /// A filter with no URL rules that ignores the given methods
  pub fn new<I, S>(ignored_methods: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      include: Vec::new(),
      exclude: Vec::new(),
      ignored_methods: ignored_methods.into_iter().map(Into::into).collect(),
    }
  }

  /// Replace the include patterns
  pub fn with_include(&self, patterns: impl IntoPatterns) -> Result<Self> {
    Ok(Self {
      include: compile(patterns)?,
      ..self.clone()
    })
  }

  /// Replace the exclude patterns
  pub fn with_exclude(&self, patterns: impl IntoPatterns) -> Result<Self> {
    Ok(Self {
      exclude: compile(patterns)?,
      ..self.clone()
    })
  }

  /// Include patterns as supplied
  pub fn include(&self) -> Vec<String> {
    self.include.iter().map(|p| p.as_str().to_string()).collect()
  }

  /// Exclude patterns as supplied
  pub fn exclude(&self) -> Vec<String> {
    self.exclude.iter().map(|p| p.as_str().to_string()).collect()
  }

  /// Methods that are never captured
  pub fn ignored_methods(&self) -> &[String] {
    &self.ignored_methods
  }

  /// Whether a request with this method and URL should be captured
  pub fn in_scope(&self, method: &str, url: &str) -> bool {
    if self
      .ignored_methods
      .iter()
      .any(|m| m.eq_ignore_ascii_case(method))
    {
      return false;
    }
    if self.include.is_empty() && self.exclude.is_empty() {
      return true;
    }
    if self.exclude.iter().any(UrlPattern::is_catch_all) {
      return false;
    }
    if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(url)) {
      return false;
    }
    !self.exclude.iter().any(|p| p.matches(url))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_no_rules_captures_everything_but_ignored_methods() {
    let scope = ScopeFilter::default();
    assert!(scope.in_scope("GET", "https://example.com/"));
    assert!(!scope.in_scope("OPTIONS", "https://example.com/"));
    assert!(!scope.in_scope("options", "https://example.com/"));
  }

  #[test]
  fn test_include_is_anchored_at_start() {
    let scope = ScopeFilter::default()
      .with_include(vec![".*/anything/.*"])
      .unwrap();
    assert!(scope.in_scope("GET", "http://h/anything/x"));
    assert!(!scope.in_scope("GET", "http://h/html"));

    let scope = scope.with_include("example.com").unwrap();
    assert!(!scope.in_scope("GET", "https://example.com/"));
  }

  #[test]
  fn test_exclude_wins_over_include() {
    let scope = ScopeFilter::default()
      .with_include(".*example.com.*")
      .unwrap()
      .with_exclude([".*\\.png$"])
      .unwrap();
    assert!(scope.in_scope("GET", "https://example.com/index.html"));
    assert!(!scope.in_scope("GET", "https://example.com/logo.png"));
    assert!(!scope.in_scope("GET", "https://other.org/index.html"));
  }

  #[test]
  fn test_catch_all_exclude_disables_capture() {
    for pattern in [".*", "(?:)", "x*"] {
      let scope = ScopeFilter::default()
        .with_include(".*")
        .unwrap()
        .with_exclude(pattern)
        .unwrap();
      assert!(!scope.in_scope("GET", "https://example.com/"), "{pattern}");
    }
  }

  #[test]
  fn test_replace_and_reset() {
    let scope = ScopeFilter::new(Vec::<String>::new())
      .with_exclude(&["a", "b"][..])
      .unwrap();
    assert_eq!(scope.exclude(), vec!["a", "b"]);
    let scope = scope.with_exclude(Vec::<String>::new()).unwrap();
    assert!(scope.exclude().is_empty());
    assert!(scope.in_scope("OPTIONS", "https://example.com/"));
  }

  #[test]
  fn test_invalid_pattern() {
    assert!(ScopeFilter::default().with_include("(").is_err());
  }
}
