//! Source locators and the content IDs derived from them.
//!
//! A content ID is a normalized slug of an entry's source locator. Two
//! locators that point at the same post (`/t/some-post/123` and
//! `/t/some-post/123?page=2`) collapse to the same ID, which is what the
//! content index and queries are keyed by.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use url::Url;

/// Normalized identifier derived from a source locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Wrap an already-normalized ID (e.g. one received over the wire).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the content ID for a source locator.
    ///
    /// Uses the last path segment, or the one before it when the last
    /// segment is a numeric post ID. Falls back to the host for bare
    /// domains, and to the trimmed lowercase input when it doesn't parse.
    pub fn from_locator(locator: &str) -> Self {
        let Ok(url) = Url::parse(locator) else {
            return Self(locator.trim().to_lowercase());
        };

        match slug_segment(&url) {
            Some(segment) => Self(clean_slug(&segment)),
            None => match url.host_str() {
                Some(host) if !host.is_empty() => Self(host.to_string()),
                _ => Self(locator.trim().to_lowercase()),
            },
        }
    }

    /// Normalize free-text search input into a content ID.
    ///
    /// Lowercases, keeps `a-z`, `0-9`, `-` and whitespace, then collapses
    /// whitespace runs into single dashes.
    pub fn from_query(query: &str) -> Self {
        let lowered = query.trim().to_lowercase();
        let kept: String = lowered
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || *c == '-')
            .collect();

        let mut slug = String::with_capacity(kept.len());
        let mut in_space = false;
        for c in kept.chars() {
            if c.is_whitespace() {
                if !in_space {
                    slug.push('-');
                }
                in_space = true;
            } else {
                slug.push(c);
                in_space = false;
            }
        }
        Self(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `other` occurs inside this ID.
    pub fn contains(&self, other: &ContentId) -> bool {
        self.0.contains(other.as_str())
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Human-readable title derived from a locator's slug.
///
/// `https://forum.example/t/rust-async-tips/42` becomes "Rust Async Tips".
pub fn extract_title(locator: &str) -> String {
    let Ok(url) = Url::parse(locator) else {
        return "Untitled".to_string();
    };

    match slug_segment(&url) {
        Some(segment) => slug_to_title(&segment),
        None => url.host_str().unwrap_or("Untitled").to_string(),
    }
}

/// Whether the text parses as an absolute URL.
pub fn is_locator(text: &str) -> bool {
    Url::parse(text.trim()).is_ok()
}

/// Pick the path segment that carries the slug.
fn slug_segment(url: &Url) -> Option<String> {
    let parts: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    match parts.as_slice() {
        [] => None,
        [.., second_last, last] if is_numeric(last) => Some(second_last.to_string()),
        [.., last] => Some(last.to_string()),
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn clean_slug(slug: &str) -> String {
    let mut s = slug;
    if let Some(idx) = s.find('?') {
        s = &s[..idx];
    }
    if let Some(idx) = s.find('#') {
        s = &s[..idx];
    }
    for ext in [".html", ".htm", ".php"] {
        if let Some(stripped) = s.strip_suffix(ext) {
            s = stripped;
            break;
        }
    }
    s.to_lowercase()
}

fn slug_to_title(slug: &str) -> String {
    slug.replace(['-', '_'], " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_uses_last_segment() {
        let id = ContentId::from_locator("https://forum.example/t/forum-post-123");
        assert_eq!(id.as_str(), "forum-post-123");
    }

    #[test]
    fn test_content_id_skips_numeric_post_id() {
        let id = ContentId::from_locator("https://forum.example/t/rust-async-tips/42");
        assert_eq!(id.as_str(), "rust-async-tips");
    }

    #[test]
    fn test_content_id_ignores_query_and_fragment() {
        let a = ContentId::from_locator("https://forum.example/t/some-post/7?page=2#reply");
        let b = ContentId::from_locator("https://forum.example/t/some-post/7");
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_id_strips_page_extension_and_lowercases() {
        let id = ContentId::from_locator("https://blog.example/posts/My-Article.html");
        assert_eq!(id.as_str(), "my-article");
    }

    #[test]
    fn test_content_id_bare_domain_uses_host() {
        let id = ContentId::from_locator("https://example.org/");
        assert_eq!(id.as_str(), "example.org");
    }

    #[test]
    fn test_content_id_unparsable_falls_back() {
        let id = ContentId::from_locator("  Not A URL ");
        assert_eq!(id.as_str(), "not a url");
    }

    #[test]
    fn test_content_id_from_query() {
        assert_eq!(ContentId::from_query("  Rust Async   Tips! ").as_str(), "rust-async-tips");
        assert_eq!(ContentId::from_query("forum-post-123").as_str(), "forum-post-123");
    }

    #[test]
    fn test_extract_title() {
        assert_eq!(
            extract_title("https://forum.example/t/rust-async_tips/42"),
            "Rust Async Tips"
        );
        assert_eq!(extract_title("https://example.org"), "example.org");
        assert_eq!(extract_title("nope"), "Untitled");
    }

    #[test]
    fn test_is_locator() {
        assert!(is_locator("https://forum.example/t/x"));
        assert!(!is_locator("just some words"));
    }

    #[test]
    fn test_content_id_serializes_as_plain_string() {
        let id = ContentId::new("forum-post-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"forum-post-123\"");
    }
}
