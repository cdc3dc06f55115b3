//! The catalog's unit of replication.

use crate::locator::{self, ContentId};
use crate::protocol::blob;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Identity of one version of an entry: FNV-1a 64 over `"{locator}_{created_at}"`.
///
/// Two entries for the same locator with different timestamps have different
/// IDs, so the known set tracks versions rather than locators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub fn of(source_locator: &str, created_at: u64) -> Self {
        let key = format!("{source_locator}_{created_at}");
        Self(fnv1a_64(key.as_bytes()))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// A content announcement: a link, how to fetch it, and who published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEntry {
    /// Canonical locator; the merge key.
    pub source_locator: String,
    /// Opaque transfer descriptor handed to the download mechanism.
    pub descriptor: String,
    pub title: String,
    /// Publishing identity.
    pub author: String,
    /// Origin wall-clock milliseconds. Doubles as the LWW timestamp.
    pub created_at: u64,
    #[serde(default, with = "blob::optional", skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<u8>>,
}

impl ContentEntry {
    /// Build a local entry, deriving the title from the locator.
    pub fn new(
        source_locator: impl Into<String>,
        descriptor: impl Into<String>,
        author: impl Into<String>,
        created_at: u64,
    ) -> Self {
        let source_locator = source_locator.into();
        let title = locator::extract_title(&source_locator);
        Self {
            source_locator,
            descriptor: descriptor.into(),
            title,
            author: author.into(),
            created_at,
            preview: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_preview(mut self, preview: Vec<u8>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn entry_id(&self) -> EntryId {
        EntryId::of(&self.source_locator, self.created_at)
    }

    pub fn content_id(&self) -> ContentId {
        ContentId::from_locator(&self.source_locator)
    }

    /// Whether this version should replace `existing` under last-writer-wins.
    ///
    /// Only a strictly newer timestamp wins; ties keep the existing record.
    pub fn supersedes(&self, existing: &ContentEntry) -> bool {
        self.created_at > existing.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(created_at: u64) -> ContentEntry {
        ContentEntry::new("https://forum.example/t/forum-post-123", "d1", "alice", created_at)
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_entry_id_depends_on_locator_and_timestamp() {
        assert_eq!(entry(1000).entry_id(), entry(1000).entry_id());
        assert_ne!(entry(1000).entry_id(), entry(2000).entry_id());

        let other = ContentEntry::new("https://forum.example/t/other", "d1", "alice", 1000);
        assert_ne!(entry(1000).entry_id(), other.entry_id());
    }

    #[test]
    fn test_entry_id_ignores_descriptor() {
        let mut e = entry(1000);
        let id = e.entry_id();
        e.descriptor = "d2".into();
        assert_eq!(e.entry_id(), id);
    }

    #[test]
    fn test_entry_id_display_is_16_hex_chars() {
        let shown = entry(1000).entry_id().to_string();
        assert_eq!(shown.len(), 16);
        assert!(shown.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_derives_title_and_content_id() {
        let e = entry(1000);
        assert_eq!(e.title, "Forum Post 123");
        assert_eq!(e.content_id().as_str(), "forum-post-123");
        assert!(e.preview.is_none());
    }

    #[test]
    fn test_supersedes_only_when_strictly_newer() {
        assert!(entry(2000).supersedes(&entry(1000)));
        assert!(!entry(1000).supersedes(&entry(1000)));
        assert!(!entry(1000).supersedes(&entry(2000)));
    }

    #[test]
    fn test_json_uses_camel_case_and_base64_preview() {
        let e = entry(1000).with_preview(vec![1, 2, 3]);
        let json = serde_json::to_string(&e).unwrap();

        assert!(json.contains("\"sourceLocator\":\"https://forum.example/t/forum-post-123\""));
        assert!(json.contains("\"createdAt\":1000"));
        assert!(json.contains("\"preview\":\"AQID\""));

        let parsed: ContentEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn test_json_without_preview() {
        let json = r#"{"sourceLocator":"https://a.example/x","descriptor":"d","title":"X","author":"bob","createdAt":5}"#;
        let parsed: ContentEntry = serde_json::from_str(json).unwrap();
        assert!(parsed.preview.is_none());
        assert_eq!(parsed.created_at, 5);
    }
}
