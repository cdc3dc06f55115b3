//! Tagged JSON messages exchanged between peers.

use super::blob;
use crate::entry::ContentEntry;
use crate::locator::ContentId;
use crate::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted from a peer (50 MiB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

const KNOWN_TYPES: [&str; 6] = [
    "handshake",
    "entry",
    "entry_binary",
    "announce",
    "query",
    "request_entry",
];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,
    #[error("Frame of {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Expected handshake, got {0}")]
    HandshakeRequired(&'static str),
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Versioned handshake.
///
/// Both sides send theirs as soon as the channel opens; the session is usable
/// once the remote handshake has arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub version: u32,
    pub peer_id: PeerId,
    /// Human-readable identity of the remote user.
    pub identity: String,
}

impl Handshake {
    pub fn new(peer_id: PeerId, identity: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            peer_id,
            identity: identity.into(),
        }
    }

    /// Check if we should log a version mismatch warning.
    ///
    /// Mismatched versions are still accepted.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}

/// Every message a peer may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    Handshake(Handshake),
    /// Full entry in structured form.
    Entry { entry: ContentEntry },
    /// Compact entry: versioned bincode metadata plus the preview out-of-band.
    EntryBinary {
        #[serde(with = "blob::required")]
        binary: Vec<u8>,
        #[serde(default, with = "blob::optional")]
        preview: Option<Vec<u8>>,
    },
    /// The sender claims to hold `content_id`.
    Announce { content_id: ContentId, peer_id: PeerId },
    /// Who holds `content_id`? Holders reply to the requester with `Announce`.
    Query {
        content_id: ContentId,
        requester_id: PeerId,
    },
    /// Send me your stored entries for `content_id`.
    RequestEntry { content_id: ContentId },
}

impl WireMessage {
    /// The `type` tag as it appears on the wire.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Entry { .. } => "entry",
            Self::EntryBinary { .. } => "entry_binary",
            Self::Announce { .. } => "announce",
            Self::Query { .. } => "query",
            Self::RequestEntry { .. } => "request_entry",
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Parse a frame, enforcing the size limit.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_slice(data).map_err(|err| classify(data, err))
    }
}

/// Distinguish an unknown `type` tag from an otherwise broken frame.
fn classify(data: &[u8], err: serde_json::Error) -> ProtocolError {
    let tag = serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string));

    match tag {
        Some(tag) if !KNOWN_TYPES.contains(&tag.as_str()) => ProtocolError::UnknownType(tag),
        _ => ProtocolError::Malformed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_a() -> PeerId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    // ==================== Wire format ====================

    #[test]
    fn test_handshake_wire_format() {
        let msg = WireMessage::Handshake(Handshake::new(peer_a(), "alice"));
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();

        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"peerId\":\"a1b2c3d4e5f67890\""));
        assert!(json.contains("\"identity\":\"alice\""));
    }

    #[test]
    fn test_announce_wire_format() {
        let msg = WireMessage::Announce {
            content_id: ContentId::new("forum-post-123"),
            peer_id: peer_a(),
        };
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();

        assert!(json.contains("\"type\":\"announce\""));
        assert!(json.contains("\"contentId\":\"forum-post-123\""));
        assert!(json.contains("\"peerId\":\"a1b2c3d4e5f67890\""));
    }

    #[test]
    fn test_query_and_request_wire_format() {
        let query = WireMessage::Query {
            content_id: ContentId::new("x"),
            requester_id: peer_a(),
        };
        let json = String::from_utf8(query.to_json().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"query\""));
        assert!(json.contains("\"requesterId\":"));

        let request = WireMessage::RequestEntry {
            content_id: ContentId::new("x"),
        };
        let json = String::from_utf8(request.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"request_entry","contentId":"x"}"#);
    }

    #[test]
    fn test_entry_binary_null_preview() {
        let msg = WireMessage::EntryBinary {
            binary: vec![1, 2, 3],
            preview: None,
        };
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"entry_binary\""));
        assert!(json.contains("\"binary\":\"AQID\""));
        assert!(json.contains("\"preview\":null"));
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_handshake_from_peer() {
        let json = br#"{"type":"handshake","version":1,"peerId":"a1b2c3d4e5f67890","identity":"bob"}"#;
        match WireMessage::from_json(json).unwrap() {
            WireMessage::Handshake(hs) => {
                assert_eq!(hs.peer_id, peer_a());
                assert_eq!(hs.identity, "bob");
                assert!(!hs.should_warn_version());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_entry_binary_without_preview_field() {
        let json = br#"{"type":"entry_binary","binary":"AQID"}"#;
        let msg = WireMessage::from_json(json).unwrap();
        assert_eq!(
            msg,
            WireMessage::EntryBinary {
                binary: vec![1, 2, 3],
                preview: None
            }
        );
    }

    #[test]
    fn test_version_mismatch_warns() {
        let json = br#"{"type":"handshake","version":99,"peerId":"a1b2c3d4e5f67890","identity":"bob"}"#;
        let WireMessage::Handshake(hs) = WireMessage::from_json(json).unwrap() else {
            panic!("expected handshake");
        };
        assert!(hs.should_warn_version());
    }

    // ==================== Rejections ====================

    #[test]
    fn test_empty_frame() {
        assert!(matches!(WireMessage::from_json(b""), Err(ProtocolError::Empty)));
    }

    #[test]
    fn test_unknown_type() {
        let err = WireMessage::from_json(br#"{"type":"ping"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "ping"));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            WireMessage::from_json(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            WireMessage::from_json(br#"{"type":"announce","contentId":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            WireMessage::from_json(br#"{"type":"entry_binary","binary":"!!notbase64"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_too_large() {
        let data = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            WireMessage::from_json(&data),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_message_type_matches_tag() {
        let msg = WireMessage::RequestEntry {
            content_id: ContentId::new("x"),
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], msg.message_type());
    }
}
