//! Entry encodings for the wire.
//!
//! - **Structured**: the whole entry as JSON (`entry` message).
//! - **Binary**: a format version byte followed by bincode of the entry's
//!   metadata (`entry_binary` message). The preview is excluded from the
//!   bincode payload and travels alongside it.
//!
//! The active codec is chosen once at startup by [`select_codec`]. Every node
//! decodes both forms regardless of which one it sends.

use super::message::WireMessage;
use crate::entry::ContentEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Leading byte of every binary entry payload.
pub const BINARY_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Empty binary payload")]
    Empty,
    #[error("Unsupported binary format version: {0}")]
    UnsupportedVersion(u8),
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Codec self-test failed: {0}")]
    SelfTest(String),
}

/// Turns an entry into the message that carries it.
pub trait EntryCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, entry: &ContentEntry) -> Result<WireMessage, CodecError>;
}

/// Sends entries as `entry` messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredCodec;

impl EntryCodec for StructuredCodec {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn encode(&self, entry: &ContentEntry) -> Result<WireMessage, CodecError> {
        Ok(WireMessage::Entry {
            entry: entry.clone(),
        })
    }
}

/// Sends entries as `entry_binary` messages.
#[derive(Debug, Clone, Copy)]
pub struct BinaryCodec {
    _verified: (),
}

impl BinaryCodec {
    /// Initialise the codec, verifying a round-trip of a sample entry first.
    pub fn new() -> Result<Self, CodecError> {
        let sample = ContentEntry::new(
            "https://selftest.invalid/t/codec-check/1",
            "descriptor",
            "selftest",
            1,
        )
        .with_preview(vec![0, 1, 2, 254, 255]);

        let binary = encode_entry_binary(&sample)?;
        let decoded = decode_entry_binary(&binary, sample.preview.clone())?;
        if decoded != sample {
            return Err(CodecError::SelfTest(
                "decoded entry differs from original".into(),
            ));
        }

        Ok(Self { _verified: () })
    }
}

impl EntryCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode(&self, entry: &ContentEntry) -> Result<WireMessage, CodecError> {
        Ok(WireMessage::EntryBinary {
            binary: encode_entry_binary(entry)?,
            preview: entry.preview.clone(),
        })
    }
}

/// Pick the codec used for outbound entries.
///
/// Falls back to the structured codec when binary isn't preferred or its
/// self-test fails.
pub fn select_codec(prefer_binary: bool) -> Box<dyn EntryCodec> {
    if !prefer_binary {
        info!("Using structured entry codec");
        return Box::new(StructuredCodec);
    }

    match BinaryCodec::new() {
        Ok(codec) => {
            info!("Using binary entry codec");
            Box::new(codec)
        }
        Err(e) => {
            warn!("Binary codec unavailable, using structured: {}", e);
            Box::new(StructuredCodec)
        }
    }
}

#[derive(Serialize)]
struct MetadataRef<'a> {
    source_locator: &'a str,
    descriptor: &'a str,
    title: &'a str,
    author: &'a str,
    created_at: u64,
}

#[derive(Deserialize)]
struct Metadata {
    source_locator: String,
    descriptor: String,
    title: String,
    author: String,
    created_at: u64,
}

/// Encode every field but the preview.
pub fn encode_entry_binary(entry: &ContentEntry) -> Result<Vec<u8>, CodecError> {
    let metadata = MetadataRef {
        source_locator: &entry.source_locator,
        descriptor: &entry.descriptor,
        title: &entry.title,
        author: &entry.author,
        created_at: entry.created_at,
    };

    let body = bincode::serialize(&metadata)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(BINARY_FORMAT_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode binary metadata and reattach the out-of-band preview.
pub fn decode_entry_binary(
    binary: &[u8],
    preview: Option<Vec<u8>>,
) -> Result<ContentEntry, CodecError> {
    let (&version, body) = binary.split_first().ok_or(CodecError::Empty)?;
    if version != BINARY_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let metadata: Metadata = bincode::deserialize(body)?;
    Ok(ContentEntry {
        source_locator: metadata.source_locator,
        descriptor: metadata.descriptor,
        title: metadata.title,
        author: metadata.author,
        created_at: metadata.created_at,
        preview,
    })
}
