//! Wire protocol between catalog peers.
//!
//! Every frame is a JSON object with a `type` tag:
//! - `handshake` opens a session
//! - `entry` / `entry_binary` carry a content entry (structured or compact form)
//! - `announce`, `query`, `request_entry` drive the content index

pub(crate) mod blob;
pub mod codec;
pub mod message;

pub use codec::{
    decode_entry_binary, encode_entry_binary, select_codec, BinaryCodec, CodecError, EntryCodec,
    StructuredCodec, BINARY_FORMAT_VERSION,
};
pub use message::{Handshake, ProtocolError, WireMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
