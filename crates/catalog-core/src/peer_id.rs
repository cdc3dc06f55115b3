//! PeerId: random 64-bit node identifier.
//!
//! Rendered as 16 lowercase hex characters everywhere it leaves the
//! process: handshakes, announcements, config files and logs. Ordering is
//! meaningful: when two nodes dial each other, the connection dialed by the
//! lower ID is the one both sides keep.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Invalid peer ID {0:?}: expected 16 hex chars")]
    InvalidFormat(String),
}

/// ```
/// use catalog_core::PeerId;
///
/// let id: PeerId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(id.short(), "a1b2c3d4");
/// assert!(PeerId::from(1) < id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Random, non-zero.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        loop {
            let id: u64 = rng.random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // from_str_radix alone would accept a leading sign.
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PeerIdError::InvalidFormat(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| PeerIdError::InvalidFormat(s.to_string()))
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_zero_padded_hex() {
        assert_eq!(PeerId(0xa1b2c3d4e5f67890).to_string(), "a1b2c3d4e5f67890");
        assert_eq!(PeerId(0xff).to_string(), "00000000000000ff");
        assert_eq!(PeerId(0xa1b2c3d4e5f67890).short(), "a1b2c3d4");
    }

    #[test]
    fn test_parse() {
        assert_eq!("A1B2C3D4E5F67890".parse::<PeerId>(), Ok(PeerId(0xa1b2c3d4e5f67890)));
        let generated = PeerId::generate();
        assert_eq!(generated.to_string().parse::<PeerId>(), Ok(generated));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in ["", "too_short", "ghijklmnopqrstuv", "a1b2c3d4e5f6789", "+1b2c3d4e5f67890"] {
            assert_eq!(
                bad.parse::<PeerId>(),
                Err(PeerIdError::InvalidFormat(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_ordering_follows_numeric_value() {
        assert!(PeerId(2) < PeerId(0x10));
        assert!(PeerId(0xff) < PeerId(0xa1b2c3d4e5f67890));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = PeerId(0xaa);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000000000aa\"");
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<PeerId>("\"xyz\"").is_err());
    }
}
