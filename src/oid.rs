//! # Object identifiers
//!
//! An [`Oid`] is the 32-byte content-derived identifier of one stored blob
//! (spec §3). Two OIDs compare equal iff the blobs they name are
//! byte-identical; nothing about an OID's structure reveals the blob's
//! plaintext, only whether two plaintexts matched under the repository's
//! keyed hash (see [`crate::codec`]).

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Length in bytes of an object identifier.
pub const OID_LEN: usize = 32;

/// A 32-byte content-derived blob identifier, printed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid([u8; OID_LEN]);

impl Oid {
    pub fn from_bytes(bytes: [u8; OID_LEN]) -> Self {
        Oid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    /// Splits the hex form into the two path components used for object
    /// store sharding: `<hex[0..2]>/<hex[2..4]>/<full-hex>` (spec §4.1/§6).
    pub fn shard_path(&self) -> (String, String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..4].to_string(), hex)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Shortened hex form for human-readable display, e.g. in CLI listings.
    pub fn short(&self, len: usize) -> String {
        let hex = self.to_hex();
        hex[..len.min(hex.len())].to_string()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl FromStr for Oid {
    type Err = Error;

    /// Accepts bare hex, or hex prefixed with `oid:` (the "short
    /// human-readable prefix" spec §3 allows parsers to recognize).
    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix("oid:").unwrap_or(s);

        if hex_part.len() != OID_LEN * 2 {
            return Err(Error::Config(format!(
                "malformed object id '{s}': expected {} hex characters",
                OID_LEN * 2
            )));
        }

        let mut bytes = [0u8; OID_LEN];
        hex::decode_to_slice(hex_part, &mut bytes)
            .map_err(|e| Error::Config(format!("malformed object id '{s}': {e}")))?;

        Ok(Oid(bytes))
    }
}

impl serde::Serialize for Oid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Oid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Oid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_hex() {
        let oid = Oid::from_bytes([0x42; OID_LEN]);
        let text = oid.to_hex();
        let parsed: Oid = text.parse().unwrap();
        assert_eq!(oid, parsed);
    }

    #[test]
    fn accepts_prefixed_form() {
        let oid = Oid::from_bytes([0xab; OID_LEN]);
        let prefixed = format!("oid:{}", oid.to_hex());
        let parsed: Oid = prefixed.parse().unwrap();
        assert_eq!(oid, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = "deadbeef".parse::<Oid>();
        assert!(err.is_err());
    }

    #[test]
    fn shard_path_splits_prefix() {
        let oid = Oid::from_bytes([0x0a, 0x1b, 0x2c, 0x3d, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let (a, b, full) = oid.shard_path();
        assert_eq!(a, "0a");
        assert_eq!(b, "1b");
        assert!(full.starts_with("0a1b2c3d"));
    }
}
