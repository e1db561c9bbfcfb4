//! Base64 helpers used by the shard blob and key ring formats.

use crate::{Error, Result};

/// Encode to standard base64.
pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
    data_encoding::BASE64.encode(bytes.as_ref())
}

/// Decode a base64 string to a vector of bytes.
pub fn parse_vec(input: &str) -> Result<Vec<u8>> {
    data_encoding::BASE64
        .decode(input.as_bytes())
        .map_err(|err| Error::Corrupt(format!("base64: {err}")))
}

/// Decode a base64 string into a byte array of exactly `N` bytes.
pub fn parse_array<const N: usize>(input: &str) -> Result<[u8; N]> {
    parse_vec(input)?
        .try_into()
        .map_err(|v: Vec<u8>| Error::Corrupt(format!("expected {N} bytes, got {}", v.len())))
}

/// Serde adapter for byte fields stored as base64 strings.
///
/// Use as `#[serde(with = "coffer_base::base64::serde")]`.
pub mod serde {
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a base64 string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::fmt(bytes))
    }

    /// Deserialize bytes from a base64 string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_vec(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let bytes = vec![0, 1, 2, 254, 255];
        assert_eq!(parse_vec(&fmt(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn array_length_enforced() {
        let encoded = fmt([1u8, 2, 3]);
        assert!(parse_array::<3>(&encoded).is_ok());
        assert!(parse_array::<4>(&encoded).is_err());
    }

    #[test]
    fn invalid_input_is_corrupt() {
        assert!(matches!(parse_vec("not base64!"), Err(Error::Corrupt(_))));
    }
}
