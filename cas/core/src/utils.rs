use crate::error::{CasError, Result};

/**
    Parse a fixed-length key from hex text.

    Separators between byte pairs (`:`, `-`, spaces) are ignored, so both
    `0102030405060708` and `01:02:03:04:05:06:07:08` are accepted.
*/
pub fn parse_hex_key<const N: usize>(value: &str) -> Result<[u8; N]> {
    let digits: String = value
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .collect();

    let invalid = || CasError::InvalidKey {
        value: value.to_string(),
        expected: N,
    };

    let bytes = hex::decode(&digits).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/**
    Render a key as colon-separated hex bytes.
*/
pub fn format_hex_key(key: &[u8]) -> String {
    key.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/**
    Serde adapter for keys stored as hex text in configuration records.
*/
pub mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer, const N: usize>(
        key: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_hex_key(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_hex_key(&text).map_err(D::Error::custom)
    }
}
