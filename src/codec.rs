//! Conversion between typed results and the opaque bytes kept in an [`Entry`].
//!
//! The engine never looks inside a payload. It only digests the bytes a codec
//! produces, so a codec must be deterministic: equal values must encode to
//! equal bytes, or unchanged results will look changed to every dependent.
//!
//! [`Entry`]: crate::store::Entry

use serde::{de::DeserializeOwned, Serialize};

/// Error raised by a [`Codec`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    /// Build a codec error from any displayable message.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Serializer/deserializer for one result type.
pub trait Codec<T>: Send + Sync + 'static {
    /// Encode a value to bytes.
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes produced by [`Codec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`. Used by [`Ctx::log`].
///
/// Map types with unspecified iteration order (such as `HashMap`) do not
/// encode deterministically; prefer `BTreeMap` in logged results.
///
/// [`Ctx::log`]: crate::Ctx::log
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::new)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::new)
    }
}

/// Compact binary codec backed by `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(CodecError::new)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_is_plain_json() {
        let bytes = Codec::<i32>::encode(&JsonCodec, &1).expect("encode");
        assert_eq!(bytes, b"1");

        let back: Vec<String> = JsonCodec
            .decode(br#"["a","b"]"#)
            .expect("decode");
        assert_eq!(back, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn json_codec_rejects_wrong_type() {
        let result: Result<u32, _> = JsonCodec.decode(b"\"text\"");
        assert!(result.is_err());
    }

    #[test]
    fn bincode_codec_decodes_what_it_encodes() {
        let value = (7u64, "seven".to_string());
        let bytes = BincodeCodec.encode(&value).expect("encode");
        let back: (u64, String) = BincodeCodec.decode(&bytes).expect("decode");
        assert_eq!(back, value);
    }
}
