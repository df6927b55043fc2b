//! Pluggable serialization for queue items and persisted state.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FetchError, Result};
use crate::model::RequestMeta;

pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, item: &T) -> Result<Vec<u8>>;
    fn deserialize(&self, data: &[u8]) -> Result<T>;
}

/// JSON serializer for any serde-compatible item.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, item: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(item)
            .map_err(|e| FetchError::storage_from("serializer", "JSON encoding failed", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data)
            .map_err(|e| FetchError::storage_from("serializer", "JSON decoding failed", e))
    }
}

/// Compact binary serializer for payloads that never need to be inspected
/// by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl<T> Serializer<T> for BincodeSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, item: &T) -> Result<Vec<u8>> {
        bincode::serialize(item)
            .map_err(|e| FetchError::storage_from("serializer", "binary encoding failed", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<T> {
        bincode::deserialize(data)
            .map_err(|e| FetchError::storage_from("serializer", "binary decoding failed", e))
    }
}

/// Queue serializer for [`RequestMeta`]: JSON on the wire, with field
/// validation applied when items come back out of storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestMetaSerializer;

impl Serializer<RequestMeta> for RequestMetaSerializer {
    fn serialize(&self, item: &RequestMeta) -> Result<Vec<u8>> {
        JsonSerializer.serialize(item)
    }

    fn deserialize(&self, data: &[u8]) -> Result<RequestMeta> {
        let meta: RequestMeta = JsonSerializer.deserialize(data)?;
        meta.validate()?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let meta = RequestMeta::new("https://example.com/a").unwrap();
        let bytes = Serializer::serialize(&JsonSerializer, &meta).unwrap();
        let back: RequestMeta = Serializer::deserialize(&JsonSerializer, &bytes).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn bincode_round_trip() {
        let meta = RequestMeta::new("https://example.com/b").unwrap();
        let bytes = Serializer::serialize(&BincodeSerializer, &meta).unwrap();
        let back: RequestMeta = Serializer::deserialize(&BincodeSerializer, &bytes).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn request_meta_serializer_rejects_invalid_payload() {
        let serializer = RequestMetaSerializer;
        assert!(serializer.deserialize(b"not json").is_err());
        // Structurally valid JSON but an empty URL must not slip through.
        assert!(serializer.deserialize(br#"{"url": ""}"#).is_err());
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let meta = RequestMetaSerializer
            .deserialize(br#"{"url": "https://example.com"}"#)
            .unwrap();
        assert_eq!(meta.depth, 0);
        assert!(meta.headers.is_empty());
        assert!(meta.flags.is_empty());
    }
}
