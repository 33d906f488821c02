//! Value encoding at the remote-tier boundary.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CacheError, CacheResult};

/// Wire format used for values stored in the distributed tier.
///
/// Selected once from configuration; every remote tier of a manager shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    Json,
    #[default]
    #[serde(alias = "msgpack")]
    MessagePack,
}

/// Concrete encoder resolved from a [`SerializerKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serializer {
    kind: SerializerKind,
}

impl Serializer {
    pub fn new(kind: SerializerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        match self.kind {
            SerializerKind::Json => serde_json::to_vec(value)
                .map_err(|e| CacheError::serialization(format!("json encode: {e}"))),
            // Struct fields are written as map keys.
            SerializerKind::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| CacheError::serialization(format!("msgpack encode: {e}"))),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        match self.kind {
            SerializerKind::Json => serde_json::from_slice(bytes)
                .map_err(|e| CacheError::serialization(format!("json decode: {e}"))),
            SerializerKind::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| CacheError::serialization(format!("msgpack decode: {e}"))),
        }
    }
}

impl From<SerializerKind> for Serializer {
    fn from(kind: SerializerKind) -> Self {
        Self::new(kind)
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(SerializerKind::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueBox;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        last_name: Vec<String>,
    }

    #[test]
    fn test_empty_box_survives_both_formats() {
        for kind in [SerializerKind::Json, SerializerKind::MessagePack] {
            let serializer = Serializer::new(kind);
            let bytes = serializer.encode(&ValueBox::<User>::Empty).unwrap();
            let decoded: ValueBox<User> = serializer.decode(&bytes).unwrap();
            assert_eq!(decoded, ValueBox::Empty, "{kind:?}");
        }
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let serializer = Serializer::new(SerializerKind::Json);
        let err = serializer.decode::<ValueBox<User>>(b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_kind_from_config_string() {
        let kind: SerializerKind = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(kind, SerializerKind::MessagePack);
        let kind: SerializerKind = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(kind, SerializerKind::Json);
    }
}
