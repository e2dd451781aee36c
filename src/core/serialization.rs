use super::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Compute a stable hash of serialized bytes for payload comparison.
///
/// Uses SeaHash which provides:
/// - Stable hashing across Rust compiler versions
/// - Stable across process restarts and machines
/// - Fast hashing for serialized payloads
///
/// Idempotency bookkeeping compares payload fingerprints across trigger
/// calls, so the same payload must produce the same hash every time,
/// regardless of Rust version.
///
/// Note: this is NOT cryptographically secure, but that's not needed here.
pub fn hash_payload(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}

/// Serializes a value to a JSON string.
///
/// # Errors
/// Returns `Error::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Error::Serialization)
}

/// Deserializes a JSON string to a value.
///
/// # Errors
/// Returns `Error::Deserialization` if the string cannot be deserialized.
pub fn deserialize_value<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(Error::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_payload() {
        let some_val: Option<String> = Some("order-1234".to_string());
        let none_val: Option<String> = None;

        let some_json = serialize_value(&some_val).unwrap();
        let none_json = serialize_value(&none_val).unwrap();

        let some_hash = hash_payload(some_json.as_bytes());
        let none_hash = hash_payload(none_json.as_bytes());

        // Different values should have different hashes
        assert_ne!(some_hash, none_hash);

        // Same value should have same hash
        let some_json2 = serialize_value(&some_val).unwrap();
        assert_eq!(some_hash, hash_payload(some_json2.as_bytes()));
    }

    #[test]
    fn test_serialization() {
        let test_value = vec!["hello".to_string(), "world".to_string()];
        let serialized = serialize_value(&test_value).unwrap();
        let deserialized: Vec<String> = deserialize_value(&serialized).unwrap();
        assert_eq!(test_value, deserialized);
    }
}
