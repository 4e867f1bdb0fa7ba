//! JSON serialization helpers shared by persistence backends.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{CoordError, Result};

/// Serialize a persistence model, labelling the field on failure.
pub fn serialize_json<T: Serialize>(value: &T, what: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CoordError::Validation {
        message: format!("serialize {what}: {e}"),
    })
}

/// Deserialize a persistence model, labelling the field on failure.
pub fn deserialize_json<T: DeserializeOwned>(raw: &str, what: &'static str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| CoordError::Validation {
        message: format!("deserialize {what}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_appear_in_errors() {
        let err = deserialize_json::<u32>("not json", "attempts").unwrap_err();
        assert!(err.to_string().contains("attempts"));
    }
}
