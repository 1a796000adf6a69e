//! Payload codec shared by every rank.
//!
//! All values crossing a process boundary go through [`encode`] and
//! [`decode`]. The encoding is bincode's standard configuration driven by
//! serde, which is deterministic: equal values always produce equal bytes.

use crate::error::{CommonError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Serialize a value to bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        CommonError::serialization_error_with_source(
            format!("failed to encode {}", std::any::type_name::<T>()),
            e,
        )
    })
}

/// Deserialize a value from bytes.
///
/// The whole buffer must be consumed; trailing bytes mean the sender and the
/// receiver disagree about the payload type.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, read): (T, usize) =
        bincode::serde::decode_from_slice(data, bincode::config::standard()).map_err(|e| {
            CommonError::deserialization_error_with_source(
                format!("failed to decode {}", std::any::type_name::<T>()),
                e,
            )
        })?;

    if read != data.len() {
        return Err(CommonError::deserialization_error(format!(
            "{} trailing bytes after decoding {}",
            data.len() - read,
            std::any::type_name::<T>()
        )));
    }
    Ok(value)
}

/// Utility functions for JSON, used for configuration files.
pub mod json {
    use super::*;

    /// Deserialize from a JSON string; malformed input is a configuration error.
    pub fn from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
        serde_json::from_str(s).map_err(|e| {
            CommonError::configuration_error_with_source(format!("invalid JSON: {}", e), e)
        })
    }

    /// Read and deserialize a JSON file.
    pub fn from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CommonError::configuration_error_with_source(
                format!("cannot read {}", path.display()),
                e,
            )
        })?;
        from_str(&text)
    }
}
