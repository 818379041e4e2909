use mimir_types::MimirError;

/// bincode (standard config, serde mode) is used for every stored value, log
/// payload, snapshot and peer message.
pub fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, MimirError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| MimirError::Storage(e.to_string()))
}

pub fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, MimirError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| MimirError::Storage(e.to_string()))
}
