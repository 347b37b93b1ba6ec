// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The portable textual codec for user payloads, per spec.md §4.2. The
//! original program serializes with Boost's `text_oarchive`/`text_iarchive`;
//! this realization swaps that for `serde_json`, matching the "Rust
//! Realization" column of SPEC_FULL.md §4.2.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn roundtrip() {
        let bytes = encode(&Ping { n: 7 }).unwrap();
        let decoded: Ping = decode(&bytes).unwrap();
        assert_eq!(decoded, Ping { n: 7 });
    }

    #[test]
    fn decode_garbage_errors() {
        let result: Result<Ping, _> = decode(b"not json");
        assert!(result.is_err());
    }
}
