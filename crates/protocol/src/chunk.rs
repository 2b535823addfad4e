//! Wire chunk: one bounded slice of a transfer's payload.
//!
//! ```text
//! {
//!   "transferId":     string,
//!   "chunkId":        "<transferId>-chunk-<sequenceNumber>",
//!   "sequenceNumber": u32, 0-indexed,
//!   "totalChunks":    u32, >= 1,
//!   "payload":        base64 of the on-wire bytes (ciphertext if encrypted),
//!   "digest":         lowercase hex SHA-256 of exactly those bytes,
//!   "encrypted":      bool
//! }
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{DIGEST_HEX_LEN, chunk_id};
use crate::error::ProtocolError;

/// A chunk of transfer data as it travels between engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawChunk")]
pub struct Chunk {
    pub transfer_id: String,
    pub chunk_id: String,
    pub sequence_number: u32,
    pub total_chunks: u32,
    #[serde(serialize_with = "encode_payload")]
    pub payload: Vec<u8>,
    pub digest: String,
    pub encrypted: bool,
}

/// Unvalidated mirror of [`Chunk`] used during deserialization.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChunk {
    transfer_id: String,
    chunk_id: String,
    sequence_number: u32,
    total_chunks: u32,
    #[serde(deserialize_with = "decode_payload")]
    payload: Vec<u8>,
    digest: String,
    #[serde(default)]
    encrypted: bool,
}

impl TryFrom<RawChunk> for Chunk {
    type Error = ProtocolError;

    fn try_from(raw: RawChunk) -> Result<Self, Self::Error> {
        let chunk = Chunk {
            transfer_id: raw.transfer_id,
            chunk_id: raw.chunk_id,
            sequence_number: raw.sequence_number,
            total_chunks: raw.total_chunks,
            payload: raw.payload,
            digest: raw.digest,
            encrypted: raw.encrypted,
        };
        chunk.validate()?;
        Ok(chunk)
    }
}

impl Chunk {
    /// Builds a validated chunk, deriving its chunk id.
    pub fn new(
        transfer_id: impl Into<String>,
        sequence_number: u32,
        total_chunks: u32,
        payload: Vec<u8>,
        digest: impl Into<String>,
        encrypted: bool,
    ) -> Result<Self, ProtocolError> {
        let transfer_id = transfer_id.into();
        let chunk = Chunk {
            chunk_id: chunk_id(&transfer_id, sequence_number),
            transfer_id,
            sequence_number,
            total_chunks,
            payload,
            digest: digest.into(),
            encrypted,
        };
        chunk.validate()?;
        Ok(chunk)
    }

    /// Checks the structural invariants of the chunk.
    ///
    /// Does not check the digest against the payload; that is the receiver's
    /// integrity check, not a shape check.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.transfer_id.is_empty() {
            return Err(ProtocolError::InvalidChunk("empty transfer id".into()));
        }
        if self.total_chunks == 0 {
            return Err(ProtocolError::InvalidChunk(format!(
                "{}: total chunk count must be at least 1",
                self.transfer_id
            )));
        }
        if self.sequence_number >= self.total_chunks {
            return Err(ProtocolError::InvalidChunk(format!(
                "{}: sequence {} out of range 0..{}",
                self.transfer_id, self.sequence_number, self.total_chunks
            )));
        }
        let expected_id = chunk_id(&self.transfer_id, self.sequence_number);
        if self.chunk_id != expected_id {
            return Err(ProtocolError::InvalidChunk(format!(
                "chunk id {:?} does not match {expected_id:?}",
                self.chunk_id
            )));
        }
        if self.digest.len() != DIGEST_HEX_LEN
            || !self.digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ProtocolError::InvalidChunk(format!(
                "{}: malformed digest",
                self.chunk_id
            )));
        }
        Ok(())
    }

    /// Number of payload bytes carried on the wire.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this is the final chunk of its transfer.
    pub fn is_last(&self) -> bool {
        self.sequence_number + 1 == self.total_chunks
    }
}

fn encode_payload<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

fn decode_payload<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn new_derives_chunk_id() {
        let chunk = Chunk::new("t1", 2, 4, b"abcd".to_vec(), EMPTY_SHA256, false).unwrap();
        assert_eq!(chunk.chunk_id, "t1-chunk-2");
        assert_eq!(chunk.len(), 4);
        assert!(!chunk.is_last());
    }

    #[test]
    fn last_chunk_detection() {
        let chunk = Chunk::new("t1", 3, 4, Vec::new(), EMPTY_SHA256, false).unwrap();
        assert!(chunk.is_last());
        assert!(chunk.is_empty());
    }

    #[test]
    fn sequence_equal_to_total_rejected() {
        let err = Chunk::new("t1", 5, 5, b"x".to_vec(), EMPTY_SHA256, false).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChunk(_)));
    }

    #[test]
    fn zero_total_rejected() {
        assert!(Chunk::new("t1", 0, 0, Vec::new(), EMPTY_SHA256, false).is_err());
    }

    #[test]
    fn empty_transfer_id_rejected() {
        assert!(Chunk::new("", 0, 1, Vec::new(), EMPTY_SHA256, false).is_err());
    }

    #[test]
    fn malformed_digest_rejected() {
        assert!(Chunk::new("t1", 0, 1, Vec::new(), "abc", false).is_err());
        let not_hex = "z".repeat(64);
        assert!(Chunk::new("t1", 0, 1, Vec::new(), not_hex, false).is_err());
    }

    #[test]
    fn mismatched_chunk_id_rejected() {
        let mut chunk = Chunk::new("t1", 0, 2, Vec::new(), EMPTY_SHA256, false).unwrap();
        chunk.chunk_id = "t1-chunk-1".into();
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn json_wire_format() {
        let chunk = Chunk::new("t1", 0, 1, b"hello".to_vec(), EMPTY_SHA256, true).unwrap();
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["transferId"], "t1");
        assert_eq!(value["chunkId"], "t1-chunk-0");
        assert_eq!(value["sequenceNumber"], 0);
        assert_eq!(value["totalChunks"], 1);
        assert_eq!(value["payload"], "aGVsbG8=");
        assert_eq!(value["digest"], EMPTY_SHA256);
        assert_eq!(value["encrypted"], true);

        let parsed: Chunk = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn deserialize_rejects_out_of_range_sequence() {
        let json = serde_json::json!({
            "transferId": "t1",
            "chunkId": "t1-chunk-5",
            "sequenceNumber": 5,
            "totalChunks": 5,
            "payload": "",
            "digest": EMPTY_SHA256,
            "encrypted": false,
        });
        let result: Result<Chunk, _> = serde_json::from_value(json);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("out of range"), "{err}");
    }

    #[test]
    fn deserialize_rejects_bad_base64() {
        let json = serde_json::json!({
            "transferId": "t1",
            "chunkId": "t1-chunk-0",
            "sequenceNumber": 0,
            "totalChunks": 1,
            "payload": "!!!",
            "digest": EMPTY_SHA256,
        });
        assert!(serde_json::from_value::<Chunk>(json).is_err());
    }
}
