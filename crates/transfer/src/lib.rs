//! Chunked, resumable, integrity-verified transfer engine.
//!
//! A [`TransferEngine`] splits payloads into digest-protected [`Chunk`]s on the
//! sending side and verifies, orders and reassembles them on the receiving
//! side. It never opens connections itself: chunks leave through a
//! [`ChunkTransport`] and arrive via [`TransferEngine::receive_chunk`].

pub mod codec;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod engine;
pub mod events;
pub mod integrity;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod validation;

pub use chunkline_protocol::{
    Chunk, Priority, TransferProgress, TransferRequest, TransferStatistics, TransferStatus,
};
pub use codec::ReassemblyError;
pub use config::TransferConfig;
pub use crypto::{AesGcmProvider, CryptoError, EncryptionKey, EncryptionProvider};
pub use driver::{SharedEngine, spawn_scheduler};
pub use engine::{ChunkOutcome, CompletedTransfer, TransferEngine};
pub use events::{EventSender, TransferEvent};
pub use scheduler::{AdmissionPolicy, AdmissionScheduler};
pub use store::{Completeness, TransferStore};
pub use transport::{ChannelTransport, ChunkTransport};

use chunkline_protocol::ProtocolError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("duplicate transfer: {0}")]
    DuplicateTransfer(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{transfer_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        transfer_id: String,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("chunk count not yet known for transfer {0}")]
    ChunkCountUnknown(String),

    #[error("reassembly failed: {0}")]
    Reassembly(#[from] ReassemblyError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("{transfer_id}: payload digest mismatch (expected {expected}, got {actual})")]
    IntegrityMismatch {
        transfer_id: String,
        expected: String,
        actual: String,
    },

    #[error("{transfer_id}: payload is {actual} bytes, declared {expected}")]
    SizeMismatch {
        transfer_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),
}

// Shape errors keep their category so callers can match on `InvalidChunk`
// regardless of which layer caught them.
impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidChunk(msg) => Self::InvalidChunk(msg),
            ProtocolError::InvalidRequest(msg) => Self::InvalidRequest(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_keep_their_category() {
        let err: TransferError = ProtocolError::InvalidChunk("seq 5 of 5".into()).into();
        assert!(matches!(err, TransferError::InvalidChunk(_)));

        let err: TransferError = ProtocolError::InvalidRequest("empty id".into()).into();
        assert!(matches!(err, TransferError::InvalidRequest(_)));
    }

    #[test]
    fn transition_error_message() {
        let err = TransferError::InvalidTransition {
            transfer_id: "t1".into(),
            from: TransferStatus::Completed,
            to: TransferStatus::Paused,
        };
        assert_eq!(err.to_string(), "t1: cannot move from completed to paused");
    }
}
