//! Splits payloads into wire chunks and puts them back together.

use chunkline_protocol::Chunk;
use tracing::trace;

use crate::TransferError;
use crate::crypto::{EncryptionKey, EncryptionProvider};
use crate::integrity;

/// Error returned when a chunk set cannot be turned back into a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("chunk {0} is missing")]
    MissingChunk(u32),

    #[error("chunk set disagrees on total chunk count (expected {expected}, found {found})")]
    TotalMismatch { expected: u32, found: u32 },

    #[error("no chunks to assemble")]
    Empty,

    #[error("chunk {sequence} could not be decrypted: {reason}")]
    Decryption { sequence: u32, reason: String },
}

/// Splits `payload` into chunks of at most `chunk_size` bytes.
///
/// When `key` is given each window is encrypted before it is digested, so the
/// digest always covers the bytes that travel on the wire. An empty payload
/// yields a single empty chunk. Callers clamp `chunk_size` through
/// [`TransferConfig`](crate::TransferConfig); here it only has to be non-zero.
pub fn split(
    transfer_id: &str,
    payload: &[u8],
    chunk_size: usize,
    key: Option<&EncryptionKey>,
    provider: &dyn EncryptionProvider,
) -> Result<Vec<Chunk>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunk("chunk size must be non-zero".into()));
    }

    let total = payload.len().div_ceil(chunk_size).max(1);
    let total_chunks = u32::try_from(total).map_err(|_| {
        TransferError::InvalidChunk(format!("{total} chunks exceeds the sequence range"))
    })?;

    let mut windows: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    if windows.is_empty() {
        windows.push(&[]);
    }

    let mut chunks = Vec::with_capacity(windows.len());
    for (sequence, window) in (0u32..).zip(windows) {
        let (bytes, encrypted) = match key {
            Some(key) => (provider.encrypt(window, key)?, true),
            None => (window.to_vec(), false),
        };
        let digest = integrity::digest(&bytes);
        chunks.push(Chunk::new(
            transfer_id,
            sequence,
            total_chunks,
            bytes,
            digest,
            encrypted,
        )?);
    }

    trace!(transfer = %transfer_id, chunks = total_chunks, chunk_size, "payload split");
    Ok(chunks)
}

/// Reassembles an ordered, gap-free chunk set into the original payload.
///
/// Encrypted chunks are decrypted with `key`; a missing key or a provider
/// failure is a [`ReassemblyError::Decryption`].
pub fn assemble(
    chunks: &[Chunk],
    key: Option<&EncryptionKey>,
    provider: &dyn EncryptionProvider,
) -> Result<Vec<u8>, ReassemblyError> {
    let first = chunks.first().ok_or(ReassemblyError::Empty)?;
    let expected_total = first.total_chunks;

    let mut payload = Vec::with_capacity(chunks.iter().map(Chunk::len).sum());
    for (expected_seq, chunk) in (0u32..).zip(chunks) {
        if chunk.total_chunks != expected_total {
            return Err(ReassemblyError::TotalMismatch {
                expected: expected_total,
                found: chunk.total_chunks,
            });
        }
        if chunk.sequence_number != expected_seq {
            return Err(ReassemblyError::MissingChunk(expected_seq));
        }

        if chunk.encrypted {
            let key = key.ok_or_else(|| ReassemblyError::Decryption {
                sequence: chunk.sequence_number,
                reason: "no key available".into(),
            })?;
            let plain =
                provider
                    .decrypt(&chunk.payload, key)
                    .map_err(|e| ReassemblyError::Decryption {
                        sequence: chunk.sequence_number,
                        reason: e.to_string(),
                    })?;
            payload.extend_from_slice(&plain);
        } else {
            payload.extend_from_slice(&chunk.payload);
        }
    }

    let received = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
    if received < expected_total {
        return Err(ReassemblyError::MissingChunk(received));
    }
    if received > expected_total {
        return Err(ReassemblyError::TotalMismatch {
            expected: expected_total,
            found: received,
        });
    }

    Ok(payload)
}
