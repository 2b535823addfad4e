use std::time::Duration;

/// Smallest chunk size the engine will produce (1 KiB).
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest chunk size the engine will produce (1 MiB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Lower bound for the number of simultaneously transferring transfers.
pub const MIN_CONCURRENT_TRANSFERS: usize = 1;

/// Upper bound for the number of simultaneously transferring transfers.
pub const MAX_CONCURRENT_TRANSFERS: usize = 10;

/// Default concurrency cap.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Period of the admission/statistics tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Largest payload a single transfer may declare (16 GiB).
///
/// Chunk tables are held in memory, so this bounds what a peer can ask us to
/// buffer.
pub const MAX_TRANSFER_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Clamps a requested chunk size into `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
pub fn clamp_chunk_size(size: usize) -> usize {
    size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Clamps a requested concurrency cap into
/// `[MIN_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS]`.
pub fn clamp_max_concurrent(cap: usize) -> usize {
    cap.clamp(MIN_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS)
}

/// Derives the wire chunk id from a transfer id and sequence number.
pub fn chunk_id(transfer_id: &str, sequence: u32) -> String {
    format!("{transfer_id}-chunk-{sequence}")
}
