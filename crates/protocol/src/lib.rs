//! Wire and data types shared by Chunkline transfer engines.
//!
//! Everything here is plain data: requests, chunks, progress snapshots and
//! statistics, plus the limits both peers agree on.

pub mod chunk;
pub mod constants;
pub mod error;
pub mod types;

pub use chunk::Chunk;
pub use error::ProtocolError;
pub use types::{Priority, TransferProgress, TransferRequest, TransferStatistics, TransferStatus};
