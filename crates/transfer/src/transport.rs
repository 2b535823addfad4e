//! Outbound chunk delivery.
//!
//! The engine never talks to the network. Whatever carries chunks between
//! endpoints implements [`ChunkTransport`]; delivery order and reliability are
//! entirely up to it.

use chunkline_protocol::Chunk;
use tokio::sync::mpsc;
use tracing::trace;

use crate::TransferError;

/// Carries chunks to the remote endpoint.
pub trait ChunkTransport: Send + Sync {
    fn send(&self, chunk: Chunk) -> Result<(), TransferError>;

    /// Sends every chunk in order, stopping at the first failure.
    fn send_all(&self, chunks: Vec<Chunk>) -> Result<(), TransferError> {
        for chunk in chunks {
            self.send(chunk)?;
        }
        Ok(())
    }
}

/// In-process transport over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Chunk>) -> Self {
        Self { tx }
    }

    /// Creates a transport together with the receiving end.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Chunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChunkTransport for ChannelTransport {
    fn send(&self, chunk: Chunk) -> Result<(), TransferError> {
        trace!(transfer = %chunk.transfer_id, seq = chunk.sequence_number, "chunk sent");
        self.tx.send(chunk).map_err(|e| {
            TransferError::Transport(format!("receiver closed, dropped {}", e.0.chunk_id))
        })
    }
}
