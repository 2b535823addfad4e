//! Typed events produced by the engine.

use chunkline_protocol::{TransferProgress, TransferRequest};
use tokio::sync::mpsc;
use tracing::warn;

/// Default event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted by the transfer engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A request entered the admission queue.
    Queued(TransferRequest),
    /// A request was admitted and is now transferring.
    Started(TransferProgress),
    /// A verified chunk was recorded.
    ChunkReceived {
        progress: TransferProgress,
        sequence: u32,
    },
    /// A chunk failed its digest check and was discarded.
    ChunkCorrupted {
        transfer_id: String,
        sequence: u32,
        expected: String,
        actual: String,
    },
    /// Every chunk arrived and the payload verified.
    Completed {
        progress: TransferProgress,
        /// Hex SHA-256 of the assembled plaintext.
        digest: String,
        /// Assembled payload; `None` on the sending side.
        payload: Option<Vec<u8>>,
    },
    Failed {
        progress: TransferProgress,
        error: String,
    },
    Paused(TransferProgress),
    Resumed(TransferProgress),
    Cancelled(TransferProgress),
}

impl TransferEvent {
    /// Canonical event name, e.g. `transfer:queued`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued(_) => "transfer:queued",
            Self::Started(_) => "transfer:started",
            Self::ChunkReceived { .. } => "chunk:received",
            Self::ChunkCorrupted { .. } => "chunk:corrupted",
            Self::Completed { .. } => "transfer:completed",
            Self::Failed { .. } => "transfer:failed",
            Self::Paused(_) => "transfer:paused",
            Self::Resumed(_) => "transfer:resumed",
            Self::Cancelled(_) => "transfer:cancelled",
        }
    }

    /// Id of the transfer this event concerns.
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::Queued(request) => &request.id,
            Self::ChunkCorrupted { transfer_id, .. } => transfer_id,
            Self::Started(p)
            | Self::Paused(p)
            | Self::Resumed(p)
            | Self::Cancelled(p)
            | Self::ChunkReceived { progress: p, .. }
            | Self::Completed { progress: p, .. }
            | Self::Failed { progress: p, .. } => &p.transfer_id,
        }
    }
}

/// Non-blocking sending half of the event channel.
///
/// The engine never waits on a slow consumer. [`emit`](Self::emit) drops an
/// event it cannot queue; [`try_emit`](Self::try_emit) hands it back so the
/// caller can keep what must not be lost.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventSender {
    /// Creates a bounded channel pair.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Delivers an event, returning `false` if it was dropped.
    pub fn emit(&self, event: TransferEvent) -> bool {
        self.try_emit(event).is_ok()
    }

    /// Delivers an event, returning it if the channel is full or closed.
    pub fn try_emit(&self, event: TransferEvent) -> Result<(), TransferEvent> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => {
                warn!(
                    event = event.name(),
                    transfer = %event.transfer_id(),
                    "event channel full, event not delivered"
                );
                event
            }
            mpsc::error::TrySendError::Closed(event) => event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransferRequest {
        TransferRequest::new("a.bin", 1).with_id("t1")
    }

    #[test]
    fn names_match_event_surface() {
        let p = TransferProgress::pending(&request());
        assert_eq!(TransferEvent::Queued(request()).name(), "transfer:queued");
        assert_eq!(TransferEvent::Started(p.clone()).name(), "transfer:started");
        assert_eq!(TransferEvent::Paused(p.clone()).name(), "transfer:paused");
        assert_eq!(TransferEvent::Resumed(p.clone()).name(), "transfer:resumed");
        assert_eq!(TransferEvent::Cancelled(p.clone()).name(), "transfer:cancelled");
        assert_eq!(
            TransferEvent::ChunkReceived {
                progress: p.clone(),
                sequence: 0
            }
            .name(),
            "chunk:received"
        );
        assert_eq!(
            TransferEvent::Failed {
                progress: p,
                error: "x".into()
            }
            .name(),
            "transfer:failed"
        );
    }

    #[test]
    fn transfer_id_accessor() {
        let event = TransferEvent::ChunkCorrupted {
            transfer_id: "t9".into(),
            sequence: 1,
            expected: String::new(),
            actual: String::new(),
        };
        assert_eq!(event.transfer_id(), "t9");
        assert_eq!(TransferEvent::Queued(request()).transfer_id(), "t1");
    }

    #[test]
    fn emit_delivers_in_order() {
        let (tx, mut rx) = EventSender::channel(4);
        assert!(tx.emit(TransferEvent::Queued(request())));
        assert!(tx.emit(TransferEvent::Started(TransferProgress::pending(&request()))));
        assert_eq!(rx.try_recv().unwrap().name(), "transfer:queued");
        assert_eq!(rx.try_recv().unwrap().name(), "transfer:started");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (tx, mut rx) = EventSender::channel(1);
        assert!(tx.emit(TransferEvent::Queued(request())));
        assert!(!tx.emit(TransferEvent::Queued(request())));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn undelivered_event_is_handed_back() {
        let (tx, _rx) = EventSender::channel(1);
        assert!(tx.try_emit(TransferEvent::Queued(request())).is_ok());
        let back = tx
            .try_emit(TransferEvent::Started(TransferProgress::pending(&request())))
            .unwrap_err();
        assert_eq!(back.name(), "transfer:started");
    }

    #[test]
    fn closed_channel_drops() {
        let (tx, rx) = EventSender::channel(1);
        drop(rx);
        assert!(!tx.emit(TransferEvent::Queued(request())));
    }
}
