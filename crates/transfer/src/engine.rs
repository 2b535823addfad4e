//! The transfer engine façade.
//!
//! [`TransferEngine`] owns the store, the admission scheduler, the statistics
//! and the outbound chunk cache. Every operation is a synchronous `&mut self`
//! call; when the engine is shared between tasks it sits behind a
//! [`SharedEngine`](crate::SharedEngine).

use std::collections::HashMap;
use std::sync::Arc;

use chunkline_protocol::constants::{clamp_chunk_size, clamp_max_concurrent};
use chunkline_protocol::{
    Chunk, TransferProgress, TransferRequest, TransferStatistics, TransferStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::TransferError;
use crate::codec;
use crate::config::TransferConfig;
use crate::crypto::{CryptoError, EncryptionKey, EncryptionProvider};
use crate::events::{EventSender, TransferEvent};
use crate::integrity;
use crate::progress::StatisticsTracker;
use crate::scheduler::{AdmissionPolicy, AdmissionScheduler};
use crate::store::{Completeness, TransferStore};
use crate::validation::validate_request;

/// What happened to a chunk handed to [`TransferEngine::receive_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Verified and recorded. More chunks are expected, or the transfer is
    /// paused and completes on resume.
    Recorded,
    /// Already held; ignored.
    Duplicate,
    /// The last missing chunk; the payload was assembled and verified. It
    /// travels on the `Completed` event, or is held for
    /// [`TransferEngine::take_completed`] when that event could not be queued.
    Completed,
    /// The last missing chunk, but assembly or verification failed and the
    /// transfer was failed.
    Failed,
    /// Digest mismatch. The sequence number is on the failed list and can be
    /// retransmitted.
    Corrupted,
    /// Belongs to a transfer that already finished.
    Dropped,
}

/// Chunks prepared for sending, kept until the transfer finishes so that
/// missing sequence numbers can be sent again.
struct Outbound {
    chunks: Vec<Chunk>,
    /// Digest of the plaintext payload.
    digest: String,
}

/// An assembled inbound payload whose `Completed` event could not be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransfer {
    pub progress: TransferProgress,
    pub digest: String,
    pub payload: Vec<u8>,
}

/// Chunked transfer engine for one endpoint.
pub struct TransferEngine {
    config: TransferConfig,
    store: TransferStore,
    scheduler: AdmissionScheduler,
    stats: StatisticsTracker,
    provider: Arc<dyn EncryptionProvider>,
    keys: HashMap<String, EncryptionKey>,
    outbound: HashMap<String, Outbound>,
    unclaimed: HashMap<String, CompletedTransfer>,
    events: EventSender,
    event_rx: Option<mpsc::Receiver<TransferEvent>>,
}

impl TransferEngine {
    /// Creates an engine. The configuration is clamped into its accepted ranges.
    pub fn new(config: TransferConfig, provider: Arc<dyn EncryptionProvider>) -> Self {
        let config = config.clamped();
        let (events, event_rx) = EventSender::channel(config.event_capacity);
        Self {
            store: TransferStore::new(config.finished_history),
            scheduler: AdmissionScheduler::new(config.admission_policy),
            stats: StatisticsTracker::new(),
            provider,
            keys: HashMap::new(),
            outbound: HashMap::new(),
            unclaimed: HashMap::new(),
            events,
            event_rx: Some(event_rx),
            config,
        }
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.event_rx.take()
    }

    /// Takes a completed payload that could not be delivered as an event.
    pub fn take_completed(&mut self, transfer_id: &str) -> Option<CompletedTransfer> {
        self.unclaimed.remove(transfer_id)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Sets the chunk size for transfers prepared from now on. Returns the
    /// clamped value actually applied.
    pub fn set_chunk_size(&mut self, size: usize) -> usize {
        self.config.chunk_size = clamp_chunk_size(size);
        info!(chunk_size = self.config.chunk_size, "chunk size updated");
        self.config.chunk_size
    }

    /// Sets the concurrency cap. Returns the clamped value actually applied.
    ///
    /// Lowering the cap never interrupts running transfers; it only delays
    /// new admissions.
    pub fn set_max_concurrent(&mut self, cap: usize) -> usize {
        self.config.max_concurrent = clamp_max_concurrent(cap);
        info!(max_concurrent = self.config.max_concurrent, "concurrency cap updated");
        self.config.max_concurrent
    }

    pub fn set_admission_policy(&mut self, policy: AdmissionPolicy) {
        self.config.admission_policy = policy;
        self.scheduler.set_policy(policy);
    }

    /// Registers a key that requests can refer to by `encryption_key_id`.
    pub fn register_key(&mut self, key_id: impl Into<String>, key: EncryptionKey) {
        let key_id = key_id.into();
        debug!(key = %key_id, "encryption key registered");
        self.keys.insert(key_id, key);
    }

    /// Validates a request and queues it for admission.
    ///
    /// The transfer starts on the next [`tick`](Self::tick).
    pub fn initiate_transfer(&mut self, request: TransferRequest) -> Result<(), TransferError> {
        validate_request(&request)?;
        if self.store.contains(&request.id) || self.scheduler.contains(&request.id) {
            return Err(TransferError::DuplicateTransfer(request.id));
        }

        info!(
            transfer = %request.id,
            file = %request.file_name,
            size = request.total_size,
            priority = ?request.priority,
            "transfer requested"
        );
        self.stats.record_requested();
        self.scheduler.enqueue(request.clone());
        self.events.emit(TransferEvent::Queued(request));
        Ok(())
    }

    /// Admits queued transfers into free slots and refreshes speeds and
    /// statistics. Returns the number of transfers admitted.
    pub fn tick(&mut self) -> usize {
        let admitted = self.admit();
        self.store.refresh_speeds();
        self.refresh_statistics();
        trace!(
            admitted,
            active = self.store.active_count(),
            queued = self.scheduler.len(),
            "scheduler tick"
        );
        admitted
    }

    /// Splits `payload` into chunks for sending and retains them for
    /// retransmission. Chunks are not delivered; hand them to a transport.
    ///
    /// With no explicit `key`, the key registered under the request's
    /// `encryption_key_id` is used. The transfer may still be queued.
    pub fn prepare_for_send(
        &mut self,
        transfer_id: &str,
        payload: &[u8],
        key: Option<&EncryptionKey>,
    ) -> Result<&[Chunk], TransferError> {
        let request = self
            .find_request(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if payload.len() as u64 != request.total_size {
            return Err(TransferError::SizeMismatch {
                transfer_id: transfer_id.to_string(),
                expected: request.total_size,
                actual: payload.len() as u64,
            });
        }
        let key = match key {
            Some(key) => Some(key.clone()),
            None => self.registered_key(request)?,
        };

        let chunks = codec::split(
            transfer_id,
            payload,
            self.config.chunk_size,
            key.as_ref(),
            self.provider.as_ref(),
        )?;
        let total = chunks.len() as u32;
        if self.store.contains(transfer_id) {
            self.store.mark_outbound(transfer_id)?;
            self.store.set_total_chunks(transfer_id, total)?;
        }

        debug!(
            transfer = %transfer_id,
            chunks = total,
            encrypted = key.is_some(),
            "payload prepared for send"
        );
        let outbound = Outbound {
            chunks,
            digest: integrity::digest(payload),
        };
        let slot = self
            .outbound
            .entry(transfer_id.to_string())
            .insert_entry(outbound)
            .into_mut();
        Ok(slot.chunks.as_slice())
    }

    /// Retained chunks for exactly the given sequence numbers, for
    /// retransmission after the peer reports gaps.
    pub fn outbound_chunks(
        &self,
        transfer_id: &str,
        sequences: &[u32],
    ) -> Result<Vec<Chunk>, TransferError> {
        let outbound = self
            .outbound
            .get(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        sequences
            .iter()
            .map(|&seq| {
                outbound.chunks.get(seq as usize).cloned().ok_or_else(|| {
                    TransferError::InvalidChunk(format!(
                        "{transfer_id}: sequence {seq} out of range 0..{}",
                        outbound.chunks.len()
                    ))
                })
            })
            .collect()
    }

    /// Records that the peer holds chunk `sequence` of an outbound transfer.
    ///
    /// Once every chunk is acknowledged the sending side completes; a paused
    /// transfer completes when it is resumed.
    pub fn acknowledge_chunk(
        &mut self,
        transfer_id: &str,
        sequence: u32,
    ) -> Result<Completeness, TransferError> {
        if !self.store.contains(transfer_id) {
            if let Some(status) = self.store.finished_status(transfer_id) {
                debug!(transfer = %transfer_id, seq = sequence, %status, "late acknowledgement ignored");
                return Ok(Completeness::Duplicate);
            }
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        }
        let bytes = self
            .outbound
            .get(transfer_id)
            .and_then(|o| o.chunks.get(sequence as usize))
            .map(|c| c.len() as u64)
            .ok_or_else(|| {
                TransferError::InvalidChunk(format!(
                    "{transfer_id}: no prepared chunk {sequence}"
                ))
            })?;

        let completeness = self.store.record_sent(transfer_id, sequence, bytes)?;
        if completeness == Completeness::Complete && !self.deferred(transfer_id) {
            self.complete_outbound(transfer_id)?;
        }
        Ok(completeness)
    }

    /// Accepts a chunk from the transport.
    ///
    /// Malformed chunks and chunks for unknown transfers are errors. Corrupted
    /// chunks and late chunks for finished transfers are reported through the
    /// outcome; the transfer carries on.
    pub fn receive_chunk(&mut self, chunk: Chunk) -> Result<ChunkOutcome, TransferError> {
        chunk.validate()?;
        let transfer_id = chunk.transfer_id.clone();
        let sequence = chunk.sequence_number;

        if !self.store.contains(&transfer_id) {
            if let Some(status) = self.store.finished_status(&transfer_id) {
                warn!(transfer = %transfer_id, seq = sequence, %status, "late chunk dropped");
                return Ok(ChunkOutcome::Dropped);
            }
            if self.scheduler.contains(&transfer_id) {
                return Err(TransferError::InvalidTransition {
                    transfer_id,
                    from: TransferStatus::Pending,
                    to: TransferStatus::Transferring,
                });
            }
            return Err(TransferError::UnknownTransfer(transfer_id));
        }

        let actual = integrity::digest(&chunk.payload);
        if !actual.eq_ignore_ascii_case(&chunk.digest) {
            self.store
                .mark_failed_chunk(&transfer_id, sequence, chunk.total_chunks)?;
            warn!(
                transfer = %transfer_id,
                seq = sequence,
                expected = %chunk.digest,
                actual = %actual,
                "chunk digest mismatch"
            );
            self.events.emit(TransferEvent::ChunkCorrupted {
                transfer_id,
                sequence,
                expected: chunk.digest,
                actual,
            });
            return Ok(ChunkOutcome::Corrupted);
        }

        let completeness = self.store.record_chunk(chunk)?;
        if completeness == Completeness::Duplicate {
            return Ok(ChunkOutcome::Duplicate);
        }

        if let Some(progress) = self.store.get(&transfer_id) {
            debug!(
                transfer = %transfer_id,
                seq = sequence,
                transferred = progress.transferred_size,
                "chunk recorded"
            );
            self.events.emit(TransferEvent::ChunkReceived {
                progress: progress.clone(),
                sequence,
            });
        }

        if completeness == Completeness::Complete && !self.deferred(&transfer_id) {
            return Ok(self.complete_transfer(&transfer_id));
        }
        Ok(ChunkOutcome::Recorded)
    }

    /// Pauses a transferring transfer. Returns `Ok(false)` if it is not
    /// currently transferring.
    pub fn pause_transfer(&mut self, transfer_id: &str) -> Result<bool, TransferError> {
        self.move_live(transfer_id, TransferStatus::Transferring, TransferStatus::Paused)
    }

    /// Resumes a paused transfer. Returns `Ok(false)` if it is not paused.
    ///
    /// A transfer whose last chunk arrived (or was acknowledged) while paused
    /// completes here.
    pub fn resume_transfer(&mut self, transfer_id: &str) -> Result<bool, TransferError> {
        if !self.move_live(transfer_id, TransferStatus::Paused, TransferStatus::Transferring)? {
            return Ok(false);
        }
        if self.store.is_complete(transfer_id) {
            if self.store.is_outbound(transfer_id) {
                self.complete_outbound(transfer_id)?;
            } else {
                let outcome = self.complete_transfer(transfer_id);
                debug!(transfer = %transfer_id, ?outcome, "held completion finished");
            }
        }
        Ok(true)
    }

    /// Cancels a queued or live transfer.
    pub fn cancel_transfer(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        if let Some(request) = self.scheduler.remove(transfer_id) {
            let mut progress = TransferProgress::pending(&request);
            progress.status = TransferStatus::Cancelled;
            self.outbound.remove(transfer_id);
            self.stats.record_cancelled();
            info!(transfer = %transfer_id, "queued transfer cancelled");
            self.events.emit(TransferEvent::Cancelled(progress));
            self.refresh_statistics();
            return Ok(());
        }

        self.store.set_status(transfer_id, TransferStatus::Cancelled)?;
        self.outbound.remove(transfer_id);
        self.stats.record_cancelled();
        if let Some(removed) = self.store.remove(transfer_id) {
            info!(
                transfer = %transfer_id,
                transferred = removed.progress.transferred_size,
                "transfer cancelled"
            );
            self.events.emit(TransferEvent::Cancelled(removed.progress));
        }
        self.admit();
        self.refresh_statistics();
        Ok(())
    }

    /// Fails a live transfer: records the error, emits `Failed`, frees its
    /// slot and admits the next queued request.
    pub fn fail_transfer(
        &mut self,
        transfer_id: &str,
        error: impl Into<String>,
    ) -> Result<(), TransferError> {
        let error = error.into();
        self.store.set_status(transfer_id, TransferStatus::Failed)?;
        self.store.set_error(transfer_id, &error)?;
        self.outbound.remove(transfer_id);
        self.stats.record_failed();
        warn!(transfer = %transfer_id, error = %error, "transfer failed");
        if let Some(removed) = self.store.remove(transfer_id) {
            self.events.emit(TransferEvent::Failed {
                progress: removed.progress,
                error,
            });
        }
        self.admit();
        self.refresh_statistics();
        Ok(())
    }

    /// Sequence numbers still missing for a live resumable transfer.
    pub fn get_missing_chunks(&self, transfer_id: &str) -> Result<Vec<u32>, TransferError> {
        if self.scheduler.contains(transfer_id) {
            return Err(TransferError::ChunkCountUnknown(transfer_id.to_string()));
        }
        let request = self
            .store
            .request(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if !request.resumable {
            return Err(TransferError::InvalidRequest(format!(
                "{transfer_id}: transfer is not resumable"
            )));
        }
        self.store.missing_chunks(transfer_id)
    }

    /// Progress snapshot. Queued requests report a `pending` snapshot.
    pub fn get_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        self.store.get(transfer_id).cloned().or_else(|| {
            self.scheduler
                .get(transfer_id)
                .map(TransferProgress::pending)
        })
    }

    /// Snapshots of every admitted transfer, ordered by id.
    pub fn get_active_transfers(&self) -> Vec<TransferProgress> {
        let mut active: Vec<TransferProgress> = self
            .store
            .iter()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.transfer_id.cmp(&b.transfer_id));
        active
    }

    /// Process-wide statistics. Counts are current; `average_speed` is as of
    /// the last tick.
    pub fn get_statistics(&self) -> TransferStatistics {
        let mut stats = self.stats.snapshot();
        stats.active_transfers = self.store.active_count();
        stats.queued_transfers = self.scheduler.len();
        stats
    }

    fn admit(&mut self) -> usize {
        let admitted = self
            .scheduler
            .tick(&mut self.store, self.config.max_concurrent);
        for request in &admitted {
            // A payload prepared while queued fixes the chunk count now.
            if let Some(outbound) = self.outbound.get(&request.id) {
                let total = outbound.chunks.len() as u32;
                let fixed = self
                    .store
                    .mark_outbound(&request.id)
                    .and_then(|()| self.store.set_total_chunks(&request.id, total));
                if let Err(e) = fixed {
                    warn!(transfer = %request.id, error = %e, "prepared chunks rejected");
                }
            }
            info!(transfer = %request.id, file = %request.file_name, "transfer started");
            if let Some(progress) = self.store.get(&request.id) {
                self.events.emit(TransferEvent::Started(progress.clone()));
            }
        }
        admitted.len()
    }

    fn complete_transfer(&mut self, transfer_id: &str) -> ChunkOutcome {
        match self.finish_inbound(transfer_id) {
            Ok(()) => ChunkOutcome::Completed,
            Err(e) => {
                if let Err(fail_err) = self.fail_transfer(transfer_id, e.to_string()) {
                    warn!(transfer = %transfer_id, error = %fail_err, "could not fail transfer");
                }
                ChunkOutcome::Failed
            }
        }
    }

    /// Assembles, verifies and retires a fully received transfer.
    fn finish_inbound(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        let request = self
            .store
            .request(transfer_id)
            .cloned()
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        // A cancel may have landed between the last chunk and assembly.
        if let Some(status) = self.store.status(transfer_id)
            && status.is_terminal()
        {
            return Err(TransferError::InvalidTransition {
                transfer_id: transfer_id.to_string(),
                from: status,
                to: TransferStatus::Completed,
            });
        }

        let key = self.registered_key(&request)?;
        let chunks = self.store.take_chunks(transfer_id)?;
        let payload = codec::assemble(&chunks, key.as_ref(), self.provider.as_ref())?;
        if payload.len() as u64 != request.total_size {
            return Err(TransferError::SizeMismatch {
                transfer_id: transfer_id.to_string(),
                expected: request.total_size,
                actual: payload.len() as u64,
            });
        }
        let digest = integrity::digest(&payload);
        if let Some(expected) = &request.file_digest
            && !expected.eq_ignore_ascii_case(&digest)
        {
            return Err(TransferError::IntegrityMismatch {
                transfer_id: transfer_id.to_string(),
                expected: expected.clone(),
                actual: digest,
            });
        }

        self.store.set_status(transfer_id, TransferStatus::Completed)?;
        self.stats.record_completed(request.total_size);
        info!(transfer = %transfer_id, size = payload.len(), digest = %digest, "transfer completed");
        if let Some(removed) = self.store.remove(transfer_id) {
            let event = TransferEvent::Completed {
                progress: removed.progress,
                digest,
                payload: Some(payload),
            };
            if let Err(TransferEvent::Completed {
                progress,
                digest,
                payload: Some(payload),
            }) = self.events.try_emit(event)
            {
                info!(transfer = %transfer_id, "payload held until taken");
                self.unclaimed.insert(
                    transfer_id.to_string(),
                    CompletedTransfer {
                        progress,
                        digest,
                        payload,
                    },
                );
            }
        }
        self.admit();
        self.refresh_statistics();
        Ok(())
    }

    /// Retires an outbound transfer once every chunk is acknowledged.
    fn complete_outbound(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        self.store.set_status(transfer_id, TransferStatus::Completed)?;
        let digest = self
            .outbound
            .remove(transfer_id)
            .map(|o| o.digest)
            .unwrap_or_default();
        if let Some(removed) = self.store.remove(transfer_id) {
            self.stats.record_completed(removed.request.total_size);
            info!(transfer = %transfer_id, size = removed.request.total_size, "transfer delivered");
            self.events.emit(TransferEvent::Completed {
                progress: removed.progress,
                digest,
                payload: None,
            });
        }
        self.admit();
        self.refresh_statistics();
        Ok(())
    }

    fn move_live(
        &mut self,
        transfer_id: &str,
        from: TransferStatus,
        to: TransferStatus,
    ) -> Result<bool, TransferError> {
        let Some(status) = self.store.status(transfer_id) else {
            if self.scheduler.contains(transfer_id) {
                debug!(transfer = %transfer_id, %to, "transfer still queued, ignoring");
                return Ok(false);
            }
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        };
        if status != from {
            debug!(transfer = %transfer_id, %status, %to, "transition ignored");
            return Ok(false);
        }

        self.store.set_status(transfer_id, to)?;
        info!(transfer = %transfer_id, %to, "transfer status changed");
        if let Some(progress) = self.store.get(transfer_id).cloned() {
            let event = match to {
                TransferStatus::Paused => TransferEvent::Paused(progress),
                _ => TransferEvent::Resumed(progress),
            };
            self.events.emit(event);
        }
        self.refresh_statistics();
        Ok(true)
    }

    /// Completion of a paused transfer waits for [`resume_transfer`](Self::resume_transfer).
    fn deferred(&self, transfer_id: &str) -> bool {
        let paused = self.store.status(transfer_id) == Some(TransferStatus::Paused);
        if paused {
            debug!(transfer = %transfer_id, "all chunks present, completion waits for resume");
        }
        paused
    }

    fn find_request(&self, transfer_id: &str) -> Option<&TransferRequest> {
        self.store
            .request(transfer_id)
            .or_else(|| self.scheduler.get(transfer_id))
    }

    /// Resolves the key a request refers to. Requests without a key id get
    /// `None`; a key id nobody registered is an error.
    fn registered_key(
        &self,
        request: &TransferRequest,
    ) -> Result<Option<EncryptionKey>, TransferError> {
        let Some(key_id) = request.encryption_key_id.as_deref() else {
            return Ok(None);
        };
        self.keys.get(key_id).cloned().map(Some).ok_or_else(|| {
            TransferError::Crypto(CryptoError::InvalidKey(format!(
                "no key registered as {key_id}"
            )))
        })
    }

    fn refresh_statistics(&mut self) {
        self.stats.refresh(
            self.store.iter().filter(|p| !p.status.is_terminal()),
            self.scheduler.len(),
        );
    }
}
