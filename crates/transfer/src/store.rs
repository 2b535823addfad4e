use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use chunkline_protocol::{Chunk, TransferProgress, TransferRequest, TransferStatus};
use tracing::{debug, trace};

use crate::TransferError;
use crate::progress::{SpeedCalculator, percent};

/// Default number of finished transfer ids remembered for late-chunk detection.
pub const DEFAULT_FINISHED_HISTORY: usize = 256;

/// Result of recording a chunk (or an acknowledgement) against a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Recorded; more chunks are still expected.
    Incomplete,
    /// Recorded, and every sequence number is now present.
    Complete,
    /// This sequence number was already present; nothing changed.
    Duplicate,
}

/// Which side of the transfer this engine is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// No chunks prepared or received yet.
    Undecided,
    Inbound,
    Outbound,
}

/// Everything held for one live transfer.
struct TransferRecord {
    request: TransferRequest,
    progress: TransferProgress,
    direction: Direction,
    /// Received chunks keyed by sequence number.
    received: BTreeMap<u32, Chunk>,
    /// Acknowledged outbound sequence numbers.
    sent: BTreeSet<u32>,
    speed: SpeedCalculator,
}

impl TransferRecord {
    fn present(&self, sequence: u32) -> bool {
        match self.direction {
            Direction::Outbound => self.sent.contains(&sequence),
            _ => self.received.contains_key(&sequence),
        }
    }

    fn present_count(&self) -> usize {
        match self.direction {
            Direction::Outbound => self.sent.len(),
            _ => self.received.len(),
        }
    }

    fn claim_direction(&mut self, direction: Direction) -> Result<(), TransferError> {
        match self.direction {
            Direction::Undecided => {
                self.direction = direction;
                Ok(())
            }
            current if current == direction => Ok(()),
            _ => Err(TransferError::InvalidChunk(format!(
                "{}: transfer is already {:?}",
                self.request.id, self.direction
            ))),
        }
    }

    /// Advances byte counters and sequence bookkeeping after a new arrival.
    fn advance(&mut self, sequence: u32, bytes: u64) -> Completeness {
        let p = &mut self.progress;
        p.transferred_size += bytes;
        p.progress = percent(p.transferred_size, p.total_size);
        p.last_chunk = Some(p.last_chunk.map_or(sequence, |last| last.max(sequence)));
        p.failed_chunks.retain(|&s| s != sequence);

        let mut next = p.highest_contiguous.map_or(0, |h| h + 1);
        let mut highest = p.highest_contiguous;
        while self.present(next) {
            highest = Some(next);
            next += 1;
        }
        self.progress.highest_contiguous = highest;

        self.speed.add_sample(bytes);
        self.progress.speed = self.speed.bytes_per_second();
        self.progress.eta_secs = self
            .speed
            .eta(self.progress.remaining())
            .map(|d| d.as_secs_f64());

        let total = self.progress.total_chunks.unwrap_or(u32::MAX) as usize;
        if self.present_count() == total {
            self.progress.progress = 100.0;
            Completeness::Complete
        } else {
            Completeness::Incomplete
        }
    }
}

/// A transfer taken out of the store.
#[derive(Debug)]
pub struct RemovedTransfer {
    pub request: TransferRequest,
    pub progress: TransferProgress,
    /// Received chunks still held, ordered by sequence.
    pub chunks: Vec<Chunk>,
}

/// Authoritative in-memory record of every live transfer.
///
/// Owned by the engine and mutated only through `&mut self`; queued requests
/// live in the scheduler, not here.
pub struct TransferStore {
    records: HashMap<String, TransferRecord>,
    finished: VecDeque<(String, TransferStatus)>,
    finished_capacity: usize,
}

impl Default for TransferStore {
    fn default() -> Self {
        Self::new(DEFAULT_FINISHED_HISTORY)
    }
}

impl TransferStore {
    /// Creates an empty store remembering up to `finished_history` finished ids.
    pub fn new(finished_history: usize) -> Self {
        Self {
            records: HashMap::new(),
            finished: VecDeque::with_capacity(finished_history),
            finished_capacity: finished_history,
        }
    }

    /// Creates a `pending` record for `request`.
    pub fn create_progress(
        &mut self,
        request: &TransferRequest,
    ) -> Result<&TransferProgress, TransferError> {
        if self.records.contains_key(&request.id) {
            return Err(TransferError::DuplicateTransfer(request.id.clone()));
        }
        // A reused id is live again; forget its old outcome.
        self.finished.retain(|(id, _)| id != &request.id);

        let record = TransferRecord {
            request: request.clone(),
            progress: TransferProgress::pending(request),
            direction: Direction::Undecided,
            received: BTreeMap::new(),
            sent: BTreeSet::new(),
            speed: SpeedCalculator::default(),
        };
        let record = self.records.entry(request.id.clone()).or_insert(record);
        debug!(transfer = %request.id, file = %request.file_name, "progress record created");
        Ok(&record.progress)
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.records.contains_key(transfer_id)
    }

    pub fn get(&self, transfer_id: &str) -> Option<&TransferProgress> {
        self.records.get(transfer_id).map(|r| &r.progress)
    }

    pub fn request(&self, transfer_id: &str) -> Option<&TransferRequest> {
        self.records.get(transfer_id).map(|r| &r.request)
    }

    pub fn status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.records.get(transfer_id).map(|r| r.progress.status)
    }

    /// Iterates over every live progress record.
    pub fn iter(&self) -> impl Iterator<Item = &TransferProgress> {
        self.records.values().map(|r| &r.progress)
    }

    /// Number of records holding an admission slot (every non-terminal record).
    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.progress.status.is_terminal())
            .count()
    }

    /// Fixes the chunk count for a transfer. It can be set once; repeating
    /// the same value is a no-op and a different value is an error.
    pub fn set_total_chunks(&mut self, transfer_id: &str, total: u32) -> Result<(), TransferError> {
        let record = self.record_mut(transfer_id)?;
        match record.progress.total_chunks {
            None => {
                record.progress.total_chunks = Some(total);
                Ok(())
            }
            Some(existing) if existing == total => Ok(()),
            Some(existing) => Err(TransferError::InvalidChunk(format!(
                "{transfer_id}: total chunk count is fixed at {existing}, got {total}"
            ))),
        }
    }

    /// Stores a verified inbound chunk keyed by its sequence number.
    pub fn record_chunk(&mut self, chunk: Chunk) -> Result<Completeness, TransferError> {
        let record = self.record_mut(&chunk.transfer_id)?;
        ensure_live(record)?;
        record.claim_direction(Direction::Inbound)?;
        check_total(record, chunk.total_chunks)?;

        let sequence = chunk.sequence_number;
        if record.received.contains_key(&sequence) {
            trace!(transfer = %chunk.transfer_id, seq = sequence, "duplicate chunk ignored");
            return Ok(Completeness::Duplicate);
        }

        let bytes = chunk.payload.len() as u64;
        record.received.insert(sequence, chunk);
        Ok(record.advance(sequence, bytes))
    }

    /// Marks an outbound chunk as delivered.
    pub fn record_sent(
        &mut self,
        transfer_id: &str,
        sequence: u32,
        bytes: u64,
    ) -> Result<Completeness, TransferError> {
        let record = self.record_mut(transfer_id)?;
        ensure_live(record)?;
        record.claim_direction(Direction::Outbound)?;
        let Some(total) = record.progress.total_chunks else {
            return Err(TransferError::ChunkCountUnknown(transfer_id.to_string()));
        };
        if sequence >= total {
            return Err(TransferError::InvalidChunk(format!(
                "{transfer_id}: sequence {sequence} out of range 0..{total}"
            )));
        }
        if !record.sent.insert(sequence) {
            return Ok(Completeness::Duplicate);
        }
        Ok(record.advance(sequence, bytes))
    }

    /// Declares this store the sending side of `transfer_id`.
    pub fn mark_outbound(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        self.record_mut(transfer_id)?.claim_direction(Direction::Outbound)
    }

    /// Records a sequence number that failed verification.
    ///
    /// `total_chunks` is the count the chunk claims; it must agree with a
    /// count already fixed for the transfer, and `sequence` must lie inside it.
    pub fn mark_failed_chunk(
        &mut self,
        transfer_id: &str,
        sequence: u32,
        total_chunks: u32,
    ) -> Result<(), TransferError> {
        let record = self.record_mut(transfer_id)?;
        let total = record.progress.total_chunks.unwrap_or(total_chunks);
        if total != total_chunks {
            return Err(TransferError::InvalidChunk(format!(
                "{transfer_id}: total chunk count is fixed at {total}, got {total_chunks}"
            )));
        }
        if sequence >= total {
            return Err(TransferError::InvalidChunk(format!(
                "{transfer_id}: sequence {sequence} out of range 0..{total}"
            )));
        }
        if !record.present(sequence) && !record.progress.failed_chunks.contains(&sequence) {
            record.progress.failed_chunks.push(sequence);
            record.progress.failed_chunks.sort_unstable();
        }
        Ok(())
    }

    /// Whether every sequence number is present. Always `false` while the
    /// chunk count is unknown.
    pub fn is_complete(&self, transfer_id: &str) -> bool {
        self.records.get(transfer_id).is_some_and(|r| {
            r.progress
                .total_chunks
                .is_some_and(|total| r.present_count() == total as usize)
        })
    }

    /// Whether this store is the sending side of `transfer_id`.
    pub fn is_outbound(&self, transfer_id: &str) -> bool {
        self.records
            .get(transfer_id)
            .is_some_and(|r| r.direction == Direction::Outbound)
    }

    /// Sequence numbers not yet present, ascending.
    ///
    /// Fails with [`TransferError::ChunkCountUnknown`] while nothing has fixed
    /// the chunk count yet, since there is no range to compare against.
    pub fn missing_chunks(&self, transfer_id: &str) -> Result<Vec<u32>, TransferError> {
        let record = self
            .records
            .get(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        let total = record
            .progress
            .total_chunks
            .ok_or_else(|| TransferError::ChunkCountUnknown(transfer_id.to_string()))?;
        Ok((0..total).filter(|&s| !record.present(s)).collect())
    }

    /// Transitions a transfer's status; illegal transitions are rejected.
    ///
    /// Returns the previous status.
    pub fn set_status(
        &mut self,
        transfer_id: &str,
        status: TransferStatus,
    ) -> Result<TransferStatus, TransferError> {
        let record = self.record_mut(transfer_id)?;
        let previous = record.progress.status;
        if !previous.can_transition_to(status) {
            return Err(TransferError::InvalidTransition {
                transfer_id: transfer_id.to_string(),
                from: previous,
                to: status,
            });
        }
        record.progress.status = status;
        if status != TransferStatus::Transferring {
            record.progress.speed = 0.0;
            record.progress.eta_secs = None;
            record.speed.reset();
        }
        debug!(transfer = %transfer_id, from = %previous, to = %status, "status changed");
        Ok(previous)
    }

    /// Records an error message on the progress snapshot.
    pub fn set_error(&mut self, transfer_id: &str, error: &str) -> Result<(), TransferError> {
        self.record_mut(transfer_id)?.progress.error = error.to_string();
        Ok(())
    }

    /// Removes and returns the received chunks, ordered by sequence number.
    pub fn take_chunks(&mut self, transfer_id: &str) -> Result<Vec<Chunk>, TransferError> {
        let record = self.record_mut(transfer_id)?;
        Ok(std::mem::take(&mut record.received).into_values().collect())
    }

    /// Deletes a transfer's progress and chunk table.
    ///
    /// If the record reached a terminal status its id is remembered so that
    /// late chunks can be recognised.
    pub fn remove(&mut self, transfer_id: &str) -> Option<RemovedTransfer> {
        let record = self.records.remove(transfer_id)?;
        if record.progress.status.is_terminal() {
            if self.finished.len() == self.finished_capacity {
                self.finished.pop_front();
            }
            if self.finished_capacity > 0 {
                self.finished
                    .push_back((transfer_id.to_string(), record.progress.status));
            }
        }
        Some(RemovedTransfer {
            request: record.request,
            progress: record.progress,
            chunks: record.received.into_values().collect(),
        })
    }

    /// Final status of a recently finished transfer, if still remembered.
    pub fn finished_status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.finished
            .iter()
            .rev()
            .find(|(id, _)| id == transfer_id)
            .map(|(_, status)| *status)
    }

    /// Recomputes speed and ETA for every record, letting stale samples age out.
    pub fn refresh_speeds(&mut self) {
        let now = Instant::now();
        for record in self.records.values_mut() {
            record.speed.prune(now);
            if record.progress.status == TransferStatus::Transferring {
                record.progress.speed = record.speed.bytes_per_second();
                record.progress.eta_secs = record
                    .speed
                    .eta(record.progress.remaining())
                    .map(|d| d.as_secs_f64());
            }
        }
    }

    fn record_mut(&mut self, transfer_id: &str) -> Result<&mut TransferRecord, TransferError> {
        self.records
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))
    }
}

fn ensure_live(record: &TransferRecord) -> Result<(), TransferError> {
    match record.progress.status {
        TransferStatus::Transferring | TransferStatus::Paused => Ok(()),
        status => Err(TransferError::InvalidTransition {
            transfer_id: record.request.id.clone(),
            from: status,
            to: TransferStatus::Transferring,
        }),
    }
}

fn check_total(record: &mut TransferRecord, total: u32) -> Result<(), TransferError> {
    match record.progress.total_chunks {
        None => {
            record.progress.total_chunks = Some(total);
            Ok(())
        }
        Some(existing) if existing == total => Ok(()),
        Some(existing) => Err(TransferError::InvalidChunk(format!(
            "{}: total chunk count is fixed at {existing}, got {total}",
            record.request.id
        ))),
    }
}
