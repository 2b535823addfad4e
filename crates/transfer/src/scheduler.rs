//! Admission control: bounds how many transfers move at once.

use std::collections::VecDeque;

use chunkline_protocol::{TransferRequest, TransferStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::TransferStore;

/// Order in which queued requests are admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Strict arrival order. The request's priority is ignored.
    #[default]
    Fifo,
    /// Highest priority first; arrival order among equal priorities.
    Priority,
}

/// FIFO backlog of requests waiting for an admission slot.
#[derive(Debug, Default)]
pub struct AdmissionScheduler {
    queue: VecDeque<TransferRequest>,
    policy: AdmissionPolicy,
}

impl AdmissionScheduler {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            policy,
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: AdmissionPolicy) {
        self.policy = policy;
    }

    /// Appends a request to the back of the queue.
    pub fn enqueue(&mut self, request: TransferRequest) {
        debug!(transfer = %request.id, queued = self.queue.len() + 1, "request queued");
        self.queue.push_back(request);
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.queue.iter().any(|r| r.id == transfer_id)
    }

    pub fn get(&self, transfer_id: &str) -> Option<&TransferRequest> {
        self.queue.iter().find(|r| r.id == transfer_id)
    }

    /// Removes a queued request, returning it if it was waiting.
    pub fn remove(&mut self, transfer_id: &str) -> Option<TransferRequest> {
        let index = self.queue.iter().position(|r| r.id == transfer_id)?;
        self.queue.remove(index)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued requests in queue order.
    pub fn queued(&self) -> impl Iterator<Item = &TransferRequest> {
        self.queue.iter()
    }

    /// Admits queued requests while the store has fewer than `cap` active
    /// transfers. Each admitted request gets a store record in `transferring`.
    ///
    /// Returns the admitted requests in admission order.
    pub fn tick(&mut self, store: &mut TransferStore, cap: usize) -> Vec<TransferRequest> {
        let mut admitted = Vec::new();
        while store.active_count() < cap {
            let Some(request) = self.pop_next() else {
                break;
            };
            if let Err(e) = store.create_progress(&request) {
                // An id already live in the store cannot be admitted twice.
                warn!(transfer = %request.id, error = %e, "admission skipped");
                continue;
            }
            if let Err(e) = store.set_status(&request.id, TransferStatus::Transferring) {
                warn!(transfer = %request.id, error = %e, "admission transition failed");
                store.remove(&request.id);
                continue;
            }
            admitted.push(request);
        }
        admitted
    }

    fn pop_next(&mut self) -> Option<TransferRequest> {
        match self.policy {
            AdmissionPolicy::Fifo => self.queue.pop_front(),
            AdmissionPolicy::Priority => {
                let mut best: Option<usize> = None;
                for (i, request) in self.queue.iter().enumerate() {
                    if best.is_none_or(|b| request.priority > self.queue[b].priority) {
                        best = Some(i);
                    }
                }
                self.queue.remove(best?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkline_protocol::Priority;

    fn request(id: &str, priority: Priority) -> TransferRequest {
        TransferRequest::new("f.bin", 10)
            .with_id(id)
            .with_priority(priority)
    }

    fn transferring(store: &TransferStore) -> usize {
        store
            .iter()
            .filter(|p| p.status == TransferStatus::Transferring)
            .count()
    }

    #[test]
    fn admits_up_to_cap() {
        let mut scheduler = AdmissionScheduler::default();
        let mut store = TransferStore::default();
        for id in ["a", "b", "c"] {
            scheduler.enqueue(request(id, Priority::Medium));
        }

        let admitted = scheduler.tick(&mut store, 2);
        assert_eq!(admitted.len(), 2);
        assert_eq!(transferring(&store), 2);
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.contains("c"));

        // No free slot: nothing happens.
        assert!(scheduler.tick(&mut store, 2).is_empty());

        store.set_status("a", TransferStatus::Completed).unwrap();
        store.remove("a");
        let admitted = scheduler.tick(&mut store, 2);
        assert_eq!(admitted[0].id, "c");
        assert!(scheduler.is_empty());
        assert_eq!(transferring(&store), 2);
    }

    #[test]
    fn fifo_ignores_priority() {
        let mut scheduler = AdmissionScheduler::new(AdmissionPolicy::Fifo);
        let mut store = TransferStore::default();
        scheduler.enqueue(request("low", Priority::Low));
        scheduler.enqueue(request("urgent", Priority::Urgent));

        let admitted = scheduler.tick(&mut store, 1);
        assert_eq!(admitted[0].id, "low");
    }

    #[test]
    fn priority_policy_admits_highest_first() {
        let mut scheduler = AdmissionScheduler::new(AdmissionPolicy::Priority);
        let mut store = TransferStore::default();
        scheduler.enqueue(request("low", Priority::Low));
        scheduler.enqueue(request("high-1", Priority::High));
        scheduler.enqueue(request("urgent", Priority::Urgent));
        scheduler.enqueue(request("high-2", Priority::High));

        let order: Vec<String> = scheduler
            .tick(&mut store, 10)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(order, vec!["urgent", "high-1", "high-2", "low"]);
    }

    #[test]
    fn paused_transfers_keep_their_slot() {
        let mut scheduler = AdmissionScheduler::default();
        let mut store = TransferStore::default();
        scheduler.enqueue(request("a", Priority::Medium));
        scheduler.enqueue(request("b", Priority::Medium));
        scheduler.tick(&mut store, 1);
        store.set_status("a", TransferStatus::Paused).unwrap();

        assert!(scheduler.tick(&mut store, 1).is_empty());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn cap_never_exceeded() {
        let mut scheduler = AdmissionScheduler::default();
        let mut store = TransferStore::default();
        for round in 0..5 {
            for i in 0..4 {
                scheduler.enqueue(request(&format!("r{round}-{i}"), Priority::Medium));
            }
            scheduler.tick(&mut store, 3);
            assert!(store.active_count() <= 3);

            // Finish one transfer per round.
            let first = store.iter().map(|p| p.transfer_id.clone()).next();
            if let Some(id) = first {
                store.set_status(&id, TransferStatus::Completed).unwrap();
                store.remove(&id);
            }
            scheduler.tick(&mut store, 3);
            assert!(store.active_count() <= 3);
        }
    }

    #[test]
    fn duplicate_live_id_is_skipped() {
        let mut scheduler = AdmissionScheduler::default();
        let mut store = TransferStore::default();
        scheduler.enqueue(request("a", Priority::Medium));
        scheduler.tick(&mut store, 5);

        scheduler.enqueue(request("a", Priority::Medium));
        scheduler.enqueue(request("b", Priority::Medium));
        let admitted = scheduler.tick(&mut store, 5);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, "b");
    }

    #[test]
    fn remove_queued_request() {
        let mut scheduler = AdmissionScheduler::default();
        scheduler.enqueue(request("a", Priority::Medium));
        scheduler.enqueue(request("b", Priority::Medium));
        assert_eq!(scheduler.remove("a").unwrap().id, "a");
        assert!(scheduler.remove("a").is_none());
        assert_eq!(scheduler.queued().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["b"]);
    }
}
