use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling priority carried by a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Immutable description of a requested transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub id: String,
    pub file_name: String,
    /// Declared plaintext size in bytes.
    pub total_size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    #[serde(default)]
    pub priority: Priority,
    /// Name of the key (in the receiver's keyring) that decrypts this transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
    #[serde(default)]
    pub resumable: bool,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the plaintext payload, verified after reassembly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_digest: Option<String>,
}

impl TransferRequest {
    /// Creates a request with a fresh uuid v4 id and the current timestamp.
    pub fn new(file_name: impl Into<String>, total_size: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            total_size,
            content_type: "application/octet-stream".into(),
            source_id: String::new(),
            target_id: String::new(),
            priority: Priority::default(),
            encryption_key_id: None,
            resumable: true,
            created_at: Utc::now(),
            file_digest: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_endpoints(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_id = source.into();
        self.target_id = target.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_encryption_key(mut self, key_id: impl Into<String>) -> Self {
        self.encryption_key_id = Some(key_id.into());
        self
    }

    pub fn with_file_digest(mut self, digest: impl Into<String>) -> Self {
        self.file_digest = Some(digest.into());
        self
    }

    pub fn with_resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// `completed`, `failed` and `cancelled` accept no further operations.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// ```text
    /// pending -> transferring -> {paused <-> transferring} -> {completed | failed | cancelled}
    /// pending -> cancelled
    /// ```
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Transferring) | (Pending, Cancelled) => true,
            (Transferring, Paused) | (Paused, Transferring) => true,
            (Transferring, Completed | Failed | Cancelled) => true,
            (Paused, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Progress snapshot for a single transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub transferred_size: u64,
    /// Percent complete, 0-100.
    pub progress: f64,
    /// Bytes per second over the recent window.
    pub speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    pub status: TransferStatus,
    /// Highest sequence number seen so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<u32>,
    /// Highest `n` such that every sequence in `0..=n` is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_contiguous: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_chunks: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TransferProgress {
    /// A fresh `pending` snapshot for a request.
    pub fn pending(request: &TransferRequest) -> Self {
        Self {
            transfer_id: request.id.clone(),
            file_name: request.file_name.clone(),
            total_size: request.total_size,
            transferred_size: 0,
            progress: 0.0,
            speed: 0.0,
            eta_secs: None,
            status: TransferStatus::Pending,
            last_chunk: None,
            highest_contiguous: None,
            failed_chunks: Vec::new(),
            total_chunks: None,
            error: String::new(),
        }
    }

    /// Bytes still expected, saturating at zero.
    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.transferred_size)
    }
}

/// Process-wide aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatistics {
    pub total_transfers: u64,
    pub completed_transfers: u64,
    pub failed_transfers: u64,
    pub cancelled_transfers: u64,
    pub total_bytes_transferred: u64,
    /// Mean speed of the currently active transfers, bytes per second.
    pub average_speed: f64,
    pub active_transfers: usize,
    pub queued_transfers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TransferStatus::Transferring).unwrap();
        assert_eq!(json, "\"transferring\"");
        let parsed: TransferStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TransferStatus::Cancelled);
    }

    #[test]
    fn terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::Transferring.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        use TransferStatus::*;
        assert!(Pending.can_transition_to(Transferring));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Transferring.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));
    }

    #[test]
    fn illegal_transitions() {
        use TransferStatus::*;
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Transferring));
        assert!(!Cancelled.can_transition_to(Transferring));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Transferring.can_transition_to(Pending));
    }

    #[test]
    fn request_builder() {
        let req = TransferRequest::new("report.pdf", 2048)
            .with_id("t1")
            .with_content_type("application/pdf")
            .with_priority(Priority::High)
            .with_encryption_key("k1");
        assert_eq!(req.id, "t1");
        assert_eq!(req.content_type, "application/pdf");
        assert_eq!(req.priority, Priority::High);
        assert_eq!(req.encryption_key_id.as_deref(), Some("k1"));
        assert!(req.resumable);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = TransferRequest::new("a", 1);
        let b = TransferRequest::new("a", 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn request_json_uses_camel_case() {
        let req = TransferRequest::new("a.bin", 10).with_id("t1");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["fileName"], "a.bin");
        assert_eq!(value["totalSize"], 10);
        assert_eq!(value["priority"], "medium");
        assert!(value.get("encryptionKeyId").is_none());
    }

    #[test]
    fn pending_progress_from_request() {
        let req = TransferRequest::new("a.bin", 10).with_id("t1");
        let p = TransferProgress::pending(&req);
        assert_eq!(p.status, TransferStatus::Pending);
        assert_eq!(p.remaining(), 10);
        assert!(p.failed_chunks.is_empty());
    }
}
