use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::ids::{IssueId, ProcessId};

/// Issue ownership lifecycle states (spec.md §3, state machine in §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipStatus {
    Idle,
    Processing,
    AwaitingResponse,
    Completed,
    Error,
}

impl OwnershipStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::AwaitingResponse => "awaiting-response",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Whether `self -> next` is a legal transition under the state machine
    /// of spec.md §4.2. Transitions not covered there are forbidden.
    pub fn can_transition_to(&self, next: OwnershipStatus) -> bool {
        use OwnershipStatus::*;
        matches!(
            (*self, next),
            (Idle, Processing) | (Processing, Completed) | (Processing, Error)
        )
    }
}

/// Ownership record for a single issue. At any instant at most one record
/// exists with `status = Processing` for a given issue id (spec.md §3
/// invariant).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssueOwnership {
    pub issue_id: IssueId,
    pub status: OwnershipStatus,
    pub owner: ProcessId,
    pub os_pid: u32,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl IssueOwnership {
    pub fn new_processing(
        issue_id: IssueId,
        owner: ProcessId,
        os_pid: u32,
        task_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            issue_id,
            status: OwnershipStatus::Processing,
            owner,
            os_pid,
            task_type: task_type.into(),
            started_at: now,
            last_updated_at: now,
            metadata: HashMap::new(),
        }
    }
}

/// The role a connected process plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Worker,
    Coordinator,
}

/// Process record, keyed by the process's self-chosen identifier (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub os_pid: u32,
    pub role: ProcessRole,
    /// Hostname the process is running on; used by orphan detection to
    /// decide whether the OS-level pid check applies (spec.md §4.2).
    pub hostname: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_issue: Option<IssueId>,
}

impl ProcessRecord {
    pub fn new(process_id: ProcessId, os_pid: u32, role: ProcessRole, hostname: String) -> Self {
        Self {
            process_id,
            os_pid,
            role,
            hostname,
            last_seen: Utc::now(),
            current_issue: None,
        }
    }
}

/// Record produced by the orphan scanner for an ownership record whose
/// owning process is no longer live (spec.md §4.2 "Orphan detection").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub issue_id: IssueId,
    pub owner: ProcessId,
    pub original_pid: u32,
    pub orphaned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_to_processing_and_processing_to_terminal_are_legal() {
        use OwnershipStatus::*;
        assert!(Idle.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(!Idle.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Idle));
    }
}
