use coordinator_common::ids::{IssueId, ProcessId};

/// Shared-store key layout (spec.md §6, stable external visibility).
pub fn issue_status_key(issue_id: &IssueId) -> String {
    format!("poppo:issue:status:{issue_id}")
}

pub fn issue_metadata_key(issue_id: &IssueId) -> String {
    format!("poppo:issue:metadata:{issue_id}")
}

pub fn issue_lock_key(issue_id: &IssueId) -> String {
    format!("poppo:lock:issue:{issue_id}")
}

pub fn process_info_key(process_id: &ProcessId) -> String {
    format!("poppo:process:info:{process_id}")
}

pub fn process_heartbeat_key(process_id: &ProcessId) -> String {
    format!("poppo:process:heartbeat:{process_id}")
}

pub const ISSUES_PROCESSING_SET: &str = "poppo:issues:processing";
pub const ISSUES_PROCESSED_SET: &str = "poppo:issues:processed";
pub const PROCESSES_ACTIVE_SET: &str = "poppo:processes:active";
