use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::ids::{ProcessId, ProjectId};

/// Resource quota for a single project (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quota {
    /// Fractional cores.
    pub cpu: f64,
    /// Bytes.
    pub memory: u64,
    pub max_concurrent: u32,
    pub elastic: bool,
    /// Static scheduling priority; used by the re-allocation weight formula.
    pub priority: i32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1024 * 1024 * 1024,
            max_concurrent: 1,
            elastic: false,
            priority: 0,
        }
    }
}

/// Live usage for a single project. Mirrors `Quota`'s dimensions plus the
/// set of active process ids currently charged against it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub cpu: f64,
    pub memory: u64,
    pub concurrent: u32,
    pub active_processes: HashSet<ProcessId>,
}

/// One entry in the elastic-borrow allocation-history log (spec.md §3, §9
/// Open Question: capped ring buffer, default 1,000 entries).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub project_id: ProjectId,
    pub resource_type: ResourceType,
    pub amount: f64,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
}

/// A fixed-capacity ring buffer of allocation-history entries.
#[derive(Clone, Debug, Default)]
pub struct AllocationHistory {
    capacity: usize,
    entries: std::collections::VecDeque<AllocationHistoryEntry>,
}

impl AllocationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: std::collections::VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, entry: AllocationHistoryEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationHistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-project and system-wide usage, as returned by `ResourceManager::snapshot`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub per_project: Vec<(ProjectId, Quota, Usage)>,
    pub system_available_cpu: f64,
    pub system_available_memory: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_entry_past_capacity() {
        let mut history = AllocationHistory::new(2);
        for i in 0..3 {
            history.push(AllocationHistoryEntry {
                timestamp: Utc::now(),
                project_id: ProjectId::new("p1"),
                resource_type: ResourceType::Cpu,
                amount: i as f64,
                reason: "elastic".to_string(),
            });
        }
        assert_eq!(history.len(), 2);
        let amounts: Vec<f64> = history.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![1.0, 2.0]);
    }
}
