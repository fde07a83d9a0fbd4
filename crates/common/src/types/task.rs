use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IssueId, ProjectId, TaskId};

/// Task lifecycle states (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A unit of scheduled work. Created by enqueue, mutated only by the
/// scheduler (queue -> processing) and the completion handler
/// (processing -> terminal); workers never mutate a `Task` directly, they
/// propose transitions via the control-plane protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub issue_id: IssueId,
    /// Free-form string used for timeout profiling and statistics.
    pub task_type: String,
    /// 0-100, higher is more urgent.
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub arrival: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(
        project_id: ProjectId,
        issue_id: IssueId,
        task_type: impl Into<String>,
        priority: u8,
    ) -> Self {
        Self {
            id: TaskId::new(),
            project_id,
            issue_id,
            task_type: task_type.into(),
            priority: priority.min(100),
            deadline: None,
            status: TaskStatus::Queued,
            arrival: Utc::now(),
            started: None,
            completed: None,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Mark the task as picked up by the scheduler. Does not touch the
    /// arrival timestamp, which must remain unchanged across a retry
    /// re-append (spec.md §4.4 "Completion").
    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.started = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.completed = Some(Utc::now());
        self.last_error = Some(error.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed = Some(Utc::now());
    }

    /// Reset back to `Queued` for a retry re-append, preserving arrival
    /// time and incrementing the retry counter.
    pub fn requeue_for_retry(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.status = TaskStatus::Queued;
        self.started = None;
        self.last_error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(ProjectId::new("p1"), IssueId::new("42"), "lint", 50)
    }

    #[test]
    fn new_task_starts_queued_with_zero_retries() {
        let t = sample_task();
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.retry_count, 0);
        assert!(t.started.is_none());
    }

    #[test]
    fn retry_preserves_arrival_but_bumps_counter() {
        let mut t = sample_task();
        let arrival = t.arrival;
        t.mark_processing();
        t.requeue_for_retry("worker crashed");
        assert_eq!(t.arrival, arrival);
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.status, TaskStatus::Queued);
        assert!(t.started.is_none());
    }

    #[test]
    fn priority_is_clamped_to_100() {
        let t = Task::new(ProjectId::new("p1"), IssueId::new("1"), "scan", 255);
        assert_eq!(t.priority, 100);
    }
}
