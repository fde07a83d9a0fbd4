use coordinator_common::ids::{IssueId, ProcessId, ProjectId, TaskId};
use coordinator_protocol::EventName;
use serde_json::Value;

/// Internal representation of every occurrence the daemon (C6) broadcasts
/// to control-plane clients (spec.md §6 "Events"). Emitted by C2/C3/C4 over
/// an unbounded channel and relayed by the daemon onto the protocol's
/// broadcast channel — components never depend on the protocol crate
/// directly, keeping the event *names* in one place (spec.md §5 "Events for
/// a single issue ... are emitted in causal order").
#[derive(Clone, Debug)]
pub enum CoordinatorEvent {
    QueueUpdated,
    ProjectAdded { project_id: ProjectId },
    ProjectRemoved { project_id: ProjectId },
    ProjectStatusChanged { project_id: ProjectId, enabled: bool },
    WorkerAdded { process_id: ProcessId },
    WorkerRemoved { process_id: ProcessId },
    TaskStarted { task_id: TaskId, issue_id: IssueId },
    TaskCompleted { task_id: TaskId, issue_id: IssueId },
    TaskFailed { task_id: TaskId, issue_id: IssueId, error: String },
    OrphanRepaired { issue_id: IssueId, reason: String, original_pid: u32 },
    DeadlockBroken { process_id: ProcessId, issue_id: IssueId },
    ConfigReloaded,
}

impl CoordinatorEvent {
    pub fn name(&self) -> EventName {
        match self {
            CoordinatorEvent::QueueUpdated => EventName::QueueUpdated,
            CoordinatorEvent::ProjectAdded { .. } => EventName::ProjectAdded,
            CoordinatorEvent::ProjectRemoved { .. } => EventName::ProjectRemoved,
            CoordinatorEvent::ProjectStatusChanged { .. } => EventName::ProjectStatusChanged,
            CoordinatorEvent::WorkerAdded { .. } => EventName::WorkerAdded,
            CoordinatorEvent::WorkerRemoved { .. } => EventName::WorkerRemoved,
            CoordinatorEvent::TaskStarted { .. } => EventName::TaskStarted,
            CoordinatorEvent::TaskCompleted { .. } => EventName::TaskCompleted,
            CoordinatorEvent::TaskFailed { .. } => EventName::TaskFailed,
            CoordinatorEvent::OrphanRepaired { .. } => EventName::OrphanRepaired,
            CoordinatorEvent::DeadlockBroken { .. } => EventName::DeadlockBroken,
            CoordinatorEvent::ConfigReloaded => EventName::ConfigReloaded,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            CoordinatorEvent::QueueUpdated => Value::Null,
            CoordinatorEvent::ProjectAdded { project_id } => serde_json::json!({ "projectId": project_id }),
            CoordinatorEvent::ProjectRemoved { project_id } => serde_json::json!({ "projectId": project_id }),
            CoordinatorEvent::ProjectStatusChanged { project_id, enabled } => {
                serde_json::json!({ "projectId": project_id, "enabled": enabled })
            }
            CoordinatorEvent::WorkerAdded { process_id } => serde_json::json!({ "processId": process_id }),
            CoordinatorEvent::WorkerRemoved { process_id } => serde_json::json!({ "processId": process_id }),
            CoordinatorEvent::TaskStarted { task_id, issue_id } => {
                serde_json::json!({ "taskId": task_id.to_string(), "issueId": issue_id })
            }
            CoordinatorEvent::TaskCompleted { task_id, issue_id } => {
                serde_json::json!({ "taskId": task_id.to_string(), "issueId": issue_id })
            }
            CoordinatorEvent::TaskFailed { task_id, issue_id, error } => {
                serde_json::json!({ "taskId": task_id.to_string(), "issueId": issue_id, "error": error })
            }
            CoordinatorEvent::OrphanRepaired { issue_id, reason, original_pid } => {
                serde_json::json!({ "issueId": issue_id, "reason": reason, "originalPid": original_pid })
            }
            CoordinatorEvent::DeadlockBroken { process_id, issue_id } => {
                serde_json::json!({ "processId": process_id, "issueId": issue_id })
            }
            CoordinatorEvent::ConfigReloaded => Value::Null,
        }
    }
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<CoordinatorEvent>;
