use serde::{Deserialize, Serialize};

/// The command set of spec.md §6, versioned at `1.0.0`. Variant names match
/// the wire `command` string via `#[serde(rename)]` so a registry lookup can
/// go straight from the incoming string to a typed match arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "daemon.status")]
    DaemonStatus,
    #[serde(rename = "daemon.stop")]
    DaemonStop,
    #[serde(rename = "daemon.reload")]
    DaemonReload,
    #[serde(rename = "project.list")]
    ProjectList,
    #[serde(rename = "project.add")]
    ProjectAdd,
    #[serde(rename = "project.remove")]
    ProjectRemove,
    #[serde(rename = "project.start")]
    ProjectStart,
    #[serde(rename = "project.stop")]
    ProjectStop,
    #[serde(rename = "project.restart")]
    ProjectRestart,
    #[serde(rename = "project.update")]
    ProjectUpdate,
    #[serde(rename = "queue.status")]
    QueueStatus,
    #[serde(rename = "queue.pause")]
    QueuePause,
    #[serde(rename = "queue.resume")]
    QueueResume,
    #[serde(rename = "queue.clear")]
    QueueClear,
    #[serde(rename = "queue.stats")]
    QueueStats,
    /// Worker-facing pull (spec.md §5 ordering guarantee, §8 scenario S1):
    /// absent from the §6 command table itself, but named directly by both,
    /// so it is wired in alongside the rest rather than left unreachable.
    #[serde(rename = "queue.get-next-task")]
    QueueGetNextTask,
    #[serde(rename = "worker.status")]
    WorkerStatus,
    #[serde(rename = "worker.scale")]
    WorkerScale,
    #[serde(rename = "worker.restart")]
    WorkerRestart,
    #[serde(rename = "task.list")]
    TaskList,
    #[serde(rename = "task.status")]
    TaskStatus,
    #[serde(rename = "task.cancel")]
    TaskCancel,
    #[serde(rename = "task.retry")]
    TaskRetry,
    #[serde(rename = "health.check")]
    HealthCheck,
    #[serde(rename = "metrics.get")]
    MetricsGet,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::DaemonStatus => "daemon.status",
            CommandName::DaemonStop => "daemon.stop",
            CommandName::DaemonReload => "daemon.reload",
            CommandName::ProjectList => "project.list",
            CommandName::ProjectAdd => "project.add",
            CommandName::ProjectRemove => "project.remove",
            CommandName::ProjectStart => "project.start",
            CommandName::ProjectStop => "project.stop",
            CommandName::ProjectRestart => "project.restart",
            CommandName::ProjectUpdate => "project.update",
            CommandName::QueueStatus => "queue.status",
            CommandName::QueuePause => "queue.pause",
            CommandName::QueueResume => "queue.resume",
            CommandName::QueueClear => "queue.clear",
            CommandName::QueueStats => "queue.stats",
            CommandName::QueueGetNextTask => "queue.get-next-task",
            CommandName::WorkerStatus => "worker.status",
            CommandName::WorkerScale => "worker.scale",
            CommandName::WorkerRestart => "worker.restart",
            CommandName::TaskList => "task.list",
            CommandName::TaskStatus => "task.status",
            CommandName::TaskCancel => "task.cancel",
            CommandName::TaskRetry => "task.retry",
            CommandName::HealthCheck => "health.check",
            CommandName::MetricsGet => "metrics.get",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "daemon.status" => CommandName::DaemonStatus,
            "daemon.stop" => CommandName::DaemonStop,
            "daemon.reload" => CommandName::DaemonReload,
            "project.list" => CommandName::ProjectList,
            "project.add" => CommandName::ProjectAdd,
            "project.remove" => CommandName::ProjectRemove,
            "project.start" => CommandName::ProjectStart,
            "project.stop" => CommandName::ProjectStop,
            "project.restart" => CommandName::ProjectRestart,
            "project.update" => CommandName::ProjectUpdate,
            "queue.status" => CommandName::QueueStatus,
            "queue.pause" => CommandName::QueuePause,
            "queue.resume" => CommandName::QueueResume,
            "queue.clear" => CommandName::QueueClear,
            "queue.stats" => CommandName::QueueStats,
            "queue.get-next-task" => CommandName::QueueGetNextTask,
            "worker.status" => CommandName::WorkerStatus,
            "worker.scale" => CommandName::WorkerScale,
            "worker.restart" => CommandName::WorkerRestart,
            "task.list" => CommandName::TaskList,
            "task.status" => CommandName::TaskStatus,
            "task.cancel" => CommandName::TaskCancel,
            "task.retry" => CommandName::TaskRetry,
            "health.check" => CommandName::HealthCheck,
            "metrics.get" => CommandName::MetricsGet,
            _ => return None,
        })
    }

    /// Per-command timeout override (spec.md §4.5: "implicit 30s deadline,
    /// overridable per command"). Most commands here are fast registry/store
    /// lookups; `queue.get-next-task` additionally waits on a C3 allocation
    /// and a C2 checkout, so it gets a longer allowance.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            CommandName::QueueGetNextTask => 60,
            _ => 30,
        }
    }
}

/// Event names broadcast from server to client (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "queue.updated")]
    QueueUpdated,
    #[serde(rename = "project.added")]
    ProjectAdded,
    #[serde(rename = "project.removed")]
    ProjectRemoved,
    #[serde(rename = "project.status-changed")]
    ProjectStatusChanged,
    #[serde(rename = "worker.added")]
    WorkerAdded,
    #[serde(rename = "worker.removed")]
    WorkerRemoved,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "orphan.repaired")]
    OrphanRepaired,
    #[serde(rename = "deadlock.broken")]
    DeadlockBroken,
    #[serde(rename = "config.reloaded")]
    ConfigReloaded,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::QueueUpdated => "queue.updated",
            EventName::ProjectAdded => "project.added",
            EventName::ProjectRemoved => "project.removed",
            EventName::ProjectStatusChanged => "project.status-changed",
            EventName::WorkerAdded => "worker.added",
            EventName::WorkerRemoved => "worker.removed",
            EventName::TaskStarted => "task.started",
            EventName::TaskCompleted => "task.completed",
            EventName::TaskFailed => "task.failed",
            EventName::OrphanRepaired => "orphan.repaired",
            EventName::DeadlockBroken => "deadlock.broken",
            EventName::ConfigReloaded => "config.reloaded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_name_roundtrips_through_wire_string() {
        for name in [
            CommandName::DaemonStatus,
            CommandName::ProjectAdd,
            CommandName::QueuePause,
            CommandName::QueueGetNextTask,
            CommandName::TaskRetry,
            CommandName::MetricsGet,
        ] {
            let wire = name.as_str();
            assert_eq!(CommandName::from_str(wire), Some(name));
        }
    }

    #[test]
    fn unknown_command_string_yields_none() {
        assert_eq!(CommandName::from_str("bogus.command"), None);
    }
}
