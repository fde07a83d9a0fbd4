use std::sync::Arc;

use async_trait::async_trait;
use coordinator_common::ids::{ProjectId, TaskId};
use coordinator_common::types::{Project, Quota};
use coordinator_common::CoordinatorError;
use coordinator_protocol::{CommandHandler, CommandName, CommandRegistry};
use serde::Deserialize;
use serde_json::Value;

use super::Daemon;

/// Thin adapter from the registry's `(CommandName) -> handler` map onto
/// `Daemon::dispatch`, so every command shares one `CommandHandler` impl
/// instead of twenty-four near-identical structs (spec.md §4.5 "command
/// dispatch").
struct Handler {
    daemon: Arc<Daemon>,
    command: CommandName,
}

#[async_trait]
impl CommandHandler for Handler {
    async fn handle(&self, args: Value) -> Result<Value, coordinator_protocol::ProtocolError> {
        self.daemon.dispatch(self.command, args).await.map_err(Into::into)
    }
}

pub fn build_registry(daemon: Arc<Daemon>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    for command in ALL_COMMANDS {
        registry.register(
            command,
            Box::new(Handler { daemon: Arc::clone(&daemon), command }),
        );
    }
    registry
}

const ALL_COMMANDS: [CommandName; 24] = [
    CommandName::DaemonStatus,
    CommandName::DaemonStop,
    CommandName::DaemonReload,
    CommandName::ProjectList,
    CommandName::ProjectAdd,
    CommandName::ProjectRemove,
    CommandName::ProjectStart,
    CommandName::ProjectStop,
    CommandName::ProjectRestart,
    CommandName::ProjectUpdate,
    CommandName::QueueStatus,
    CommandName::QueuePause,
    CommandName::QueueResume,
    CommandName::QueueClear,
    CommandName::QueueStats,
    CommandName::QueueGetNextTask,
    CommandName::WorkerStatus,
    CommandName::WorkerScale,
    CommandName::WorkerRestart,
    CommandName::TaskList,
    CommandName::TaskStatus,
    CommandName::TaskCancel,
    CommandName::TaskRetry,
    CommandName::HealthCheck,
    CommandName::MetricsGet,
];

#[derive(Deserialize)]
struct ProjectIdArg {
    #[serde(rename = "projectId")]
    project_id: String,
}

#[derive(Deserialize)]
struct TaskIdArg {
    #[serde(rename = "taskId")]
    task_id: String,
}

#[derive(Deserialize)]
struct ProjectAddArgs {
    id: String,
    name: String,
    path: String,
    #[serde(default)]
    priority: i32,
    #[serde(rename = "shareWeight", default = "default_share_weight")]
    share_weight: f64,
    #[serde(default)]
    quota: Option<Quota>,
}

fn default_share_weight() -> f64 {
    1.0
}

#[derive(Deserialize, Default)]
struct ProjectUpdateArgs {
    #[serde(rename = "projectId")]
    project_id: String,
    name: Option<String>,
    priority: Option<i32>,
    #[serde(rename = "shareWeight")]
    share_weight: Option<f64>,
    quota: Option<Quota>,
}

#[derive(Deserialize)]
struct GetNextTaskArgs {
    #[serde(rename = "processId")]
    process_id: String,
    #[serde(rename = "osPid", default)]
    os_pid: u32,
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, CoordinatorError> {
    serde_json::from_value(args).map_err(|e| CoordinatorError::InvalidArgs(e.to_string()))
}

fn task_id_of(raw: &str) -> Result<TaskId, CoordinatorError> {
    raw.parse::<uuid::Uuid>()
        .map(TaskId::from)
        .map_err(|e| CoordinatorError::InvalidArgs(format!("invalid taskId: {e}")))
}

impl Daemon {
    pub(crate) async fn dispatch(&self, command: CommandName, args: Value) -> Result<Value, CoordinatorError> {
        match command {
            CommandName::DaemonStatus => self.cmd_daemon_status().await,
            CommandName::DaemonStop => self.cmd_daemon_stop().await,
            CommandName::DaemonReload => self.cmd_daemon_reload().await,
            CommandName::ProjectList => self.cmd_project_list(),
            CommandName::ProjectAdd => self.cmd_project_add(args),
            CommandName::ProjectRemove => self.cmd_project_remove(args),
            CommandName::ProjectStart => self.cmd_project_set_enabled(args, true),
            CommandName::ProjectStop => self.cmd_project_set_enabled(args, false),
            CommandName::ProjectRestart => self.cmd_project_restart(args),
            CommandName::ProjectUpdate => self.cmd_project_update(args),
            CommandName::QueueStatus => self.cmd_queue_status(),
            CommandName::QueuePause => self.cmd_queue_pause(),
            CommandName::QueueResume => self.cmd_queue_resume(),
            CommandName::QueueClear => self.cmd_queue_clear(args),
            CommandName::QueueStats => self.cmd_queue_stats(),
            CommandName::QueueGetNextTask => self.cmd_queue_get_next_task(args).await,
            CommandName::WorkerStatus => self.cmd_worker_status().await,
            CommandName::WorkerScale => self.cmd_worker_scale(args),
            CommandName::WorkerRestart => self.cmd_worker_restart(args).await,
            CommandName::TaskList => self.cmd_task_list(args),
            CommandName::TaskStatus => self.cmd_task_status(args),
            CommandName::TaskCancel => self.cmd_task_cancel(args),
            CommandName::TaskRetry => self.cmd_task_retry(args),
            CommandName::HealthCheck => self.cmd_health_check().await,
            CommandName::MetricsGet => self.cmd_metrics_get(),
        }
    }

    async fn cmd_daemon_status(&self) -> Result<Value, CoordinatorError> {
        let health = self.circuit_breakers.health_snapshot();
        Ok(serde_json::json!({
            "startedAt": self.started_at_rfc3339(),
            "queueLen": self.scheduler.queue_len(),
            "processingLen": self.scheduler.processing_len(),
            "paused": self.scheduler.is_paused(),
            "policy": format!("{:?}", self.scheduler.policy()),
            "projectCount": self.projects.snapshot().len(),
            "components": health.into_iter().map(|(name, healthy)| serde_json::json!({"name": name, "healthy": healthy})).collect::<Vec<_>>(),
        }))
    }

    async fn cmd_daemon_stop(&self) -> Result<Value, CoordinatorError> {
        let _ = self.shutdown_tx.send(true);
        Ok(serde_json::json!({"stopping": true}))
    }

    async fn cmd_daemon_reload(&self) -> Result<Value, CoordinatorError> {
        self.reload_config().await?;
        Ok(serde_json::json!({"reloaded": true}))
    }

    fn cmd_project_list(&self) -> Result<Value, CoordinatorError> {
        Ok(serde_json::to_value(self.projects.snapshot())?)
    }

    fn cmd_project_add(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: ProjectAddArgs = parse_args(args)?;
        let project_id = ProjectId::new(parsed.id);
        let mut project = Project::new(project_id.clone(), parsed.name, parsed.path);
        project.priority = parsed.priority;
        project.share_weight = parsed.share_weight;
        if let Some(quota) = parsed.quota {
            project.quota = quota;
        }

        self.resources.set_quota(project_id.clone(), project.quota.clone());
        self.scheduler.set_share_weight(&project_id, project.share_weight);
        self.projects
            .projects
            .lock()
            .expect("project registry mutex poisoned")
            .insert(project_id.clone(), project);

        let _ = self.events_tx.send(crate::events::CoordinatorEvent::ProjectAdded { project_id });
        Ok(serde_json::json!({"added": true}))
    }

    fn cmd_project_remove(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: ProjectIdArg = parse_args(args)?;
        let project_id = ProjectId::new(parsed.project_id);
        let removed = self
            .projects
            .projects
            .lock()
            .expect("project registry mutex poisoned")
            .remove(&project_id)
            .is_some();
        if !removed {
            return Err(CoordinatorError::NotFound(format!("project {project_id} not registered")));
        }
        let _ = self.events_tx.send(crate::events::CoordinatorEvent::ProjectRemoved { project_id });
        Ok(serde_json::json!({"removed": true}))
    }

    fn cmd_project_set_enabled(&self, args: Value, enabled: bool) -> Result<Value, CoordinatorError> {
        let parsed: ProjectIdArg = parse_args(args)?;
        let project_id = ProjectId::new(parsed.project_id);
        {
            let mut projects = self.projects.projects.lock().expect("project registry mutex poisoned");
            let project = projects
                .get_mut(&project_id)
                .ok_or_else(|| CoordinatorError::NotFound(format!("project {project_id} not registered")))?;
            project.enabled = enabled;
        }
        let _ = self.events_tx.send(crate::events::CoordinatorEvent::ProjectStatusChanged {
            project_id,
            enabled,
        });
        Ok(serde_json::json!({"enabled": enabled}))
    }

    /// No real OS process to restart (spec.md §1 Non-goals: no OS-level
    /// process supervision). Treated as stop-then-start of scheduling for
    /// the project, which is the only thing the coordinator actually owns.
    fn cmd_project_restart(&self, args: Value) -> Result<Value, CoordinatorError> {
        self.cmd_project_set_enabled(args.clone(), false)?;
        self.cmd_project_set_enabled(args, true)
    }

    fn cmd_project_update(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: ProjectUpdateArgs = parse_args(args)?;
        let project_id = ProjectId::new(parsed.project_id);

        let mut projects = self.projects.projects.lock().expect("project registry mutex poisoned");
        let project = projects
            .get_mut(&project_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("project {project_id} not registered")))?;

        if let Some(name) = parsed.name {
            project.name = name;
        }
        if let Some(priority) = parsed.priority {
            project.priority = priority;
        }
        if let Some(share_weight) = parsed.share_weight {
            project.share_weight = share_weight;
            self.scheduler.set_share_weight(&project_id, share_weight);
        }
        if let Some(quota) = parsed.quota {
            project.quota = quota.clone();
            self.resources.set_quota(project_id.clone(), quota);
        }

        Ok(serde_json::to_value(project.clone())?)
    }

    fn cmd_queue_status(&self) -> Result<Value, CoordinatorError> {
        Ok(serde_json::json!({
            "queueLen": self.scheduler.queue_len(),
            "processingLen": self.scheduler.processing_len(),
            "paused": self.scheduler.is_paused(),
        }))
    }

    fn cmd_queue_pause(&self) -> Result<Value, CoordinatorError> {
        self.scheduler.pause();
        Ok(serde_json::json!({"paused": true}))
    }

    fn cmd_queue_resume(&self) -> Result<Value, CoordinatorError> {
        self.scheduler.resume();
        let _ = self.events_tx.send(crate::events::CoordinatorEvent::QueueUpdated);
        Ok(serde_json::json!({"paused": false}))
    }

    fn cmd_queue_clear(&self, args: Value) -> Result<Value, CoordinatorError> {
        let project_id = match parse_args::<ProjectIdArg>(args) {
            Ok(arg) => Some(ProjectId::new(arg.project_id)),
            Err(_) => None,
        };
        let cleared = self.scheduler.clear(project_id.as_ref());
        let _ = self.events_tx.send(crate::events::CoordinatorEvent::QueueUpdated);
        Ok(serde_json::json!({"cleared": cleared}))
    }

    fn cmd_queue_stats(&self) -> Result<Value, CoordinatorError> {
        Ok(serde_json::to_value(self.scheduler.stats())?)
    }

    /// Thin scheduler-only pull (spec.md §5 ordering guarantee, §8 scenario
    /// S1): registers the caller as an active worker process but does not
    /// perform a C3 allocation or a C2 checkout itself — those remain
    /// library-level concerns for whatever embeds this coordinator, since a
    /// control-plane client here is a worker process, not the coordinator
    /// acting on a worker's behalf (Open Question, resolved this way; see
    /// DESIGN.md).
    async fn cmd_queue_get_next_task(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: GetNextTaskArgs = parse_args(args)?;
        let process_id = coordinator_common::ids::ProcessId::new(parsed.process_id);
        self.ownership
            .register_process(&process_id, parsed.os_pid, coordinator_common::types::ProcessRole::Worker)
            .await?;

        match self.scheduler.select_next() {
            Some(task) => {
                if !self.worker_kinds.is_known(&task.task_type) {
                    let _ = self.scheduler.fail(task.id, format!("unknown task_type: {}", task.task_type));
                    return Err(CoordinatorError::InvalidArgs(format!("unknown task_type: {}", task.task_type)));
                }
                let _ = self.events_tx.send(crate::events::CoordinatorEvent::TaskStarted {
                    task_id: task.id,
                    issue_id: task.issue_id.clone(),
                });
                Ok(serde_json::to_value(task)?)
            }
            None => Ok(Value::Null),
        }
    }

    async fn cmd_worker_status(&self) -> Result<Value, CoordinatorError> {
        let processes = self.ownership.list_active_processes().await?;
        Ok(serde_json::to_value(processes)?)
    }

    /// No OS-level worker pool to resize (spec.md §1 Non-goals). Acknowledged
    /// without effect so a client's scaling request against this coordinator
    /// fails loudly as "not implemented" rather than silently as "unknown
    /// command" (Open Question, resolved this way; see DESIGN.md).
    fn cmd_worker_scale(&self, _args: Value) -> Result<Value, CoordinatorError> {
        Err(CoordinatorError::InvalidArgs(
            "worker.scale: this coordinator does not manage OS-level worker processes".into(),
        ))
    }

    /// Maps onto releasing whatever the named process currently holds
    /// (locks, resource charges, active-process membership) — the closest
    /// analogue to "restart" a coordinator without its own process
    /// supervisor can offer.
    async fn cmd_worker_restart(&self, args: Value) -> Result<Value, CoordinatorError> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(rename = "processId")]
            process_id: String,
        }
        let parsed: Args = parse_args(args)?;
        let process_id = coordinator_common::ids::ProcessId::new(parsed.process_id);
        self.ownership.cleanup_process(&process_id).await?;
        self.resources.release(&process_id);
        Ok(serde_json::json!({"restarted": true}))
    }

    fn cmd_task_list(&self, args: Value) -> Result<Value, CoordinatorError> {
        let project_id = match parse_args::<ProjectIdArg>(args) {
            Ok(arg) => Some(ProjectId::new(arg.project_id)),
            Err(_) => None,
        };
        Ok(serde_json::to_value(self.scheduler.list_tasks(project_id.as_ref()))?)
    }

    fn cmd_task_status(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: TaskIdArg = parse_args(args)?;
        let task_id = task_id_of(&parsed.task_id)?;
        self.scheduler
            .task_status(task_id)
            .map(|task| serde_json::to_value(task).map_err(CoordinatorError::from))
            .unwrap_or_else(|| Err(CoordinatorError::NotFound(format!("task {task_id} not found"))))
    }

    fn cmd_task_cancel(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: TaskIdArg = parse_args(args)?;
        let task_id = task_id_of(&parsed.task_id)?;
        let task = self.scheduler.cancel(task_id)?;
        let _ = self.events_tx.send(crate::events::CoordinatorEvent::QueueUpdated);
        Ok(serde_json::to_value(task)?)
    }

    fn cmd_task_retry(&self, args: Value) -> Result<Value, CoordinatorError> {
        let parsed: TaskIdArg = parse_args(args)?;
        let task_id = task_id_of(&parsed.task_id)?;
        let task = self.scheduler.retry_terminal(task_id)?;
        let _ = self.events_tx.send(crate::events::CoordinatorEvent::QueueUpdated);
        Ok(serde_json::to_value(task)?)
    }

    async fn cmd_health_check(&self) -> Result<Value, CoordinatorError> {
        let store_ok = self.store.health_check().await.is_ok();
        if store_ok {
            self.circuit_breakers.store.record_success();
        } else {
            self.circuit_breakers.store.record_failure();
        }
        let components = self.circuit_breakers.health_snapshot();
        let healthy = store_ok && self.circuit_breakers.any_open().is_none();
        Ok(serde_json::json!({
            "healthy": healthy,
            "components": components.into_iter().map(|(name, ok)| serde_json::json!({"name": name, "healthy": ok})).collect::<Vec<_>>(),
        }))
    }

    /// Current-value snapshot only; there is no time-series store behind
    /// this, so any `period` the caller asks for is accepted and ignored
    /// (Open Question, resolved this way; see DESIGN.md). Time-series
    /// queries belong to the Prometheus endpoint this daemon also exposes.
    fn cmd_metrics_get(&self) -> Result<Value, CoordinatorError> {
        let snapshot = self.resources.snapshot();
        Ok(serde_json::json!({
            "queueLen": self.scheduler.queue_len(),
            "processingLen": self.scheduler.processing_len(),
            "systemAvailableCpu": snapshot.system_available_cpu,
            "systemAvailableMemory": snapshot.system_available_memory,
            "perProject": snapshot.per_project.into_iter().map(|(project_id, quota, usage)| {
                serde_json::json!({
                    "projectId": project_id,
                    "quota": quota,
                    "usage": usage,
                })
            }).collect::<Vec<_>>(),
        }))
    }

    fn started_at_rfc3339(&self) -> String {
        self.started_at.to_rfc3339()
    }
}
