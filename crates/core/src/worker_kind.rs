use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use coordinator_common::error::CoordinatorError;
use coordinator_common::types::Task;
use coordinator_common::Result;
use serde_json::Value;

/// Statically-typed execution interface for a single worker kind (spec.md
/// §9 redesign note: replace dynamically-discovered plugin modules with a
/// tagged-variant registry resolved at startup). Core never calls `run`
/// itself against real user work — per the Non-goals, task bodies are
/// external worker processes reached over the control-plane protocol — but
/// the trait and registry double as the closed set of `task_type` strings
/// the daemon will accept into a queue.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// The `task_type` string this runner answers for.
    fn task_type(&self) -> &'static str;

    async fn run(&self, task: &Task) -> Result<Value>;
}

/// A runner that succeeds immediately without doing anything, useful for
/// exercising the dispatch path without a worker fleet attached.
pub struct NoopWorker;

#[async_trait]
impl WorkerRunner for NoopWorker {
    fn task_type(&self) -> &'static str {
        "noop"
    }

    async fn run(&self, _task: &Task) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// A runner that echoes the task's own fields back as its result, used by
/// protocol conformance tests to assert a full allocate/checkout/complete
/// round trip without standing up an external worker.
pub struct EchoWorker;

#[async_trait]
impl WorkerRunner for EchoWorker {
    fn task_type(&self) -> &'static str {
        "echo"
    }

    async fn run(&self, task: &Task) -> Result<Value> {
        Ok(serde_json::json!({
            "task_id": task.id,
            "issue_id": task.issue_id,
            "project_id": task.project_id,
        }))
    }
}

/// Closed registry of supported worker kinds, populated once at startup.
/// `queue.get-next-task` consults [`WorkerKindRegistry::is_known`] before
/// spending a C3 allocation and a C2 checkout on a task whose type nothing
/// can ever run; unrecognised types fail fast with `InvalidArgs` rather
/// than falling back to some default runner.
#[derive(Default)]
pub struct WorkerKindRegistry {
    runners: HashMap<String, Arc<dyn WorkerRunner>>,
}

impl WorkerKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in kinds available even in a deployment that registers no
    /// real worker implementations of its own.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoopWorker));
        registry.register(Arc::new(EchoWorker));
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn WorkerRunner>) {
        self.runners.insert(runner.task_type().to_string(), runner);
    }

    pub fn is_known(&self, task_type: &str) -> bool {
        self.runners.contains_key(task_type)
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn WorkerRunner>> {
        self.runners.get(task_type).cloned()
    }

    /// Run the task's kind in-process. Only ever reached for the built-in
    /// diagnostic kinds; real `task_type`s are dispatched to an external
    /// worker by the caller over the control-plane protocol instead.
    pub async fn dispatch(&self, task: &Task) -> Result<Value> {
        match self.get(&task.task_type) {
            Some(runner) => runner.run(task).await,
            None => Err(CoordinatorError::InvalidArgs(format!(
                "unknown task_type: {}",
                task.task_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::ids::{IssueId, ProjectId};

    fn task(task_type: &str) -> Task {
        Task::new(ProjectId::new("p1"), IssueId::new("42"), task_type, 10)
    }

    #[tokio::test]
    async fn known_kind_dispatches() {
        let registry = WorkerKindRegistry::with_defaults();
        let result = registry.dispatch(&task("noop")).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn unknown_kind_is_invalid_args() {
        let registry = WorkerKindRegistry::with_defaults();
        let err = registry.dispatch(&task("does-not-exist")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidArgs(_)));
    }

    #[test]
    fn is_known_reflects_registration() {
        let registry = WorkerKindRegistry::with_defaults();
        assert!(registry.is_known("echo"));
        assert!(!registry.is_known("bogus"));
    }
}
