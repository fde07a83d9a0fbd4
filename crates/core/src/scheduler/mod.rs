mod persistence;
mod policy;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use coordinator_common::ids::{IssueId, ProjectId, TaskId};
use coordinator_common::types::{Task, TaskStatus};
use coordinator_common::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub use persistence::{QueueFile, SnapshotManager};
pub use policy::SelectionPolicy;
use policy::PolicyState;

/// Per-project counters surfaced by `queue.status`/`queue.stats`
/// (spec.md §6).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Inner {
    queue: VecDeque<Task>,
    processing: HashMap<TaskId, Task>,
    stats: HashMap<ProjectId, ProjectStats>,
    share_weights: HashMap<ProjectId, f64>,
    policy_state: PolicyState,
    paused: bool,
    /// Bounded history of tasks that left `processing` in a terminal state,
    /// oldest first, so `task.status`/`task.retry` can still find a task
    /// after it finishes (spec.md §6). Queue and processing alone cannot
    /// answer those once a task completes — only terminal tasks go here.
    recent_terminal: VecDeque<Task>,
    terminal_capacity: usize,
}

impl Inner {
    fn stats_mut(&mut self, project: &ProjectId) -> &mut ProjectStats {
        self.stats.entry(project.clone()).or_default()
    }

    fn push_terminal(&mut self, task: Task) {
        if self.terminal_capacity == 0 {
            return;
        }
        if self.recent_terminal.len() >= self.terminal_capacity {
            self.recent_terminal.pop_front();
        }
        self.recent_terminal.push_back(task);
    }
}

/// The in-process task queue and selection engine (C4). Bookkeeping is
/// guarded by a single synchronous mutex: selection must never block on
/// I/O (spec.md §4.4), so persistence happens outside the critical
/// section against a copied-out snapshot.
pub struct Scheduler {
    inner: Mutex<Inner>,
    policy: SelectionPolicy,
    max_retries: u32,
    deadline_window: ChronoDuration,
    /// Signalled on every state change; the daemon's scheduling-pass loop
    /// debounces on this instead of polling (spec.md §4.4 "Debounced pass").
    pub notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(policy: SelectionPolicy, max_retries: u32, deadline_window_hours: i64) -> Self {
        Self::with_terminal_capacity(policy, max_retries, deadline_window_hours, 500)
    }

    pub fn with_terminal_capacity(
        policy: SelectionPolicy,
        max_retries: u32,
        deadline_window_hours: i64,
        terminal_capacity: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                processing: HashMap::new(),
                stats: HashMap::new(),
                share_weights: HashMap::new(),
                policy_state: PolicyState::default(),
                paused: false,
                recent_terminal: VecDeque::new(),
                terminal_capacity,
            }),
            policy,
            max_retries,
            deadline_window: ChronoDuration::hours(deadline_window_hours),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(config: &coordinator_common::config::SchedulerConfig) -> Self {
        let policy = SelectionPolicy::parse(&config.policy).unwrap_or(SelectionPolicy::Fifo);
        Self::with_terminal_capacity(
            policy,
            config.max_retries,
            config.deadline_window_hours as i64,
            config.terminal_history_capacity,
        )
    }

    /// Find a task currently `Processing` for a given issue (used by the
    /// daemon's orphan sweep to map a repaired issue back to its task so
    /// the resource allocation held for it can be released and the task
    /// failed — spec.md §4.2/§4.3 "Orphan detection").
    pub fn find_processing_by_issue(&self, issue_id: &IssueId) -> Option<Task> {
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner.processing.values().find(|t| &t.issue_id == issue_id).cloned()
    }

    /// Terminal tasks retained in history, most recent last, optionally
    /// scoped to one project (spec.md §6 "task.list").
    pub fn list_terminal(&self, project_id: Option<&ProjectId>) -> Vec<Task> {
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner
            .recent_terminal
            .iter()
            .filter(|t| project_id.map(|p| &t.project_id == p).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Re-enqueue a terminally-failed or cancelled task from history
    /// (spec.md §6 "task.retry"). Requeues a fresh copy with retry
    /// bookkeeping reset and removes the original from history so a
    /// second retry request doesn't find a stale entry.
    pub fn retry_terminal(&self, task_id: TaskId) -> Result<Task> {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        let idx = inner
            .recent_terminal
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {task_id} not in terminal history")))?;
        let source = inner.recent_terminal.remove(idx).expect("index just located");

        if !matches!(source.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            inner.recent_terminal.insert(idx, source.clone());
            return Err(CoordinatorError::InvalidTransition(format!(
                "task {task_id} cannot be retried from {:?}",
                source.status
            )));
        }

        let mut task = Task::new(source.project_id.clone(), source.issue_id.clone(), source.task_type.clone(), source.priority);
        if let Some(deadline) = source.deadline {
            task = task.with_deadline(deadline);
        }
        inner.stats_mut(&task.project_id).queued += 1;
        inner.queue.push_back(task.clone());
        drop(inner);
        self.notify.notify_one();
        Ok(task)
    }

    /// Registers (or updates) a project's weighted-fair share weight.
    /// Called whenever `project.add`/`project.update` changes it.
    pub fn set_share_weight(&self, project_id: &ProjectId, weight: f64) {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner.share_weights.insert(project_id.clone(), weight);
    }

    pub fn enqueue(&self, task: Task) {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner.stats_mut(&task.project_id).queued += 1;
        inner.queue.push_back(task);
        drop(inner);
        self.notify.notify_one();
    }

    /// Select and mark the next ready task as `Processing`, or `None` if
    /// the queue is empty, paused, or nothing is eligible.
    pub fn select_next(&self) -> Option<Task> {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        if inner.paused || inner.queue.is_empty() {
            return None;
        }

        let now = Utc::now();
        let idx = policy::select(
            self.policy,
            &inner.queue,
            &inner.share_weights,
            &mut inner.policy_state,
            now,
            self.deadline_window,
        )?;

        let mut task = inner.queue.remove(idx)?;
        task.mark_processing();
        inner.stats_mut(&task.project_id).queued -= 1;
        inner.stats_mut(&task.project_id).processing += 1;
        inner.processing.insert(task.id, task.clone());
        Some(task)
    }

    /// Return a task to the queue without consuming a retry attempt
    /// (used when downstream resource allocation or ownership checkout
    /// rejects a selected task — spec.md §4.4 "returned to the head of
    /// its project's queue").
    pub fn return_to_queue(&self, task_id: TaskId) -> Result<()> {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        let mut task = inner
            .processing
            .remove(&task_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {task_id} not in processing")))?;
        task.status = TaskStatus::Queued;
        task.started = None;
        inner.stats_mut(&task.project_id).processing -= 1;
        inner.stats_mut(&task.project_id).queued += 1;

        inner.queue.push_front(task);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    pub fn complete(&self, task_id: TaskId) -> Result<Task> {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        let mut task = inner
            .processing
            .remove(&task_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {task_id} not in processing")))?;
        task.mark_completed();
        inner.stats_mut(&task.project_id).processing -= 1;
        inner.stats_mut(&task.project_id).completed += 1;
        inner.push_terminal(task.clone());
        Ok(task)
    }

    /// Mark a processing task failed. If retries remain, it's re-appended
    /// to the queue (arrival preserved, retry_count incremented);
    /// otherwise it's terminally failed (spec.md §4.4 "Completion").
    pub fn fail(&self, task_id: TaskId, error: impl Into<String>) -> Result<Task> {
        let error = error.into();
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        let mut task = inner
            .processing
            .remove(&task_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {task_id} not in processing")))?;
        inner.stats_mut(&task.project_id).processing -= 1;

        if task.retry_count < self.max_retries {
            task.requeue_for_retry(error);
            inner.stats_mut(&task.project_id).queued += 1;
            inner.queue.push_back(task.clone());
            drop(inner);
            self.notify.notify_one();
            debug!(task_id = %task.id, retry_count = task.retry_count, "task requeued for retry");
        } else {
            task.mark_failed(error);
            inner.stats_mut(&task.project_id).failed += 1;
            inner.push_terminal(task.clone());
        }
        Ok(task)
    }

    pub fn cancel(&self, task_id: TaskId) -> Result<Task> {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        if let Some(idx) = inner.queue.iter().position(|t| t.id == task_id) {
            let mut task = inner.queue.remove(idx).expect("index just located");
            task.mark_cancelled();
            inner.stats_mut(&task.project_id).queued -= 1;
            inner.push_terminal(task.clone());
            return Ok(task);
        }
        if let Some(mut task) = inner.processing.remove(&task_id) {
            task.mark_cancelled();
            inner.stats_mut(&task.project_id).processing -= 1;
            inner.push_terminal(task.clone());
            return Ok(task);
        }
        Err(CoordinatorError::NotFound(format!("task {task_id} not found")))
    }

    pub fn pause(&self) {
        self.inner.lock().expect("scheduler mutex poisoned").paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().expect("scheduler mutex poisoned").paused = false;
        self.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("scheduler mutex poisoned").paused
    }

    /// Drop queued tasks, optionally scoped to a status or project filter.
    /// Returns the number of tasks removed. Tasks already `Processing`
    /// are left alone (spec.md §6 "queue.clear").
    pub fn clear(&self, project_id: Option<&ProjectId>) -> usize {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        let before = inner.queue.len();
        let keep: VecDeque<Task> = inner
            .queue
            .drain(..)
            .filter(|t| !project_id.map(|p| &t.project_id == p).unwrap_or(true))
            .collect();
        let removed = before - keep.len();

        if let Some(p) = project_id {
            if let Some(s) = inner.stats.get_mut(p) {
                s.queued = s.queued.saturating_sub(removed as u64);
            }
        } else {
            for stats in inner.stats.values_mut() {
                stats.queued = 0;
            }
        }

        inner.queue = keep;
        removed
    }

    pub fn stats(&self) -> HashMap<ProjectId, ProjectStats> {
        self.inner.lock().expect("scheduler mutex poisoned").stats.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("scheduler mutex poisoned").queue.len()
    }

    pub fn processing_len(&self) -> usize {
        self.inner.lock().expect("scheduler mutex poisoned").processing.len()
    }

    pub fn list_tasks(&self, project_id: Option<&ProjectId>) -> Vec<Task> {
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner
            .queue
            .iter()
            .chain(inner.processing.values())
            .filter(|t| project_id.map(|p| &t.project_id == p).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn task_status(&self, task_id: TaskId) -> Option<Task> {
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner
            .processing
            .get(&task_id)
            .cloned()
            .or_else(|| inner.queue.iter().find(|t| t.id == task_id).cloned())
            .or_else(|| inner.recent_terminal.iter().find(|t| t.id == task_id).cloned())
    }

    /// Copy out everything persistence needs without holding the lock
    /// across the (async) write.
    pub fn snapshot_for_persistence(&self) -> QueueFile {
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        QueueFile {
            queue: inner.queue.iter().cloned().collect(),
            processing: inner
                .processing
                .iter()
                .map(|(id, t)| (id.to_string(), t.clone()))
                .collect(),
            project_stats: inner
                .stats
                .iter()
                .map(|(id, s)| (id.to_string(), *s))
                .collect(),
            saved_at: Utc::now(),
        }
    }

    /// Restore state from a previously persisted `QueueFile`. Anything
    /// that was `Processing` at save time is returned to the front of the
    /// queue as `Queued` — no task is ever lost across a restart
    /// (spec.md §4.4 invariant "no-task-lost").
    pub fn restore(&self, file: QueueFile) {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner.queue.clear();
        inner.processing.clear();
        inner.stats.clear();

        for (project, stats) in file.project_stats {
            inner.stats.insert(ProjectId::new(project), stats);
        }

        for mut task in file.processing.into_values() {
            task.status = TaskStatus::Queued;
            task.started = None;
            inner.queue.push_front(task);
        }
        for task in file.queue {
            inner.queue.push_back(task);
        }

        // Nothing survives a restart as `Processing`; everything still
        // unfinished is back in the queue, so recompute both counters from
        // the restored queue contents rather than trusting the saved ones.
        for stats in inner.stats.values_mut() {
            stats.processing = 0;
            stats.queued = 0;
        }
        let projects: HashSet<ProjectId> = inner.queue.iter().map(|t| t.project_id.clone()).collect();
        for project in projects {
            let count = inner.queue.iter().filter(|t| t.project_id == project).count() as u64;
            inner.stats_mut(&project).queued = count;
        }

        info!(restored = inner.queue.len(), "scheduler state restored from disk");
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }
}

/// Background persistence loop: saves on a fixed timer and whenever the
/// scheduler signals activity via `notify`, debounced by 100ms so a burst
/// of enqueues triggers one write, not N (spec.md §4.4).
pub async fn run_persistence_loop(
    scheduler: Arc<Scheduler>,
    manager: SnapshotManager,
    interval: std::time::Duration,
    debounce: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = scheduler.notify.notified() => {
                tokio::time::sleep(debounce).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let file = scheduler.snapshot_for_persistence();
        if let Err(e) = manager.save(&file).await {
            warn!(error = %e, "failed to persist scheduler state");
        }
    }

    // Final save on shutdown so in-flight state survives the drain window.
    let file = scheduler.snapshot_for_persistence();
    if let Err(e) = manager.save(&file).await {
        warn!(error = %e, "failed to persist scheduler state during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::ids::IssueId;

    fn scheduler() -> Scheduler {
        Scheduler::new(SelectionPolicy::Fifo, 3, 24)
    }

    fn task(project: &str, issue: &str) -> Task {
        Task::new(ProjectId::new(project), IssueId::new(issue), "lint", 10)
    }

    #[test]
    fn enqueue_then_select_marks_processing() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        let selected = s.select_next().unwrap();
        assert_eq!(selected.status, TaskStatus::Processing);
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.processing_len(), 1);
    }

    #[test]
    fn pause_blocks_selection_until_resumed() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        s.pause();
        assert!(s.select_next().is_none());
        s.resume();
        assert!(s.select_next().is_some());
    }

    #[test]
    fn fail_under_max_retries_requeues_preserving_arrival() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        let selected = s.select_next().unwrap();
        let arrival = selected.arrival;
        let failed = s.fail(selected.id, "boom").unwrap();
        assert_eq!(failed.status, TaskStatus::Queued);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.arrival, arrival);
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn fail_past_max_retries_terminally_fails() {
        let s = Scheduler::new(SelectionPolicy::Fifo, 0, 24);
        s.enqueue(task("p1", "1"));
        let selected = s.select_next().unwrap();
        let failed = s.fail(selected.id, "boom").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.stats()[&ProjectId::new("p1")].failed, 1);
    }

    #[test]
    fn complete_updates_stats() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        let selected = s.select_next().unwrap();
        let completed = s.complete(selected.id).unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(s.stats()[&ProjectId::new("p1")].completed, 1);
    }

    #[test]
    fn cancel_removes_queued_task() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        let t = s.list_tasks(None)[0].clone();
        let cancelled = s.cancel(t.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn clear_drops_only_matching_project_queue_entries() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        s.enqueue(task("p2", "2"));
        let removed = s.clear(Some(&ProjectId::new("p1")));
        assert_eq!(removed, 1);
        assert_eq!(s.queue_len(), 1);
        assert_eq!(s.list_tasks(None)[0].project_id, ProjectId::new("p2"));
    }

    #[test]
    fn no_task_is_lost_across_queue_processing_terminal_states() {
        // max_retries = 0 so every failure is terminal on the first attempt,
        // keeping this a clean partition check.
        let s = Scheduler::new(SelectionPolicy::Fifo, 0, 24);
        for i in 0..10 {
            s.enqueue(task("p1", &i.to_string()));
        }
        while let Some(t) = s.select_next() {
            if t.issue_id.as_str().parse::<u32>().unwrap() % 2 == 0 {
                s.complete(t.id).unwrap();
            } else {
                s.fail(t.id, "x").unwrap();
            }
        }
        let stats = s.stats()[&ProjectId::new("p1")];
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.processing_len(), 0);
        assert_eq!(stats.completed + stats.failed, 10);
    }

    #[test]
    fn find_processing_by_issue_locates_in_flight_task() {
        let s = scheduler();
        s.enqueue(task("p1", "7"));
        let selected = s.select_next().unwrap();
        let found = s.find_processing_by_issue(&IssueId::new("7")).unwrap();
        assert_eq!(found.id, selected.id);
        assert!(s.find_processing_by_issue(&IssueId::new("does-not-exist")).is_none());
    }

    #[test]
    fn completed_task_is_retrievable_from_terminal_history() {
        let s = scheduler();
        s.enqueue(task("p1", "1"));
        let selected = s.select_next().unwrap();
        s.complete(selected.id).unwrap();
        let found = s.task_status(selected.id).unwrap();
        assert_eq!(found.status, TaskStatus::Completed);
        assert_eq!(s.list_terminal(Some(&ProjectId::new("p1"))).len(), 1);
    }

    #[test]
    fn retry_terminal_requeues_a_failed_task_and_clears_history() {
        let s = Scheduler::new(SelectionPolicy::Fifo, 0, 24);
        s.enqueue(task("p1", "1"));
        let selected = s.select_next().unwrap();
        let failed = s.fail(selected.id, "boom").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);

        let retried = s.retry_terminal(failed.id).unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.retry_count, 0);
        assert_eq!(s.queue_len(), 1);
        assert!(s.list_terminal(None).is_empty());
    }

    #[test]
    fn retry_terminal_rejects_unknown_task() {
        let s = scheduler();
        let err = s.retry_terminal(TaskId::new()).unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[test]
    fn terminal_history_is_bounded() {
        let s = Scheduler::with_terminal_capacity(SelectionPolicy::Fifo, 0, 24, 2);
        for i in 0..5 {
            s.enqueue(task("p1", &i.to_string()));
            let t = s.select_next().unwrap();
            s.fail(t.id, "x").unwrap();
        }
        assert_eq!(s.list_terminal(None).len(), 2);
    }

    #[test]
    fn restore_returns_in_flight_tasks_to_queue() {
        let s = scheduler();
        let mut t = task("p1", "1");
        t.mark_processing();
        let mut processing = HashMap::new();
        processing.insert(t.id.to_string(), t);

        s.restore(QueueFile {
            queue: Vec::new(),
            processing,
            project_stats: HashMap::new(),
            saved_at: Utc::now(),
        });

        assert_eq!(s.queue_len(), 1);
        assert_eq!(s.processing_len(), 0);
        assert_eq!(s.list_tasks(None)[0].status, TaskStatus::Queued);
    }
}
