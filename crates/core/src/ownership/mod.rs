mod adapter;
mod keys;

pub use adapter::{IssueTrackerAdapter, NoopIssueTracker};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coordinator_common::ids::{IssueId, ProcessId};
use coordinator_common::types::{
    IssueOwnership, LockValue, OrphanRecord, OwnershipStatus, ProcessRecord, ProcessRole, WaitPriority,
};
use coordinator_common::{CoordinatorError, Result};
use coordinator_store::{Batch, RetryPolicy, StoreClient};
use serde_json::Value;

use crate::events::{CoordinatorEvent, EventSender};
use crate::waiting::DeadlockDetector;

/// Timing configuration for the ownership coordinator (spec.md §4.2).
#[derive(Clone, Debug)]
pub struct OwnershipConfig {
    pub lock_ttl: Duration,
    pub heartbeat_ttl: Duration,
    pub checkout_timeout: Duration,
    pub orphan_scan_interval: Duration,
    pub reconcile_labels: bool,
}

impl From<&coordinator_common::config::OwnershipConfig> for OwnershipConfig {
    fn from(cfg: &coordinator_common::config::OwnershipConfig) -> Self {
        Self {
            lock_ttl: Duration::from_secs(cfg.lock_ttl_seconds),
            heartbeat_ttl: Duration::from_secs(cfg.heartbeat_ttl_seconds),
            checkout_timeout: Duration::from_secs(cfg.checkout_timeout_seconds),
            orphan_scan_interval: Duration::from_secs(cfg.orphan_scan_interval_seconds),
            reconcile_labels: cfg.reconcile_labels,
        }
    }
}

/// Checkout/checkin of issues with distributed locks, heartbeats, orphan
/// detection and repair (spec.md §4.2, C2).
pub struct OwnershipCoordinator {
    store: Arc<StoreClient>,
    config: OwnershipConfig,
    issue_tracker: Arc<dyn IssueTrackerAdapter>,
    events: EventSender,
    hostname: String,
    lock_retry: RetryPolicy,
    nonce_counter: AtomicU64,
    deadlock: Arc<DeadlockDetector>,
}

impl OwnershipCoordinator {
    pub fn new(
        store: Arc<StoreClient>,
        config: OwnershipConfig,
        issue_tracker: Arc<dyn IssueTrackerAdapter>,
        events: EventSender,
        deadlock: Arc<DeadlockDetector>,
    ) -> Self {
        let hostname = hostname_or_unknown();
        Self {
            store,
            config,
            issue_tracker,
            events,
            hostname,
            lock_retry: RetryPolicy::lock_default(),
            nonce_counter: AtomicU64::new(1),
            deadlock,
        }
    }

    fn next_nonce(&self) -> u64 {
        let counter = self.nonce_counter.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;
        nanos ^ counter
    }

    /// Acquire the per-issue lock, retrying with the configured backoff
    /// (spec.md §4.2 "Failure policy": 50ms base, doubling, cap 2s, max 3).
    async fn acquire_lock(&self, issue_id: &IssueId, process_id: &ProcessId) -> Result<LockValue> {
        let key = keys::issue_lock_key(issue_id);
        let lock_value = LockValue::new(process_id.clone(), self.next_nonce());
        let encoded = lock_value.encode();
        let ttl_secs = self.config.lock_ttl.as_secs();

        let acquired = self
            .lock_retry
            .run(
                |_| true,
                || {
                    let store = Arc::clone(&self.store);
                    let key = key.clone();
                    let encoded = encoded.clone();
                    async move {
                        match store.set_nx_ex(&key, &encoded, ttl_secs).await {
                            Ok(true) => Ok(true),
                            Ok(false) => Err(coordinator_store::StoreError::TransactionConflict(
                                "lock already held".into(),
                            )),
                            Err(e) => Err(e),
                        }
                    }
                },
            )
            .await;

        match acquired {
            Ok(true) => Ok(lock_value),
            Ok(false) | Err(_) => Err(CoordinatorError::LockTimeout(issue_id.to_string())),
        }
    }

    /// Release the lock only if it still holds the value we wrote
    /// (spec.md §4.2 step 5, "guards against expiry race").
    async fn release_lock(&self, issue_id: &IssueId, expected: &LockValue) {
        let key = keys::issue_lock_key(issue_id);
        match self.store.get(&key).await {
            Ok(Some(current)) if current == expected.encode() => {
                if let Err(e) = self.store.del(&key).await {
                    tracing::warn!(issue_id = %issue_id, error = %e, "failed to release issue lock");
                }
            }
            Ok(_) => {
                tracing::debug!(issue_id = %issue_id, "lock value changed before release, leaving it alone");
            }
            Err(e) => {
                tracing::warn!(issue_id = %issue_id, error = %e, "failed to read lock before release");
            }
        }
    }

    async fn read_ownership(&self, issue_id: &IssueId) -> Result<Option<IssueOwnership>> {
        let pairs = self.store.hgetall(&keys::issue_status_key(issue_id)).await?;
        if pairs.is_empty() {
            return Ok(None);
        }
        let map: HashMap<String, String> = pairs.into_iter().collect();
        Ok(Some(parse_ownership(issue_id, &map)?))
    }

    /// `checkout(issueId, processId, osPid, taskType)` (spec.md §4.2). Bounded
    /// by `checkout_timeout` end-to-end, independent of the lock-acquire retry
    /// budget.
    pub async fn checkout(
        &self,
        issue_id: IssueId,
        process_id: ProcessId,
        os_pid: u32,
        task_type: impl Into<String>,
        priority: WaitPriority,
    ) -> Result<IssueOwnership> {
        let task_type = task_type.into();
        match tokio::time::timeout(
            self.config.checkout_timeout,
            self.checkout_inner(issue_id.clone(), process_id, os_pid, task_type, priority),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::Timeout(issue_id.to_string())),
        }
    }

    /// Fails fast on contention, per spec.md §4.2 step 2's unconditional
    /// "If status = processing and owner ≠ processId: raise ConflictError"
    /// and §4.4's "if [checkout] fails, the task is returned to the head
    /// of its project's queue and an error is propagated to the worker" —
    /// the caller (daemon) is expected to requeue and hand the worker a
    /// different task immediately, not to have this call block.
    ///
    /// `priority` is recorded against the lock-acquisition wait (see
    /// `acquire_lock`'s own backoff) for deadlock bookkeeping; it plays no
    /// part in the ownership-conflict decision itself, which is immediate.
    async fn checkout_inner(
        &self,
        issue_id: IssueId,
        process_id: ProcessId,
        os_pid: u32,
        task_type: String,
        _priority: WaitPriority,
    ) -> Result<IssueOwnership> {
        let lock = self.acquire_lock(&issue_id, &process_id).await?;

        let existing = match self.read_ownership(&issue_id).await {
            Ok(v) => v,
            Err(e) => {
                self.release_lock(&issue_id, &lock).await;
                return Err(e);
            }
        };

        if let Some(existing) = &existing {
            if existing.status == OwnershipStatus::Processing {
                self.release_lock(&issue_id, &lock).await;
                if existing.owner == process_id {
                    return Ok(existing.clone());
                }
                return Err(CoordinatorError::Conflict(issue_id.to_string()));
            }
        }

        self.commit_new_ownership(issue_id, process_id, os_pid, task_type, lock).await
    }

    async fn commit_new_ownership(
        &self,
        issue_id: IssueId,
        process_id: ProcessId,
        os_pid: u32,
        task_type: String,
        lock: LockValue,
    ) -> Result<IssueOwnership> {
        let ownership = IssueOwnership::new_processing(issue_id.clone(), process_id.clone(), os_pid, task_type.clone());

        let batch = Batch::new()
            .hset(keys::issue_status_key(&issue_id), "status", ownership.status.as_db_str())
            .hset(keys::issue_status_key(&issue_id), "owner", process_id.to_string())
            .hset(keys::issue_status_key(&issue_id), "osPid", os_pid.to_string())
            .hset(keys::issue_status_key(&issue_id), "taskType", task_type.clone())
            .hset(keys::issue_status_key(&issue_id), "startedAt", ownership.started_at.to_rfc3339())
            .hset(keys::issue_status_key(&issue_id), "lastUpdatedAt", ownership.last_updated_at.to_rfc3339())
            .hset(keys::process_info_key(&process_id), "osPid", os_pid.to_string())
            .hset(keys::process_info_key(&process_id), "role", "worker")
            .hset(keys::process_info_key(&process_id), "hostname", self.hostname.clone())
            .hset(keys::process_info_key(&process_id), "lastSeen", Utc::now().to_rfc3339())
            .hset(keys::process_info_key(&process_id), "currentIssue", issue_id.to_string())
            .setex(keys::process_heartbeat_key(&process_id), "alive", self.config.heartbeat_ttl.as_secs())
            .sadd(keys::ISSUES_PROCESSING_SET, issue_id.to_string())
            .sadd(keys::PROCESSES_ACTIVE_SET, process_id.to_string());

        if let Err(e) = self.store.commit_batch(&batch).await {
            self.release_lock(&issue_id, &lock).await;
            return Err(e.into());
        }

        self.spawn_label_update(issue_id.clone(), "processing");
        self.release_lock(&issue_id, &lock).await;

        let _ = self.events.send(CoordinatorEvent::TaskStarted {
            task_id: coordinator_common::ids::TaskId::new(),
            issue_id: issue_id.clone(),
        });

        self.deadlock.record_held(issue_id, process_id, os_pid);

        Ok(ownership)
    }

    /// `checkin(issueId, processId, finalStatus, metadata)` (spec.md §4.2).
    pub async fn checkin(
        &self,
        issue_id: IssueId,
        process_id: ProcessId,
        final_status: OwnershipStatus,
        metadata: HashMap<String, Value>,
    ) -> Result<()> {
        if !matches!(final_status, OwnershipStatus::Completed | OwnershipStatus::Error) {
            return Err(CoordinatorError::InvalidTransition(format!(
                "checkin final status must be completed or error, got {final_status:?}"
            )));
        }

        let lock = self.acquire_lock(&issue_id, &process_id).await?;

        let existing = self.read_ownership(&issue_id).await;
        let existing = match existing {
            Ok(Some(e)) => e,
            Ok(None) => {
                self.release_lock(&issue_id, &lock).await;
                return Err(CoordinatorError::NotOwner(issue_id.to_string()));
            }
            Err(e) => {
                self.release_lock(&issue_id, &lock).await;
                return Err(e);
            }
        };

        if existing.owner != process_id {
            self.release_lock(&issue_id, &lock).await;
            return Err(CoordinatorError::NotOwner(issue_id.to_string()));
        }

        if !existing.status.can_transition_to(final_status) {
            self.release_lock(&issue_id, &lock).await;
            return Err(CoordinatorError::InvalidTransition(format!(
                "{:?} -> {:?} is not a legal ownership transition",
                existing.status, final_status
            )));
        }

        let mut batch = Batch::new()
            .hset(keys::issue_status_key(&issue_id), "status", final_status.as_db_str())
            .hset(keys::issue_status_key(&issue_id), "lastUpdatedAt", Utc::now().to_rfc3339())
            .srem(keys::ISSUES_PROCESSING_SET, issue_id.to_string())
            .srem(keys::PROCESSES_ACTIVE_SET, process_id.to_string());

        if final_status == OwnershipStatus::Completed {
            batch = batch.sadd(keys::ISSUES_PROCESSED_SET, issue_id.to_string());
        }

        for (key, value) in &metadata {
            batch = batch.hset(keys::issue_metadata_key(&issue_id), key.clone(), value.to_string());
        }

        if let Err(e) = self.store.commit_batch(&batch).await {
            self.release_lock(&issue_id, &lock).await;
            return Err(e.into());
        }

        let label = final_status.as_db_str();
        self.spawn_label_update(issue_id.clone(), label);
        self.release_lock(&issue_id, &lock).await;

        self.deadlock.clear_held(&issue_id);
        self.deadlock.advance(&issue_id);

        let event = if final_status == OwnershipStatus::Completed {
            CoordinatorEvent::TaskCompleted {
                task_id: coordinator_common::ids::TaskId::new(),
                issue_id: issue_id.clone(),
            }
        } else {
            CoordinatorEvent::TaskFailed {
                task_id: coordinator_common::ids::TaskId::new(),
                issue_id: issue_id.clone(),
                error: metadata
                    .get("reason")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unspecified".into()),
            }
        };
        let _ = self.events.send(event);

        Ok(())
    }

    /// `heartbeat(processId)` — idempotent TTL refresh, no lock taken
    /// (spec.md §4.2 "Heartbeat protocol").
    pub async fn heartbeat(&self, process_id: &ProcessId) -> Result<()> {
        self.store
            .setex(&keys::process_heartbeat_key(process_id), "alive", self.config.heartbeat_ttl.as_secs())
            .await?;
        self.store
            .hset(&keys::process_info_key(process_id), "lastSeen", &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    /// `list_processing()`.
    pub async fn list_processing(&self) -> Result<Vec<IssueOwnership>> {
        let ids = self.store.smembers(keys::ISSUES_PROCESSING_SET).await?;
        let mut result = Vec::with_capacity(ids.len());
        for raw in ids {
            let issue_id = IssueId::new(raw);
            if let Some(ownership) = self.read_ownership(&issue_id).await? {
                result.push(ownership);
            }
        }
        Ok(result)
    }

    /// Worker inventory for `worker.status` (SPEC_FULL.md §4.6 supplement).
    /// Reads the active-process set directly rather than joining through
    /// `list_processing`, since a registered process without a current
    /// issue (idle between checkouts) is still a worker the daemon should
    /// report.
    pub async fn list_active_processes(&self) -> Result<Vec<ProcessRecord>> {
        let ids = self.store.smembers(keys::PROCESSES_ACTIVE_SET).await?;
        let mut result = Vec::with_capacity(ids.len());
        for raw in ids {
            let process_id = ProcessId::new(raw);
            let map: HashMap<String, String> =
                self.store.hgetall(&keys::process_info_key(&process_id)).await?.into_iter().collect();
            if let Some(record) = process_record_from_map(&process_id, &map) {
                result.push(record);
            }
        }
        Ok(result)
    }

    /// Registers a process (worker or the daemon itself) into the active-
    /// process set without attaching it to any issue (SPEC_FULL.md §4.6
    /// supplement — the daemon uses this to heartbeat its own pid the same
    /// way `commit_new_ownership` registers a worker's).
    pub async fn register_process(&self, process_id: &ProcessId, os_pid: u32, role: ProcessRole) -> Result<()> {
        let role_str = match role {
            ProcessRole::Worker => "worker",
            ProcessRole::Coordinator => "coordinator",
        };
        let batch = Batch::new()
            .hset(keys::process_info_key(process_id), "osPid", os_pid.to_string())
            .hset(keys::process_info_key(process_id), "role", role_str)
            .hset(keys::process_info_key(process_id), "hostname", self.hostname.clone())
            .hset(keys::process_info_key(process_id), "lastSeen", Utc::now().to_rfc3339())
            .setex(keys::process_heartbeat_key(process_id), "alive", self.config.heartbeat_ttl.as_secs())
            .sadd(keys::PROCESSES_ACTIVE_SET, process_id.to_string());
        self.store.commit_batch(&batch).await?;
        Ok(())
    }

    /// `cleanup_process(processId)` — checkin-as-error whatever the process
    /// was holding, then remove its process/heartbeat records (SPEC_FULL.md
    /// §4.2 supplement).
    pub async fn cleanup_process(&self, process_id: &ProcessId) -> Result<()> {
        let current_issue = self
            .store
            .hget(&keys::process_info_key(process_id), "currentIssue")
            .await?;

        if let Some(raw) = current_issue {
            let issue_id = IssueId::new(raw);
            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), Value::String("process cleanup requested".into()));
            // Best-effort: the process may already have transitioned out of
            // processing (e.g. via a prior checkin), in which case this is a
            // harmless NotOwner/InvalidTransition that we swallow here.
            let _ = self.checkin(issue_id, process_id.clone(), OwnershipStatus::Error, metadata).await;
        }

        self.store.del(&keys::process_info_key(process_id)).await?;
        self.store.del(&keys::process_heartbeat_key(process_id)).await?;
        self.store.srem(keys::PROCESSES_ACTIVE_SET, &process_id.to_string()).await?;

        Ok(())
    }

    /// Background orphan sweep (spec.md §4.2 "Orphan detection"). Returns
    /// the set of issues repaired this sweep.
    pub async fn scan_orphans(&self) -> Result<Vec<OrphanRecord>> {
        let processing = self.store.smembers(keys::ISSUES_PROCESSING_SET).await?;
        let mut orphans = Vec::new();

        for raw_issue in processing {
            let issue_id = IssueId::new(raw_issue);
            let Some(ownership) = self.read_ownership(&issue_id).await? else {
                continue;
            };

            let process_info = self.store.hgetall(&keys::process_info_key(&ownership.owner)).await?;
            let process_map: HashMap<String, String> = process_info.into_iter().collect();
            let process_hostname = process_map.get("hostname").cloned().unwrap_or_default();

            let heartbeat_alive = self
                .store
                .exists(&keys::process_heartbeat_key(&ownership.owner))
                .await?;

            if heartbeat_alive {
                continue;
            }

            let foreign_host = process_hostname != self.hostname && !process_hostname.is_empty();
            let locally_dead = foreign_host || !process_is_alive(ownership.os_pid);

            if !locally_dead {
                continue;
            }

            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), Value::String("process died unexpectedly".into()));
            metadata.insert("originalPid".to_string(), Value::Number(ownership.os_pid.into()));
            metadata.insert("orphanedAt".to_string(), Value::String(Utc::now().to_rfc3339()));

            match self
                .checkin(issue_id.clone(), ownership.owner.clone(), OwnershipStatus::Error, metadata)
                .await
            {
                Ok(()) => {
                    let record = OrphanRecord {
                        issue_id: issue_id.clone(),
                        owner: ownership.owner.clone(),
                        original_pid: ownership.os_pid,
                        orphaned_at: Utc::now(),
                    };
                    let _ = self.events.send(CoordinatorEvent::OrphanRepaired {
                        issue_id: issue_id.clone(),
                        reason: "process died unexpectedly".to_string(),
                        original_pid: ownership.os_pid,
                    });
                    orphans.push(record);
                }
                Err(e) => {
                    tracing::warn!(issue_id = %issue_id, error = %e, "orphan repair failed, will retry next sweep");
                }
            }
        }

        Ok(orphans)
    }

    /// Best-effort, fire-and-forget label attach. Always attempted; a
    /// failure is logged and, when `reconcile_labels` is set, left for a
    /// later reconciliation pass rather than retried here.
    fn spawn_label_update(&self, issue_id: IssueId, label: &'static str) {
        let tracker = Arc::clone(&self.issue_tracker);
        let reconcile = self.config.reconcile_labels;
        tokio::spawn(async move {
            if let Err(e) = tracker.attach_label(&issue_id, label).await {
                tracing::warn!(issue_id = %issue_id, label, error = %e, reconcile_labels = reconcile, "issue-tracker label update failed");
            }
        });
    }
}

fn parse_ownership(issue_id: &IssueId, map: &HashMap<String, String>) -> Result<IssueOwnership> {
    let status = match map.get("status").map(String::as_str) {
        Some("idle") => OwnershipStatus::Idle,
        Some("processing") => OwnershipStatus::Processing,
        Some("awaiting-response") => OwnershipStatus::AwaitingResponse,
        Some("completed") => OwnershipStatus::Completed,
        Some("error") => OwnershipStatus::Error,
        other => {
            return Err(CoordinatorError::Internal(format!(
                "malformed ownership status for issue {issue_id}: {other:?}"
            )))
        }
    };

    let owner = ProcessId::new(map.get("owner").cloned().unwrap_or_default());
    let os_pid = map.get("osPid").and_then(|v| v.parse().ok()).unwrap_or(0);
    let task_type = map.get("taskType").cloned().unwrap_or_default();
    let started_at = map
        .get("startedAt")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let last_updated_at = map
        .get("lastUpdatedAt")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(IssueOwnership {
        issue_id: issue_id.clone(),
        status,
        owner,
        os_pid,
        task_type,
        started_at,
        last_updated_at,
        metadata: HashMap::new(),
    })
}

/// Whether `pid` is alive on *this* host. Checked only when the process
/// record's hostname matches ours (spec.md §4.2 "checked only when host
/// matches recorded hostname; on foreign hosts, heartbeat absence alone is
/// sufficient").
#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    // No cheap cross-platform liveness probe without an extra dependency;
    // heartbeat absence is the primary signal and this is the fallback.
    false
}

fn hostname_or_unknown() -> String {
    #[cfg(unix)]
    {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                std::process::Command::new("hostname")
                    .output()
                    .ok()
                    .and_then(|o| String::from_utf8(o.stdout).ok())
                    .map(|s| s.trim().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
    }
}

// Also implement ProcessRecord/ProcessRole round-trip helpers used by
// daemon.status to report worker inventory.
pub fn process_record_from_map(process_id: &ProcessId, map: &HashMap<String, String>) -> Option<ProcessRecord> {
    let os_pid = map.get("osPid")?.parse().ok()?;
    let role = match map.get("role").map(String::as_str) {
        Some("coordinator") => ProcessRole::Coordinator,
        _ => ProcessRole::Worker,
    };
    let hostname = map.get("hostname").cloned().unwrap_or_default();
    let last_seen = map
        .get("lastSeen")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let current_issue = map.get("currentIssue").map(|v| IssueId::new(v.clone()));

    Some(ProcessRecord {
        process_id: process_id.clone(),
        os_pid,
        role,
        hostname,
        last_seen,
        current_issue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ownership_rejects_malformed_status() {
        let issue_id = IssueId::new("42");
        let mut map = HashMap::new();
        map.insert("status".to_string(), "bogus".to_string());
        assert!(parse_ownership(&issue_id, &map).is_err());
    }

    #[test]
    fn parse_ownership_round_trips_known_fields() {
        let issue_id = IssueId::new("42");
        let mut map = HashMap::new();
        map.insert("status".to_string(), "processing".to_string());
        map.insert("owner".to_string(), "worker-1".to_string());
        map.insert("osPid".to_string(), "1234".to_string());
        map.insert("taskType".to_string(), "lint".to_string());
        let ownership = parse_ownership(&issue_id, &map).unwrap();
        assert_eq!(ownership.status, OwnershipStatus::Processing);
        assert_eq!(ownership.owner.as_str(), "worker-1");
        assert_eq!(ownership.os_pid, 1234);
    }
}
