use std::collections::HashMap;
use std::sync::Mutex;

use coordinator_common::ids::{ProcessId, ProjectId};
use coordinator_common::types::{AllocationHistory, AllocationHistoryEntry, Quota, ResourceType, Snapshot, Usage};
use coordinator_common::{CoordinatorError, Result};

/// Per-project live state: the quota currently in effect (possibly
/// temporarily inflated by an elastic borrow) plus the `Quota` as last
/// configured by `set_quota`, which `reallocate()` treats as the floor to
/// smooth toward.
struct ProjectState {
    configured: Quota,
    effective: Quota,
    usage: Usage,
}

struct Inner {
    projects: HashMap<ProjectId, ProjectState>,
    /// `(project_id, cpu, memory)` charged against each active process id,
    /// so `release` can credit back exactly what was allocated.
    allocations: HashMap<ProcessId, (ProjectId, f64, u64)>,
    history: AllocationHistory,
}

/// The fixed-size system resource pool configured at startup (spec.md §4.3).
#[derive(Clone, Copy, Debug)]
pub struct SystemTotals {
    pub cpu: f64,
    pub memory: u64,
    /// Fraction withheld from distribution (spec.md §4.3 "System reserve").
    pub reserve_fraction: f64,
}

impl SystemTotals {
    fn distributable_cpu(&self) -> f64 {
        self.cpu * (1.0 - self.reserve_fraction)
    }

    fn distributable_memory(&self) -> u64 {
        (self.memory as f64 * (1.0 - self.reserve_fraction)) as u64
    }
}

/// Result of a successful `allocate()` call: the grant actually committed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AllocationOutcome {
    pub cpu: f64,
    pub memory: u64,
    pub elastic: bool,
}

/// Per-project CPU/memory/concurrency quotas with elastic borrowing and
/// dynamic re-allocation (spec.md §4.3, C3).
pub struct ResourceManager {
    system: SystemTotals,
    smoothing_factor: f64,
    reallocation_stddev_threshold: f64,
    inner: Mutex<Inner>,
}

impl ResourceManager {
    pub fn new(system: SystemTotals, smoothing_factor: f64, reallocation_stddev_threshold: f64, history_capacity: usize) -> Self {
        Self {
            system,
            smoothing_factor,
            reallocation_stddev_threshold,
            inner: Mutex::new(Inner {
                projects: HashMap::new(),
                allocations: HashMap::new(),
                history: AllocationHistory::new(history_capacity),
            }),
        }
    }

    /// Register or replace a project's quota.
    pub fn set_quota(&self, project_id: ProjectId, quota: Quota) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.projects.entry(project_id).or_insert_with(|| ProjectState {
            configured: quota.clone(),
            effective: quota.clone(),
            usage: Usage::default(),
        });
        entry.configured = quota.clone();
        entry.effective = quota;
    }

    /// Attempt to allocate `(cpu_req, mem_req)` for `project_id` on behalf of
    /// `process_id`, following the five-step algorithm of spec.md §4.3.
    pub fn allocate(
        &self,
        project_id: &ProjectId,
        process_id: ProcessId,
        cpu_req: f64,
        mem_req: u64,
    ) -> Result<AllocationOutcome> {
        let mut inner = self.inner.lock().unwrap();

        // Step 1: concurrency limit. Borrow immutably first; the project
        // must already be registered via set_quota.
        let max_concurrent = {
            let state = inner
                .projects
                .get(project_id)
                .ok_or_else(|| CoordinatorError::NotFound(format!("no quota registered for project {project_id}")))?;
            if state.usage.concurrent >= state.effective.max_concurrent {
                return Err(CoordinatorError::ConcurrentLimit(project_id.to_string()));
            }
            state.effective.max_concurrent
        };
        let _ = max_concurrent;

        let mut elastic_used = false;

        // Step 2: CPU.
        {
            let (quota_cpu, usage_cpu, elastic, configured_cpu) = {
                let state = inner.projects.get(project_id).unwrap();
                (state.effective.cpu, state.usage.cpu, state.effective.elastic, state.configured.cpu)
            };
            if usage_cpu + cpu_req > quota_cpu {
                if !elastic {
                    return Err(CoordinatorError::CpuExceeded(project_id.to_string()));
                }
                let shortfall = usage_cpu + cpu_req - quota_cpu;
                if !self.try_elastic_borrow(&mut inner, project_id, ResourceType::Cpu, shortfall, configured_cpu) {
                    return Err(CoordinatorError::CpuExceeded(project_id.to_string()));
                }
                elastic_used = true;
            }
        }

        // Step 3: memory.
        {
            let (quota_mem, usage_mem, elastic, configured_mem) = {
                let state = inner.projects.get(project_id).unwrap();
                (state.effective.memory, state.usage.memory, state.effective.elastic, state.configured.memory)
            };
            if usage_mem + mem_req > quota_mem {
                if !elastic {
                    return Err(CoordinatorError::MemoryExceeded(project_id.to_string()));
                }
                let shortfall = (usage_mem + mem_req - quota_mem) as f64;
                if !self.try_elastic_borrow(&mut inner, project_id, ResourceType::Memory, shortfall, configured_mem as f64) {
                    return Err(CoordinatorError::MemoryExceeded(project_id.to_string()));
                }
                elastic_used = true;
            }
        }

        // Step 4: system-wide availability.
        let (system_used_cpu, system_used_mem) = inner
            .projects
            .values()
            .fold((0.0, 0u64), |(cpu, mem), state| (cpu + state.usage.cpu, mem + state.usage.memory));

        let available_cpu = self.system.distributable_cpu() - system_used_cpu;
        let available_mem = self.system.distributable_memory().saturating_sub(system_used_mem);

        if available_cpu < cpu_req {
            return Err(CoordinatorError::SystemResources(format!(
                "requested {cpu_req} cpu, {available_cpu} available"
            )));
        }
        if available_mem < mem_req {
            return Err(CoordinatorError::SystemResources(format!(
                "requested {mem_req} bytes, {available_mem} available"
            )));
        }

        // Step 5: commit.
        let state = inner.projects.get_mut(project_id).unwrap();
        state.usage.cpu += cpu_req;
        state.usage.memory += mem_req;
        state.usage.concurrent += 1;
        state.usage.active_processes.insert(process_id.clone());

        inner
            .allocations
            .insert(process_id, (project_id.clone(), cpu_req, mem_req));

        Ok(AllocationOutcome {
            cpu: cpu_req,
            memory: mem_req,
            elastic: elastic_used,
        })
    }

    /// Scan all *other* projects for slack (quota - usage); if their sum
    /// covers `shortfall`, temporarily inflate `project_id`'s effective
    /// quota by `shortfall` and log the borrow (spec.md §4.3 "Elastic borrow").
    fn try_elastic_borrow(
        &self,
        inner: &mut Inner,
        project_id: &ProjectId,
        resource: ResourceType,
        shortfall: f64,
        _configured: f64,
    ) -> bool {
        let total_slack: f64 = inner
            .projects
            .iter()
            .filter(|(id, _)| *id != project_id)
            .map(|(_, state)| match resource {
                ResourceType::Cpu => (state.effective.cpu - state.usage.cpu).max(0.0),
                ResourceType::Memory => (state.effective.memory as f64 - state.usage.memory as f64).max(0.0),
            })
            .sum();

        if total_slack < shortfall {
            return false;
        }

        let state = inner.projects.get_mut(project_id).unwrap();
        match resource {
            ResourceType::Cpu => state.effective.cpu += shortfall,
            ResourceType::Memory => state.effective.memory += shortfall as u64,
        }

        inner.history.push(AllocationHistoryEntry {
            timestamp: chrono::Utc::now(),
            project_id: project_id.clone(),
            resource_type: resource,
            amount: shortfall,
            reason: "elastic".to_string(),
        });

        metrics::counter!("coordinator.resources.elastic_borrows", "project" => project_id.to_string()).increment(1);

        true
    }

    /// Release everything charged to `process_id` (idempotent: a second
    /// call for an already-released process is a no-op).
    pub fn release(&self, process_id: &ProcessId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((project_id, cpu, mem)) = inner.allocations.remove(process_id) {
            if let Some(state) = inner.projects.get_mut(&project_id) {
                state.usage.cpu = (state.usage.cpu - cpu).max(0.0);
                state.usage.memory = state.usage.memory.saturating_sub(mem);
                state.usage.concurrent = state.usage.concurrent.saturating_sub(1);
                state.usage.active_processes.remove(process_id);
            }
        }
    }

    /// Per-project and system-wide usage snapshot (copy-out: readers never
    /// block writers, spec.md §5 "Shared-resource policy").
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        let per_project: Vec<_> = inner
            .projects
            .iter()
            .map(|(id, state)| (id.clone(), state.effective.clone(), state.usage.clone()))
            .collect();

        let (used_cpu, used_mem) = inner
            .projects
            .values()
            .fold((0.0, 0u64), |(cpu, mem), state| (cpu + state.usage.cpu, mem + state.usage.memory));

        Snapshot {
            per_project,
            system_available_cpu: (self.system.distributable_cpu() - used_cpu).max(0.0),
            system_available_memory: self.system.distributable_memory().saturating_sub(used_mem),
        }
    }

    pub fn allocation_history_len(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }

    /// Dynamic re-allocation sweep (spec.md §4.3 "Dynamic re-allocation").
    /// `throughput` maps each project to its recent completed-tasks-per-period
    /// metric, supplied by the caller (the scheduler owns that statistic).
    pub fn reallocate(&self, throughput: &HashMap<ProjectId, f64>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.projects.is_empty() {
            return;
        }

        let utilisations: Vec<f64> = inner
            .projects
            .values()
            .map(|state| {
                if state.effective.cpu > 0.0 {
                    state.usage.cpu / state.effective.cpu
                } else {
                    0.0
                }
            })
            .collect();

        let mean = utilisations.iter().sum::<f64>() / utilisations.len() as f64;
        let variance = utilisations.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / utilisations.len() as f64;
        let stddev = variance.sqrt();

        if stddev <= self.reallocation_stddev_threshold {
            tracing::debug!(stddev, threshold = self.reallocation_stddev_threshold, "reallocation not triggered");
            return;
        }

        tracing::info!(stddev, "reallocation triggered");

        let weights: HashMap<ProjectId, f64> = inner
            .projects
            .iter()
            .map(|(id, state)| {
                let throughput = throughput.get(id).copied().unwrap_or(0.0);
                let weight = state.configured.priority.max(0) as f64 * (1.0 + throughput / 100.0);
                (id.clone(), weight)
            })
            .collect();

        let total_weight: f64 = weights.values().sum();
        if total_weight <= 0.0 {
            return;
        }

        let distributable_cpu = self.system.distributable_cpu();
        let distributable_memory = self.system.distributable_memory();

        for (id, state) in inner.projects.iter_mut() {
            let share = weights.get(id).copied().unwrap_or(0.0) / total_weight;
            let target_cpu = distributable_cpu * share;
            let target_memory = (distributable_memory as f64 * share) as u64;
            let target_concurrent = ((state.configured.max_concurrent as f64) * share * inner_concurrency_scale(total_weight, weights.len())).max(1.0);

            let smoothing = self.smoothing_factor;
            state.effective.cpu = smoothing * state.effective.cpu + (1.0 - smoothing) * target_cpu;
            state.effective.memory =
                (smoothing * state.effective.memory as f64 + (1.0 - smoothing) * target_memory as f64) as u64;
            state.effective.max_concurrent = ((smoothing * state.effective.max_concurrent as f64
                + (1.0 - smoothing) * target_concurrent)
                .floor() as u32)
                .max(1);

            metrics::gauge!("coordinator.resources.effective_cpu", "project" => id.to_string()).set(state.effective.cpu);
        }
    }
}

/// `max_concurrent` targets are derived the same way as CPU/memory (weight
/// share of the total), but `max_concurrent` has no natural "distributable
/// pool" the way CPU/memory do — scale by project count so re-allocation
/// doesn't collapse every project to a single slot when weights are close.
fn inner_concurrency_scale(_total_weight: f64, project_count: usize) -> f64 {
    project_count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::ids::ProjectId;

    fn quota(cpu: f64, memory: u64, max_concurrent: u32, elastic: bool) -> Quota {
        Quota {
            cpu,
            memory,
            max_concurrent,
            elastic,
            priority: 0,
        }
    }

    fn manager() -> ResourceManager {
        ResourceManager::new(
            SystemTotals {
                cpu: 8.0,
                memory: 16 * 1024 * 1024 * 1024,
                reserve_fraction: 0.2,
            },
            0.5,
            0.20,
            1000,
        )
    }

    #[test]
    fn allocate_respects_concurrent_limit() {
        let rm = manager();
        let p1 = ProjectId::new("p1");
        rm.set_quota(p1.clone(), quota(2.0, 1024, 1, false));

        rm.allocate(&p1, ProcessId::new("w1"), 0.5, 100).unwrap();
        let err = rm.allocate(&p1, ProcessId::new("w2"), 0.5, 100).unwrap_err();
        assert!(matches!(err, CoordinatorError::ConcurrentLimit(_)));
    }

    #[test]
    fn allocate_rejects_cpu_overcommit_without_elastic() {
        let rm = manager();
        let p1 = ProjectId::new("p1");
        rm.set_quota(p1.clone(), quota(1.0, 1024, 5, false));

        rm.allocate(&p1, ProcessId::new("w1"), 0.8, 10).unwrap();
        let err = rm.allocate(&p1, ProcessId::new("w2"), 0.5, 10).unwrap_err();
        assert!(matches!(err, CoordinatorError::CpuExceeded(_)));
    }

    #[test]
    fn elastic_borrow_succeeds_when_other_projects_have_slack() {
        let rm = manager();
        let p1 = ProjectId::new("p1");
        let p2 = ProjectId::new("p2");
        rm.set_quota(p1.clone(), quota(1.0, 1024 * 1024, 5, true));
        rm.set_quota(p2.clone(), quota(1.0, 1024 * 1024, 5, false));

        rm.allocate(&p1, ProcessId::new("w1"), 0.8, 1024).unwrap();
        // p2 uses only 0.1, leaving 0.9 slack -- enough to cover p1's 0.5 shortfall above its 1.0 quota.
        rm.allocate(&p2, ProcessId::new("w2"), 0.1, 1024).unwrap();

        let outcome = rm.allocate(&p1, ProcessId::new("w3"), 0.5, 1024).unwrap();
        assert!(outcome.elastic);
        assert_eq!(rm.allocation_history_len(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let rm = manager();
        let p1 = ProjectId::new("p1");
        rm.set_quota(p1.clone(), quota(1.0, 1024, 1, false));
        let pid = ProcessId::new("w1");
        rm.allocate(&p1, pid.clone(), 0.5, 10).unwrap();

        rm.release(&pid);
        rm.release(&pid);

        let snapshot = rm.snapshot();
        let (_, _, usage) = snapshot.per_project.iter().find(|(id, _, _)| *id == p1).unwrap();
        assert_eq!(usage.concurrent, 0);
        assert_eq!(usage.cpu, 0.0);
    }

    #[test]
    fn system_resources_error_when_host_is_saturated() {
        let rm = ResourceManager::new(
            SystemTotals {
                cpu: 1.0,
                memory: 1024,
                reserve_fraction: 0.0,
            },
            0.5,
            0.20,
            1000,
        );
        let p1 = ProjectId::new("p1");
        rm.set_quota(p1.clone(), quota(10.0, 10_000, 10, false));

        let err = rm.allocate(&p1, ProcessId::new("w1"), 2.0, 10).unwrap_err();
        assert!(matches!(err, CoordinatorError::SystemResources(_)));
    }
}
