mod graph;
mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use coordinator_common::ids::{IssueId, ProcessId};
use tracing::{info, warn};

use crate::events::{CoordinatorEvent, EventSender};
use graph::ResourceGraph;
pub use queue::{WaitOutcome, WaitQueue};

/// Bookkeeping for an issue lock currently held by some process, recorded
/// purely in-process for deadlock analysis (the shared store remains the
/// authoritative owner of the lock itself — spec.md §5).
#[derive(Clone, Debug)]
struct HeldLock {
    holder: ProcessId,
    os_pid: u32,
    acquired_at: DateTime<Utc>,
}

struct Inner {
    held: HashMap<IssueId, HeldLock>,
    waiting: HashMap<IssueId, WaitQueue>,
}

/// Result of a deadlock sweep that found and broke a cycle. The daemon
/// acts on this by force-checking-in the named issue as an error via C2.
#[derive(Clone, Debug)]
pub struct DeadlockBreak {
    pub issue_id: IssueId,
    pub holder: ProcessId,
}

/// Tracks which OS pid holds which issue lock and who is queued behind it,
/// and periodically walks the resulting resource-allocation graph for
/// cycles (spec.md §5 "Deadlock handling"). This is a fallback safety net;
/// normal operation resolves contention through the waiting queue alone.
pub struct DeadlockDetector {
    inner: Mutex<Inner>,
    events: EventSender,
    broken_count: AtomicU64,
}

impl DeadlockDetector {
    pub fn new(events: EventSender) -> Self {
        Self {
            inner: Mutex::new(Inner {
                held: HashMap::new(),
                waiting: HashMap::new(),
            }),
            events,
            broken_count: AtomicU64::new(0),
        }
    }

    pub fn record_held(&self, issue_id: IssueId, holder: ProcessId, os_pid: u32) {
        let mut inner = self.inner.lock().expect("waiting mutex poisoned");
        inner.held.insert(
            issue_id,
            HeldLock {
                holder,
                os_pid,
                acquired_at: Utc::now(),
            },
        );
    }

    pub fn clear_held(&self, issue_id: &IssueId) {
        self.inner.lock().expect("waiting mutex poisoned").held.remove(issue_id);
    }

    /// Enqueue a local waiter behind the current holder of `issue_id`. The
    /// returned receiver resolves once it reaches the head (`Ready`) or is
    /// abandoned by a deadlock break.
    pub fn enqueue_wait(
        &self,
        issue_id: IssueId,
        priority: coordinator_common::types::WaitPriority,
        os_pid: u32,
    ) -> tokio::sync::oneshot::Receiver<WaitOutcome> {
        let mut inner = self.inner.lock().expect("waiting mutex poisoned");
        inner.waiting.entry(issue_id).or_default().push(priority, os_pid)
    }

    /// Called when a lock is released: wake the next local waiter, if any.
    pub fn advance(&self, issue_id: &IssueId) {
        let mut inner = self.inner.lock().expect("waiting mutex poisoned");
        if let Some(q) = inner.waiting.get_mut(issue_id) {
            q.pop_next();
            if q.is_empty() {
                inner.waiting.remove(issue_id);
            }
        }
    }

    pub fn broken_count(&self) -> u64 {
        self.broken_count.load(Ordering::Relaxed)
    }

    /// Build the resource-allocation graph from current state and, if it
    /// contains a cycle, force-release the lock with the oldest
    /// acquisition time among the cycle's holders.
    pub fn sweep(&self) -> Option<DeadlockBreak> {
        let mut inner = self.inner.lock().expect("waiting mutex poisoned");

        let mut graph = ResourceGraph::new();
        for (issue_id, wq) in &inner.waiting {
            let Some(held) = inner.held.get(issue_id) else {
                continue;
            };
            for waiter_pid in wq.waiter_pids() {
                graph.add_edge(waiter_pid, held.os_pid);
            }
        }

        let cycle = graph.find_cycle()?;
        let cycle_pids: std::collections::HashSet<u32> = cycle.into_iter().collect();

        let victim = inner
            .held
            .iter()
            .filter(|(_, h)| cycle_pids.contains(&h.os_pid))
            .min_by_key(|(_, h)| h.acquired_at)
            .map(|(issue_id, h)| (issue_id.clone(), h.clone()))?;

        let (issue_id, held) = victim;
        inner.held.remove(&issue_id);
        // The victim's lock is now free: wake whoever's been waiting longest
        // for it rather than leaving the queue stuck behind a dead holder.
        if let Some(q) = inner.waiting.get_mut(&issue_id) {
            q.pop_next();
            if q.is_empty() {
                inner.waiting.remove(&issue_id);
            }
        }
        drop(inner);

        self.broken_count.fetch_add(1, Ordering::Relaxed);
        warn!(issue_id = %issue_id, holder = %held.holder, "deadlock detected, lock force-released");
        let _ = self.events.send(CoordinatorEvent::DeadlockBroken {
            process_id: held.holder.clone(),
            issue_id: issue_id.clone(),
        });

        Some(DeadlockBreak {
            issue_id,
            holder: held.holder,
        })
    }
}

/// Background sweep ticker, cancellable via the shared shutdown flag
/// (same pattern as the orphan scanner and reallocation timer).
pub async fn run_deadlock_sweep(
    detector: std::sync::Arc<DeadlockDetector>,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(broken) = detector.sweep() {
                    info!(issue_id = %broken.issue_id, "deadlock sweep broke a cycle");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::types::WaitPriority;

    fn detector() -> (std::sync::Arc<DeadlockDetector>, tokio::sync::mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (std::sync::Arc::new(DeadlockDetector::new(tx)), rx)
    }

    #[test]
    fn acyclic_contention_has_nothing_to_break() {
        let (d, _rx) = detector();
        d.record_held(IssueId::new("1"), ProcessId::new("proc-a"), 100);
        let _rx1 = d.enqueue_wait(IssueId::new("1"), WaitPriority::Normal, 200);
        assert!(d.sweep().is_none());
    }

    #[test]
    fn cycle_breaks_the_oldest_acquisition() {
        let (d, mut events) = detector();

        // pid 100 holds issue "1" and waits on issue "2" (held by pid 200).
        // pid 200 holds issue "2" and waits on issue "1" (held by pid 100).
        d.record_held(IssueId::new("1"), ProcessId::new("proc-a"), 100);
        std::thread::sleep(std::time::Duration::from_millis(2));
        d.record_held(IssueId::new("2"), ProcessId::new("proc-b"), 200);

        let _w1 = d.enqueue_wait(IssueId::new("2"), WaitPriority::Normal, 100);
        let _w2 = d.enqueue_wait(IssueId::new("1"), WaitPriority::Normal, 200);

        let broken = d.sweep().expect("cycle should be detected");
        assert_eq!(broken.issue_id, IssueId::new("1"));
        assert_eq!(broken.holder, ProcessId::new("proc-a"));
        assert_eq!(d.broken_count(), 1);

        let event = events.try_recv().expect("deadlock-broken event emitted");
        assert!(matches!(event, CoordinatorEvent::DeadlockBroken { .. }));
    }
}
