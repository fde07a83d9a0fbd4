use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use coordinator_common::types::WaitPriority;
use tokio::sync::oneshot;

/// Outcome delivered to a waiter once it reaches the head of the queue or
/// is rejected (timeout, deadlock break).
#[derive(Debug)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    DeadlockBroken,
}

struct Waiter {
    priority: WaitPriority,
    arrival: DateTime<Utc>,
    os_pid: u32,
    resolver: oneshot::Sender<WaitOutcome>,
}

/// In-process FIFO-within-priority-class queue for callers contending on
/// the same issue lock (spec.md §3 "Waiting Queue Entry", §5
/// "Shared-resource policy"). One instance guards a single issue id; the
/// registry in `mod.rs` keeps one per contended issue.
#[derive(Default)]
pub struct WaitQueue {
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a waiter and return a receiver that resolves when it's
    /// released, rejected by timeout, or dropped by deadlock-break.
    /// Insertion keeps the queue ordered by priority ordinal, then arrival,
    /// so a higher-priority waiter placed after a lower one still cuts the
    /// line — but never ahead of an equal-or-higher waiter already queued.
    pub fn push(&mut self, priority: WaitPriority, os_pid: u32) -> oneshot::Receiver<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            priority,
            arrival: Utc::now(),
            os_pid,
            resolver: tx,
        };

        let pos = self
            .waiters
            .iter()
            .position(|w| {
                w.priority.ordinal() > priority.ordinal()
                    || (w.priority.ordinal() == priority.ordinal() && w.arrival > waiter.arrival)
            })
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, waiter);
        rx
    }

    /// Wake and remove the waiter at the head of the queue.
    pub fn pop_next(&mut self) -> bool {
        if let Some(w) = self.waiters.pop_front() {
            let _ = w.resolver.send(WaitOutcome::Ready);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// The OS pids currently queued, oldest first — used to build the
    /// resource-allocation graph for deadlock detection.
    pub fn waiter_pids(&self) -> Vec<u32> {
        self.waiters.iter().map(|w| w.os_pid).collect()
    }

    /// Remove every waiter belonging to `os_pid` and reject them, used when
    /// a deadlock-break decides to abandon that pid's claim.
    pub fn reject_pid(&mut self, os_pid: u32) {
        let (rejected, remaining): (VecDeque<_>, VecDeque<_>) =
            self.waiters.drain(..).partition(|w| w.os_pid == os_pid);
        self.waiters = remaining;
        for w in rejected {
            let _ = w.resolver.send(WaitOutcome::DeadlockBroken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn higher_priority_cuts_the_line() {
        let mut q = WaitQueue::new();
        let low = q.push(WaitPriority::Low, 1);
        let urgent = q.push(WaitPriority::Urgent, 2);

        assert!(q.pop_next());
        assert!(matches!(urgent.await.unwrap(), WaitOutcome::Ready));

        assert!(q.pop_next());
        assert!(matches!(low.await.unwrap(), WaitOutcome::Ready));
    }

    #[tokio::test]
    async fn same_priority_is_fifo() {
        let mut q = WaitQueue::new();
        let first = q.push(WaitPriority::Normal, 1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let _second = q.push(WaitPriority::Normal, 2);

        assert!(q.pop_next());
        assert!(matches!(first.await.unwrap(), WaitOutcome::Ready));
    }

    #[tokio::test]
    async fn reject_pid_drops_only_that_pids_waiters() {
        let mut q = WaitQueue::new();
        let victim = q.push(WaitPriority::Normal, 1);
        let survivor = q.push(WaitPriority::Normal, 2);

        q.reject_pid(1);
        assert!(matches!(victim.await.unwrap(), WaitOutcome::DeadlockBroken));
        assert_eq!(q.len(), 1);

        assert!(q.pop_next());
        assert!(matches!(survivor.await.unwrap(), WaitOutcome::Ready));
    }
}
