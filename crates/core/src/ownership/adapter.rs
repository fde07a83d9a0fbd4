use async_trait::async_trait;
use coordinator_common::ids::IssueId;
use coordinator_common::Result;

/// Narrow interface to the issue-tracker adapter (label/comment updates),
/// kept out of scope per spec.md §1 — the core only calls this boundary
/// fire-and-forget (spec.md §4.2 "Checkout protocol" step 4).
#[async_trait]
pub trait IssueTrackerAdapter: Send + Sync {
    async fn attach_label(&self, issue_id: &IssueId, label: &str) -> Result<()>;
}

/// Default adapter used when no real issue tracker is wired in (tests, or
/// deployments that don't use label-based status signalling).
pub struct NoopIssueTracker;

#[async_trait]
impl IssueTrackerAdapter for NoopIssueTracker {
    async fn attach_label(&self, _issue_id: &IssueId, _label: &str) -> Result<()> {
        Ok(())
    }
}
