use serde::{Deserialize, Serialize};

use crate::ids::ProjectId;
use crate::types::Quota;

/// A registered project — one of the repositories/codebases the coordinator
/// schedules work for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub path: String,
    /// Higher is more favoured under the Priority selection policy.
    pub priority: i32,
    /// Positive real weight used by the weighted-fair selection policy.
    pub share_weight: f64,
    pub quota: Quota,
    pub enabled: bool,
}

impl Project {
    pub fn new(id: ProjectId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            priority: 0,
            share_weight: 1.0,
            quota: Quota::default(),
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_project_is_enabled_with_default_quota() {
        let p = Project::new(ProjectId::new("p1"), "Project One", "/srv/p1");
        assert!(p.enabled);
        assert_eq!(p.share_weight, 1.0);
        assert_eq!(p.quota.max_concurrent, Quota::default().max_concurrent);
    }
}
