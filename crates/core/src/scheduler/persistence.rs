use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use coordinator_common::config::PersistenceConfig;
use coordinator_common::types::Task;
use coordinator_common::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ProjectStats;

/// On-disk shape of a queue snapshot (spec.md §4.4 "Persistence"). Keyed by
/// the string form of the id rather than the id type itself so the file
/// stays a plain JSON object regardless of how the id newtype serializes.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueFile {
    pub queue: Vec<Task>,
    pub processing: HashMap<String, Task>,
    #[serde(rename = "projectStats")]
    pub project_stats: HashMap<String, ProjectStats>,
    #[serde(rename = "savedAt")]
    pub saved_at: DateTime<Utc>,
}

/// Writes snapshots atomically (temp file + rename, grounded on the same
/// pattern the teacher uses for its on-disk artifacts) and rotates them
/// into a bounded-size history directory.
#[derive(Clone)]
pub struct SnapshotManager {
    directory: PathBuf,
    retention: usize,
}

impl SnapshotManager {
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            directory: PathBuf::from(&config.directory),
            retention: config.snapshot_retention.max(1) as usize,
        }
    }

    fn main_path(&self) -> PathBuf {
        self.directory.join("queue.json")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.directory.join("snapshots")
    }

    /// Persist `file` as the live state, then copy it into the rotating
    /// snapshot history and prune anything past the retention window.
    pub async fn save(&self, file: &QueueFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("create persistence dir: {e}")))?;

        let body = serde_json::to_vec_pretty(file)?;
        write_atomic(&self.main_path(), &body).await?;

        let snapshots_dir = self.snapshots_dir();
        tokio::fs::create_dir_all(&snapshots_dir)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("create snapshots dir: {e}")))?;
        let snapshot_name = format!("queue-{}.json", file.saved_at.format("%Y%m%dT%H%M%S%.3f"));
        write_atomic(&snapshots_dir.join(snapshot_name), &body).await?;

        self.prune(&snapshots_dir).await;
        Ok(())
    }

    async fn prune(&self, snapshots_dir: &Path) {
        let mut entries = match tokio::fs::read_dir(snapshots_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read snapshot directory for pruning");
                return;
            }
        };

        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => names.push(entry.file_name()),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error while listing snapshots");
                    break;
                }
            }
        }
        names.sort();

        if names.len() <= self.retention {
            return;
        }
        let excess = names.len() - self.retention;
        for name in names.into_iter().take(excess) {
            let path = snapshots_dir.join(name);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to prune old snapshot");
            }
        }
    }

    /// Load the live state written by the last `save()`, if one exists.
    pub async fn load(&self) -> Result<Option<QueueFile>> {
        let path = self.main_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: QueueFile = serde_json::from_slice(&bytes)?;
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoordinatorError::Internal(format!(
                "read persisted queue {}: {e}",
                path.display()
            ))),
        }
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CoordinatorError::Internal(format!("create temp file in {}: {e}", dir.display())))?;

    use std::io::Write;
    tmp.write_all(body)
        .map_err(|e| CoordinatorError::Internal(format!("write temp file: {e}")))?;
    tmp.flush()
        .map_err(|e| CoordinatorError::Internal(format!("flush temp file: {e}")))?;

    tmp.persist(path)
        .map_err(|e| CoordinatorError::Internal(format!("rename temp file into place: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::ids::{IssueId, ProjectId};

    fn config(dir: &Path) -> PersistenceConfig {
        PersistenceConfig {
            directory: dir.to_string_lossy().into_owned(),
            interval_seconds: 30,
            snapshot_retention: 2,
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(&config(dir.path()));

        let task = Task::new(ProjectId::new("p1"), IssueId::new("1"), "lint", 10);
        let file = QueueFile {
            queue: vec![task.clone()],
            processing: HashMap::new(),
            project_stats: HashMap::new(),
            saved_at: Utc::now(),
        };

        manager.save(&file).await.unwrap();
        let loaded = manager.load().await.unwrap().expect("snapshot present");
        assert_eq!(loaded.queue.len(), 1);
        assert_eq!(loaded.queue[0].id, task.id);
    }

    #[tokio::test]
    async fn load_without_prior_save_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(&config(dir.path()));
        assert!(manager.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_history_is_pruned_to_retention() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(&config(dir.path()));

        for _ in 0..5 {
            let file = QueueFile {
                queue: Vec::new(),
                processing: HashMap::new(),
                project_stats: HashMap::new(),
                saved_at: Utc::now(),
            };
            manager.save(&file).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(manager.snapshots_dir()).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
