use std::path::{Path, PathBuf};

use coordinator_common::config::SystemConfig;
use coordinator_common::types::{Project, Quota};
use coordinator_common::ProjectId;
use serde::Deserialize;

use super::validation;

/// Complete coordinator configuration loaded from the config directory
/// (SPEC_FULL.md §2 "Config": `coordinator.toml` + `projects.toml`, refuse
/// to start on invalid config).
#[derive(Clone, Debug)]
pub struct CoordinatorConfigBundle {
    pub system: SystemConfig,
    pub projects: Vec<Project>,
    #[allow(dead_code)]
    pub config_dir: PathBuf,
}

/// Raw `projects.toml` shape: `[[project]]` tables.
#[derive(Clone, Debug, Deserialize)]
pub struct ProjectsFile {
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_share_weight")]
    pub share_weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub elastic: bool,
}

fn default_share_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl ProjectEntry {
    fn into_project(self) -> Result<Project, ConfigError> {
        let cpu = match self.cpu.as_deref() {
            Some(raw) => crate::resources::parse_cpu(raw)
                .map_err(|e| ConfigError::Validation(format!("project {}: {e}", self.id)))?,
            None => Quota::default().cpu,
        };
        let memory = match self.memory.as_deref() {
            Some(raw) => crate::resources::parse_memory(raw)
                .map_err(|e| ConfigError::Validation(format!("project {}: {e}", self.id)))?,
            None => Quota::default().memory,
        };

        Ok(Project {
            id: ProjectId::new(self.id),
            name: self.name,
            path: self.path,
            priority: self.priority,
            share_weight: self.share_weight,
            quota: Quota {
                cpu,
                memory,
                max_concurrent: self.max_concurrent.unwrap_or(Quota::default().max_concurrent),
                elastic: self.elastic,
                priority: self.priority,
            },
            enabled: self.enabled,
        })
    }
}

/// Load and validate all coordinator configuration. Fails loudly — the
/// daemon refuses to start on misconfiguration (spec.md §6 exit code 2).
pub fn load_config(config_dir: &Path) -> Result<CoordinatorConfigBundle, ConfigError> {
    tracing::info!(config_dir = %config_dir.display(), "loading coordinator configuration");

    let system = load_system_config(&config_dir.join("coordinator.toml"))?;
    let projects = load_projects(&config_dir.join("projects.toml"))?;

    let bundle = CoordinatorConfigBundle {
        system,
        projects,
        config_dir: config_dir.to_path_buf(),
    };

    validation::validate(&bundle)?;

    tracing::info!(projects = bundle.projects.len(), "coordinator configuration loaded");
    Ok(bundle)
}

fn load_system_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "coordinator.toml not found, using defaults");
        return Ok(SystemConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn load_projects(path: &Path) -> Result<Vec<Project>, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "projects.toml not found, starting with no registered projects");
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let parsed: ProjectsFile = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    parsed.projects.into_iter().map(|p| p.into_project()).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for coordinator_common::CoordinatorError {
    fn from(e: ConfigError) -> Self {
        coordinator_common::CoordinatorError::Config(e.to_string())
    }
}
