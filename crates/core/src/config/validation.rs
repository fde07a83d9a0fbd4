use coordinator_common::config::RetryConfig;

use super::loader::{ConfigError, CoordinatorConfigBundle};

/// Validate the complete coordinator configuration. Checks sane ranges on
/// numeric parameters and that registered projects reference unique ids.
/// The daemon refuses to start on validation failure (spec.md §6 exit code 2).
pub fn validate(config: &CoordinatorConfigBundle) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_scheduler(config, &mut errors);
    validate_ownership(config, &mut errors);
    validate_resources(config, &mut errors);
    validate_protocol(config, &mut errors);
    validate_retry(config, &mut errors);
    validate_persistence(config, &mut errors);
    validate_projects(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_scheduler(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let s = &config.system.scheduler;

    const VALID: &[&str] = &["fifo", "priority", "round-robin", "weighted-fair", "deadline-aware"];
    if !VALID.contains(&s.policy.as_str()) {
        errors.push(format!(
            "scheduler.policy '{}' is not one of {:?}",
            s.policy, VALID
        ));
    }
    if s.max_retries == 0 {
        errors.push("scheduler.max_retries must be > 0".into());
    }
    if s.deadline_window_hours <= 0 {
        errors.push("scheduler.deadline_window_hours must be > 0".into());
    }
}

fn validate_ownership(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let o = &config.system.ownership;

    if o.lock_ttl_seconds == 0 {
        errors.push("ownership.lock_ttl_seconds must be > 0".into());
    }
    if o.heartbeat_ttl_seconds == 0 {
        errors.push("ownership.heartbeat_ttl_seconds must be > 0".into());
    }
    if o.orphan_scan_interval_seconds == 0 {
        errors.push("ownership.orphan_scan_interval_seconds must be > 0".into());
    }
    if o.checkout_timeout_seconds == 0 {
        errors.push("ownership.checkout_timeout_seconds must be > 0".into());
    }
}

fn validate_resources(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let r = &config.system.resources;

    if r.system_cpu <= 0.0 {
        errors.push("resources.system_cpu must be > 0".into());
    }
    if r.system_memory == 0 {
        errors.push("resources.system_memory must be > 0".into());
    }
    if !(0.0..1.0).contains(&r.system_reserve_fraction) {
        errors.push("resources.system_reserve_fraction must be in [0, 1)".into());
    }
    if r.reallocation_interval_seconds == 0 {
        errors.push("resources.reallocation_interval_seconds must be > 0".into());
    }
    if !(0.0..=1.0).contains(&r.smoothing_factor) {
        errors.push("resources.smoothing_factor must be in [0, 1]".into());
    }
    if r.allocation_history_capacity == 0 {
        errors.push("resources.allocation_history_capacity must be > 0".into());
    }
}

fn validate_protocol(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let p = &config.system.protocol;

    if p.socket_path.is_empty() {
        errors.push("protocol.socket_path must not be empty".into());
    }
    if p.request_timeout_seconds == 0 {
        errors.push("protocol.request_timeout_seconds must be > 0".into());
    }
}

fn validate_retry(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let validate_one = |rc: &RetryConfig, name: &str, errors: &mut Vec<String>| {
        if rc.max_attempts == 0 {
            errors.push(format!("retry.{name}.max_attempts must be > 0"));
        }
        if rc.initial_backoff_ms == 0 {
            errors.push(format!("retry.{name}.initial_backoff_ms must be > 0"));
        }
        if rc.max_backoff_ms < rc.initial_backoff_ms {
            errors.push(format!("retry.{name}.max_backoff_ms must be >= initial_backoff_ms"));
        }
        if rc.backoff_multiplier < 1.0 {
            errors.push(format!("retry.{name}.backoff_multiplier must be >= 1.0"));
        }
    };

    validate_one(&config.system.retry.store, "store", errors);
    validate_one(&config.system.retry.lock, "lock", errors);
    validate_one(&config.system.retry.label_update, "label_update", errors);
}

fn validate_persistence(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let p = &config.system.persistence;

    if p.directory.is_empty() {
        errors.push("persistence.directory must not be empty".into());
    }
    if p.snapshot_retention == 0 {
        errors.push("persistence.snapshot_retention must be > 0".into());
    }
}

fn validate_projects(config: &CoordinatorConfigBundle, errors: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    for project in &config.projects {
        if !seen.insert(project.id.clone()) {
            errors.push(format!("duplicate project id '{}'", project.id));
        }
        if project.share_weight <= 0.0 {
            errors.push(format!("project {}: share_weight must be > 0", project.id));
        }
        if project.quota.max_concurrent == 0 {
            errors.push(format!("project {}: max_concurrent must be > 0", project.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_common::config::SystemConfig;

    #[test]
    fn default_system_config_passes_validation() {
        let bundle = CoordinatorConfigBundle {
            system: SystemConfig::default(),
            projects: Vec::new(),
            config_dir: std::path::PathBuf::from("."),
        };
        assert!(validate(&bundle).is_ok());
    }

    #[test]
    fn unknown_scheduler_policy_is_rejected() {
        let mut system = SystemConfig::default();
        system.scheduler.policy = "bogus".into();
        let bundle = CoordinatorConfigBundle {
            system,
            projects: Vec::new(),
            config_dir: std::path::PathBuf::from("."),
        };
        assert!(validate(&bundle).is_err());
    }
}
