use serde::{Deserialize, Serialize};

/// Top-level system configuration, deserialized from `coordinator.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub ownership: OwnershipConfig,
    pub resources: ResourceDefaults,
    pub protocol: ProtocolConfig,
    pub retry: RetryDefaults,
    pub persistence: PersistenceConfig,
}

/// Connection parameters for the shared-state store client (C1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string for the backing key-value + pub/sub store.
    pub url: String,
    /// Cap in seconds for the exponential backoff on reconnect/retry.
    #[serde(default = "default_store_backoff_cap")]
    pub backoff_cap_seconds: u64,
}

fn default_store_backoff_cap() -> u64 {
    30
}

/// Scheduler & queue configuration (C4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Selection policy: "fifo" | "priority" | "round-robin" | "weighted-fair" | "deadline-aware".
    pub policy: String,
    /// Debounce interval, in milliseconds, before a scheduling pass runs
    /// after an enqueue.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Maximum retry attempts before a task is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Window, in hours, within which a task's deadline makes it eligible
    /// for immediate selection under the deadline-aware policy.
    #[serde(default = "default_deadline_window_hours")]
    pub deadline_window_hours: i64,
    /// Number of terminal (completed/failed/cancelled) tasks retained for
    /// `task.status`/`task.retry` lookups after they leave the live queue.
    #[serde(default = "default_terminal_history_capacity")]
    pub terminal_history_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_deadline_window_hours() -> i64 {
    24
}

fn default_terminal_history_capacity() -> usize {
    500
}

/// Ownership coordinator timing configuration (C2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnershipConfig {
    /// TTL, in seconds, for the per-issue lock.
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
    /// TTL, in seconds, for a process's heartbeat key.
    #[serde(default = "default_heartbeat_ttl_seconds")]
    pub heartbeat_ttl_seconds: u64,
    /// Interval, in seconds, between orphan sweeps.
    #[serde(default = "default_orphan_scan_interval_seconds")]
    pub orphan_scan_interval_seconds: u64,
    /// Default checkout timeout, in seconds, including retries and any
    /// in-process waiting-queue delay.
    #[serde(default = "default_checkout_timeout_seconds")]
    pub checkout_timeout_seconds: u64,
    /// Interval, in seconds, between deadlock-detection sweeps.
    #[serde(default = "default_deadlock_scan_interval_seconds")]
    pub deadlock_scan_interval_seconds: u64,
    /// Whether a failed issue-tracker label write is queued for later
    /// reconciliation by a background reconciler, or left best-effort.
    /// Defaults to `false` (best-effort only) per spec.md §9.
    #[serde(default)]
    pub reconcile_labels: bool,
}

fn default_lock_ttl_seconds() -> u64 {
    5 * 60
}

fn default_heartbeat_ttl_seconds() -> u64 {
    30 * 60
}

fn default_orphan_scan_interval_seconds() -> u64 {
    5 * 60
}

fn default_checkout_timeout_seconds() -> u64 {
    30
}

fn default_deadlock_scan_interval_seconds() -> u64 {
    60
}

/// System-wide and per-project-default resource quota configuration (C3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDefaults {
    /// Total CPU (fractional cores) available on this host.
    pub system_cpu: f64,
    /// Total memory (bytes) available on this host.
    pub system_memory: u64,
    /// Fraction withheld from distribution during re-allocation (default 0.20).
    #[serde(default = "default_system_reserve_fraction")]
    pub system_reserve_fraction: f64,
    /// Interval, in seconds, between re-allocation sweeps (default 60).
    #[serde(default = "default_reallocation_interval_seconds")]
    pub reallocation_interval_seconds: u64,
    /// Standard-deviation threshold of per-project CPU utilisation above
    /// which a re-allocation is triggered (default 0.20).
    #[serde(default = "default_reallocation_stddev_threshold")]
    pub reallocation_stddev_threshold: f64,
    /// Smoothing factor applied between old and target quotas (default 0.5).
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
    /// Maximum number of allocation-history entries retained (ring buffer).
    #[serde(default = "default_allocation_history_capacity")]
    pub allocation_history_capacity: usize,
}

fn default_system_reserve_fraction() -> f64 {
    0.20
}

fn default_reallocation_interval_seconds() -> u64 {
    60
}

fn default_reallocation_stddev_threshold() -> f64 {
    0.20
}

fn default_smoothing_factor() -> f64 {
    0.5
}

fn default_allocation_history_capacity() -> usize {
    1000
}

/// Control-plane protocol configuration (C5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Path to the Unix domain socket (POSIX) or named pipe (Windows).
    pub socket_path: String,
    /// Whether clients must authenticate with a bearer token before any
    /// other message.
    #[serde(default)]
    pub auth_required: bool,
    /// Default per-request client-side timeout, in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Optional secondary transport over the shared store's pub/sub
    /// channels, disabled unless configured (spec.md §9 Open Question).
    #[serde(default)]
    pub secondary_transport: Option<StoreChannelConfig>,
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// Configuration for the optional store-pub/sub secondary transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreChannelConfig {
    pub requests_channel: String,
    pub responses_channel: String,
}

/// Default retry parameters for store, lock, and label-update operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryDefaults {
    pub store: RetryConfig,
    pub lock: RetryConfig,
    pub label_update: RetryConfig,
}

/// Retry configuration for a specific target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

/// Queue persistence configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory the queue file and rotating snapshots are written to.
    pub directory: String,
    /// Interval, in seconds, between timer-driven persistence writes.
    #[serde(default = "default_persistence_interval_seconds")]
    pub interval_seconds: u64,
    /// Number of rotating snapshots retained.
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,
}

fn default_persistence_interval_seconds() -> u64 {
    30
}

fn default_snapshot_retention() -> usize {
    24
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                backoff_cap_seconds: default_store_backoff_cap(),
            },
            scheduler: SchedulerConfig {
                policy: "priority".to_string(),
                debounce_ms: default_debounce_ms(),
                max_retries: default_max_retries(),
                deadline_window_hours: default_deadline_window_hours(),
                terminal_history_capacity: default_terminal_history_capacity(),
            },
            ownership: OwnershipConfig {
                lock_ttl_seconds: default_lock_ttl_seconds(),
                heartbeat_ttl_seconds: default_heartbeat_ttl_seconds(),
                orphan_scan_interval_seconds: default_orphan_scan_interval_seconds(),
                checkout_timeout_seconds: default_checkout_timeout_seconds(),
                deadlock_scan_interval_seconds: default_deadlock_scan_interval_seconds(),
                reconcile_labels: false,
            },
            resources: ResourceDefaults {
                system_cpu: 8.0,
                system_memory: 16 * 1024 * 1024 * 1024,
                system_reserve_fraction: default_system_reserve_fraction(),
                reallocation_interval_seconds: default_reallocation_interval_seconds(),
                reallocation_stddev_threshold: default_reallocation_stddev_threshold(),
                smoothing_factor: default_smoothing_factor(),
                allocation_history_capacity: default_allocation_history_capacity(),
            },
            protocol: ProtocolConfig {
                socket_path: default_socket_path(),
                auth_required: false,
                request_timeout_seconds: default_request_timeout_seconds(),
                secondary_transport: None,
            },
            retry: RetryDefaults {
                store: RetryConfig {
                    max_attempts: 5,
                    initial_backoff_ms: 100,
                    max_backoff_ms: 30_000,
                    backoff_multiplier: 2.0,
                    jitter: false,
                },
                lock: RetryConfig {
                    max_attempts: 3,
                    initial_backoff_ms: 50,
                    max_backoff_ms: 2_000,
                    backoff_multiplier: 2.0,
                    jitter: false,
                },
                label_update: RetryConfig {
                    max_attempts: 3,
                    initial_backoff_ms: 50,
                    max_backoff_ms: 2_000,
                    backoff_multiplier: 2.0,
                    jitter: false,
                },
            },
            persistence: PersistenceConfig {
                directory: "state".to_string(),
                interval_seconds: default_persistence_interval_seconds(),
                snapshot_retention: default_snapshot_retention(),
            },
        }
    }
}

fn default_socket_path() -> String {
    #[cfg(windows)]
    {
        r"\\.\pipe\poppobuilder-daemon".to_string()
    }
    #[cfg(not(windows))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        format!("{}/.poppobuilder/daemon.sock", home)
    }
}
