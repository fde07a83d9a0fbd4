mod commands;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coordinator_common::config::SystemConfig;
use coordinator_common::ids::{ProcessId, ProjectId};
use coordinator_common::types::{Project, ProcessRole};
use coordinator_protocol::{Message, ServerConfig};
use coordinator_store::StoreClient;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

pub use commands::build_registry;

use crate::config::{load_config, ConfigError};
use crate::events::{CoordinatorEvent, EventSender};
use crate::ownership::{OwnershipConfig, OwnershipCoordinator};
use crate::resources::{ResourceManager, SystemTotals};
use crate::scheduler::{run_persistence_loop, Scheduler, SnapshotManager};
use crate::waiting::{run_deadlock_sweep, DeadlockDetector};
use crate::worker_kind::WorkerKindRegistry;
use crate::CircuitBreakerRegistry;

/// Failure during startup, distinguished so `main` can choose the exit code
/// spec.md §6 assigns it: 2 for invalid config, 3 for an unreachable store.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("shared-state store unreachable: {0}")]
    Store(#[from] coordinator_store::StoreError),
}

/// In-memory registry of known projects (SPEC_FULL.md §2 supplement).
/// `project.*` commands mutate this directly; edits are not written back to
/// `projects.toml` — a `daemon.reload` (HUP) replaces the whole registry
/// from disk again, so a live edit survives only until the next reload
/// (Open Question, resolved here in favour of the simpler, stateless-on-
/// disk model; see DESIGN.md).
struct ProjectRegistry {
    projects: std::sync::Mutex<HashMap<ProjectId, Project>>,
}

impl ProjectRegistry {
    fn snapshot(&self) -> Vec<Project> {
        self.projects.lock().expect("project registry mutex poisoned").values().cloned().collect()
    }
}

/// Everything that makes up the coordinator daemon (C6): the C1-C5
/// components it owns, plus the lifecycle state (project registry, live
/// config, shutdown signal) that doesn't belong to any one of them.
pub struct Daemon {
    pub(crate) store: Arc<StoreClient>,
    pub(crate) ownership: Arc<OwnershipCoordinator>,
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) deadlock: Arc<DeadlockDetector>,
    pub(crate) worker_kinds: Arc<WorkerKindRegistry>,
    pub(crate) circuit_breakers: Arc<CircuitBreakerRegistry>,
    persistence: SnapshotManager,
    projects: ProjectRegistry,
    config: RwLock<SystemConfig>,
    config_dir: PathBuf,
    started_at: DateTime<Utc>,
    self_process_id: ProcessId,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) events_tx: EventSender,
    events_broadcast: broadcast::Sender<Message>,
}

impl Daemon {
    /// Load configuration, connect to the store, and construct every C2-C5
    /// component wired together per spec.md §4.6. Returns the event
    /// receiver half separately since `Arc<Daemon>` can't hold an exclusive
    /// receiver itself.
    pub async fn bootstrap(
        config_dir: PathBuf,
    ) -> Result<(Arc<Daemon>, mpsc::UnboundedReceiver<CoordinatorEvent>), BootstrapError> {
        let bundle = load_config(&config_dir)?;
        let store = Arc::new(StoreClient::connect(&bundle.system.store.url).await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let deadlock = Arc::new(DeadlockDetector::new(events_tx.clone()));
        let ownership = Arc::new(OwnershipCoordinator::new(
            Arc::clone(&store),
            OwnershipConfig::from(&bundle.system.ownership),
            Arc::new(crate::ownership::NoopIssueTracker),
            events_tx.clone(),
            Arc::clone(&deadlock),
        ));

        let resources = Arc::new(ResourceManager::new(
            SystemTotals {
                cpu: bundle.system.resources.system_cpu,
                memory: bundle.system.resources.system_memory,
                reserve_fraction: bundle.system.resources.system_reserve_fraction,
            },
            bundle.system.resources.smoothing_factor,
            bundle.system.resources.reallocation_stddev_threshold,
            bundle.system.resources.allocation_history_capacity,
        ));

        let scheduler = Arc::new(Scheduler::from_config(&bundle.system.scheduler));
        let persistence = SnapshotManager::new(&bundle.system.persistence);
        match persistence.load().await {
            Ok(Some(file)) => scheduler.restore(file),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load persisted queue state, starting empty"),
        }

        let mut projects = HashMap::new();
        for project in bundle.projects {
            resources.set_quota(project.id.clone(), project.quota.clone());
            scheduler.set_share_weight(&project.id, project.share_weight);
            projects.insert(project.id.clone(), project);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let (broadcast_tx, _) = broadcast::channel(1024);
        let self_process_id = ProcessId::new(format!("coordinator-{}", std::process::id()));

        let daemon = Arc::new(Daemon {
            store,
            ownership,
            resources,
            scheduler,
            deadlock,
            worker_kinds: Arc::new(WorkerKindRegistry::with_defaults()),
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new()),
            persistence,
            projects: ProjectRegistry { projects: std::sync::Mutex::new(projects) },
            config: RwLock::new(bundle.system),
            config_dir,
            started_at: Utc::now(),
            self_process_id,
            shutdown_tx,
            events_tx,
            events_broadcast: broadcast_tx,
        });

        Ok((daemon, events_rx))
    }

    fn config_snapshot(&self) -> SystemConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Bearer token the control channel requires, if any. Sourced from an
    /// environment variable rather than `coordinator.toml` so a secret
    /// never has to be committed alongside the rest of the config
    /// (SPEC_FULL.md §2 supplement, Open Question resolved this way).
    fn auth_token(&self) -> Option<String> {
        if !self.config_snapshot().protocol.auth_required {
            return None;
        }
        match std::env::var("COORDINATOR_AUTH_TOKEN") {
            Ok(token) => Some(token),
            Err(_) => {
                warn!("protocol.auth_required is set but COORDINATOR_AUTH_TOKEN is unset; control channel will run unauthenticated");
                None
            }
        }
    }

    async fn register_self(&self) {
        if let Err(e) = self
            .ownership
            .register_process(&self.self_process_id, std::process::id(), ProcessRole::Coordinator)
            .await
        {
            warn!(error = %e, "failed to register coordinator process record");
        }
    }

    /// Runs the daemon to completion: control channel, background tickers,
    /// event relay, signal handling. Returns once a clean shutdown has
    /// finished draining and persisting state.
    pub async fn run(self: Arc<Self>, events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>) -> std::process::ExitCode {
        self.register_self().await;

        let registry = Arc::new(build_registry(Arc::clone(&self)));
        let socket_path = PathBuf::from(self.config_snapshot().protocol.socket_path);
        let server_config = ServerConfig { auth_token: self.auth_token() };
        let events_broadcast = self.events_broadcast.clone();

        let serve_task = tokio::spawn({
            let events_broadcast = events_broadcast.clone();
            async move {
                if let Err(e) = coordinator_protocol::serve(&socket_path, registry, server_config, events_broadcast).await {
                    error!(error = %e, "control channel server exited");
                }
            }
        });

        let relay_task = tokio::spawn(relay_events(events_rx, events_broadcast));

        self.spawn_tickers();

        wait_for_shutdown_signal(Arc::clone(&self)).await;

        info!("shutdown requested, draining in-flight work");
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(Duration::from_secs(5)).await;

        serve_task.abort();
        relay_task.abort();

        self.drain_own_ownership().await;

        let file = self.scheduler.snapshot_for_persistence();
        if let Err(e) = self.persistence.save(&file).await {
            error!(error = %e, "failed to persist scheduler state during shutdown");
        }

        info!("coordinator daemon stopped");
        std::process::ExitCode::SUCCESS
    }

    async fn drain_own_ownership(&self) {
        if let Err(e) = self.ownership.cleanup_process(&self.self_process_id).await {
            warn!(error = %e, "failed to clean up coordinator process record on shutdown");
        }
    }

    /// Same health check the `health.check` control-plane command runs,
    /// exposed for the diagnostics HTTP server's `/health` route so both
    /// surfaces agree on what "healthy" means.
    pub async fn health_snapshot_for_diagnostics(&self) -> serde_json::Value {
        match self.dispatch(coordinator_protocol::CommandName::HealthCheck, serde_json::Value::Null).await {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "healthy": false, "error": e.to_string() }),
        }
    }

    fn spawn_tickers(self: &Arc<Self>) {
        let config = self.config_snapshot();
        let shutdown_rx = self.shutdown_tx.subscribe();

        supervise("orphan-sweep", {
            let daemon = Arc::clone(self);
            let interval = Duration::from_secs(config.ownership.orphan_scan_interval_seconds);
            let shutdown_rx = shutdown_rx.clone();
            move || orphan_sweep_loop(Arc::clone(&daemon), interval, shutdown_rx.clone())
        });

        supervise("reallocation", {
            let daemon = Arc::clone(self);
            let interval = Duration::from_secs(config.resources.reallocation_interval_seconds);
            let shutdown_rx = shutdown_rx.clone();
            move || reallocation_loop(Arc::clone(&daemon), interval, shutdown_rx.clone())
        });

        supervise("deadlock-sweep", {
            let deadlock = Arc::clone(&self.deadlock);
            let interval = Duration::from_secs(config.ownership.deadlock_scan_interval_seconds);
            let shutdown_rx = shutdown_rx.clone();
            move || run_deadlock_sweep(Arc::clone(&deadlock), interval, shutdown_rx.clone())
        });

        supervise("self-heartbeat", {
            let daemon = Arc::clone(self);
            let interval = Duration::from_secs((config.ownership.heartbeat_ttl_seconds / 3).max(1));
            let shutdown_rx = shutdown_rx.clone();
            move || self_heartbeat_loop(Arc::clone(&daemon), interval, shutdown_rx.clone())
        });

        supervise("circuit-breaker-metrics", {
            let circuit_breakers = Arc::clone(&self.circuit_breakers);
            let shutdown_rx = shutdown_rx.clone();
            move || circuit_breaker_metrics_loop(Arc::clone(&circuit_breakers), shutdown_rx.clone())
        });

        supervise("scheduler-persistence", {
            let scheduler = Arc::clone(&self.scheduler);
            let manager = self.persistence.clone();
            let interval = Duration::from_secs(config.persistence.interval_seconds);
            let debounce = Duration::from_millis(config.scheduler.debounce_ms);
            let shutdown_rx = shutdown_rx.clone();
            move || run_persistence_loop(Arc::clone(&scheduler), manager.clone(), interval, debounce, shutdown_rx.clone())
        });
    }

    pub(crate) async fn reload_config(&self) -> Result<(), ConfigError> {
        let bundle = load_config(&self.config_dir)?;

        {
            let mut projects = self.projects.projects.lock().expect("project registry mutex poisoned");
            projects.clear();
            for project in bundle.projects {
                self.resources.set_quota(project.id.clone(), project.quota.clone());
                self.scheduler.set_share_weight(&project.id, project.share_weight);
                projects.insert(project.id.clone(), project);
            }
        }

        *self.config.write().expect("config lock poisoned") = bundle.system;
        let _ = self.events_tx.send(CoordinatorEvent::ConfigReloaded);
        info!("configuration reloaded");
        Ok(())
    }
}

/// Restarts `make()` after a 1s backoff if it ever panics, so a bug in one
/// ticker can't silently take the daemon dark (spec.md §4.6 "Startup
/// sequence" resiliency note). Normal (non-panicking) completion — which
/// every ticker here only does once `shutdown` flips true — ends the
/// supervisor without restarting.
fn supervise<F, Fut>(name: &'static str, mut make: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(make());
            match handle.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(ticker = name, "background ticker panicked, restarting in 1s");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(_) => break,
            }
        }
    });
}

async fn orphan_sweep_loop(daemon: Arc<Daemon>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match daemon.ownership.scan_orphans().await {
                    Ok(orphans) => {
                        for orphan in orphans {
                            if let Some(task) = daemon.scheduler.find_processing_by_issue(&orphan.issue_id) {
                                daemon.resources.release(&orphan.owner);
                                let _ = daemon.scheduler.fail(
                                    task.id,
                                    format!("orphaned: owner {} unresponsive", orphan.owner),
                                );
                            }
                            let _ = daemon.events_tx.send(CoordinatorEvent::OrphanRepaired {
                                issue_id: orphan.issue_id,
                                reason: "heartbeat expired".into(),
                                original_pid: orphan.original_pid,
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, "orphan sweep failed"),
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

async fn reallocation_loop(daemon: Arc<Daemon>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let throughput: HashMap<ProjectId, f64> = daemon
                    .scheduler
                    .stats()
                    .into_iter()
                    .map(|(project_id, stats)| (project_id, stats.completed as f64))
                    .collect();
                daemon.resources.reallocate(&throughput);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn self_heartbeat_loop(daemon: Arc<Daemon>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = daemon.ownership.heartbeat(&daemon.self_process_id).await {
                    warn!(error = %e, "coordinator self-heartbeat failed");
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

async fn circuit_breaker_metrics_loop(
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => circuit_breakers.report_metrics(),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Bridges internal `CoordinatorEvent`s onto the protocol's broadcast
/// channel as wire `Message::Event`s (spec.md §6 "Events"). The daemon is
/// the only thing that knows both vocabularies; C2/C3/C4 never import
/// `coordinator_protocol` themselves.
async fn relay_events(mut events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>, broadcast_tx: broadcast::Sender<Message>) {
    while let Some(event) = events_rx.recv().await {
        let message = Message::event(event.name().as_str(), event.data());
        let _ = broadcast_tx.send(message);
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(daemon: Arc<Daemon>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                return;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                if let Err(e) = daemon.reload_config().await {
                    error!(error = %e, "configuration reload failed, continuing with previous configuration");
                }
            }
        }
    }
}

#[cfg(windows)]
async fn wait_for_shutdown_signal(_daemon: Arc<Daemon>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
