use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — all calls pass through.
    Closed,
    /// Breaker tripped — calls are rejected.
    Open,
    /// Cooldown elapsed — one probe call allowed.
    HalfOpen,
}

/// A circuit breaker that opens after consecutive failures exceed a threshold,
/// and closes again after a successful probe during half-open state.
pub struct CircuitBreaker {
    name: String,
    failure_count: AtomicU32,
    failure_threshold: u32,
    cooldown: Duration,
    /// Guards (state, last_failure_time). Uses std::sync::Mutex because
    /// this is never held across await.
    inner: Mutex<CircuitInner>,
}

struct CircuitInner {
    state: CircuitState,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, cooldown_seconds: u64) -> Self {
        Self {
            name: name.to_string(),
            failure_count: AtomicU32::new(0),
            failure_threshold,
            cooldown: Duration::from_secs(cooldown_seconds),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                last_failure: None,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last) = inner.last_failure {
                    if last.elapsed() >= self.cooldown {
                        inner.state = CircuitState::HalfOpen;
                        tracing::info!(circuit = %self.name, "circuit breaker transitioning to half-open");
                        true
                    } else {
                        false
                    }
                } else {
                    inner.state = CircuitState::Closed;
                    true
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();

        if inner.state != CircuitState::Closed {
            tracing::info!(circuit = %self.name, previous_state = ?inner.state, "circuit breaker closing after success");
            inner.state = CircuitState::Closed;
            metrics::counter!("coordinator.circuit_breaker.recoveries", "circuit" => self.name.clone())
                .increment(1);
        }
    }

    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock().unwrap();

        inner.last_failure = Some(Instant::now());

        if count >= self.failure_threshold && inner.state != CircuitState::Open {
            tracing::warn!(
                circuit = %self.name,
                failures = count,
                threshold = self.failure_threshold,
                "circuit breaker OPEN"
            );
            inner.state = CircuitState::Open;
            metrics::counter!("coordinator.circuit_breaker.trips", "circuit" => self.name.clone())
                .increment(1);
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of circuit breakers for the coordinator's external dependencies:
/// the shared-state store (C1) and the issue-tracker adapter (out-of-scope
/// collaborator, spec.md §1/§4.2). Surfaced through `daemon.status`'s
/// component-health field (SPEC_FULL.md §6 supplement).
pub struct CircuitBreakerRegistry {
    pub store: CircuitBreaker,
    pub issue_tracker: CircuitBreaker,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            store: CircuitBreaker::new("store", 5, 60),
            issue_tracker: CircuitBreaker::new("issue_tracker", 5, 60),
        }
    }

    /// Name of the first open hard-dependency circuit, if any.
    pub fn any_open(&self) -> Option<&str> {
        for cb in [&self.store, &self.issue_tracker] {
            if cb.current_state() == CircuitState::Open {
                return Some(cb.name());
            }
        }
        None
    }

    pub fn report_metrics(&self) {
        for cb in [&self.store, &self.issue_tracker] {
            let value = match cb.current_state() {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 0.5,
                CircuitState::Open => 1.0,
            };
            metrics::gauge!("coordinator.circuit_breaker.state", "circuit" => cb.name().to_string())
                .set(value);
        }
    }

    /// Snapshot for `daemon.status`/`health.check`: `(name, healthy)` pairs.
    pub fn health_snapshot(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("store", self.store.current_state() != CircuitState::Open),
            (
                "issue_tracker",
                self.issue_tracker.current_state() != CircuitState::Open,
            ),
        ]
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", 3, 60);
        assert_eq!(cb.current_state(), CircuitState::Closed);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn breaker_closes_after_success_in_half_open() {
        let cb = CircuitBreaker::new("test", 1, 0);
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(cb.allow()); // cooldown is zero, transitions to half-open
        cb.record_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }
}
