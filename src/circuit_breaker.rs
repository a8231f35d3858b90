// =============================================================================
// circuit_breaker.rs — NOTICE WHEN THE EXCHANGE IS DOWN
// =============================================================================
//
// A share-holding run fans out over ~400 company pages. If the exchange's
// web server falls over halfway through, the breaker notices: after N
// consecutive transport or 5xx failures it trips, logs it, and the run
// reports the trip in its metrics. Every unit still sends its own request
// and is judged by its own response. The breaker watches, it never blocks.
//
// After the cooldown an open breaker goes half-open, and enough successes
// close it again. A success that lands while it is still open counts as the
// first half-open success.
// =============================================================================

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Closed is healthy, Open means the exchange looks down, HalfOpen waits for
/// enough successes to close (or one failure to reopen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    total_trips: u64,
}

/// One breaker per source adapter, shared by all of that adapter's
/// concurrent unit fetches.
pub struct CircuitBreaker {
    name: String,
    inner: RwLock<CircuitBreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    /// # Arguments
    /// * `name` - Adapter name, for logs
    /// * `failure_threshold` - Consecutive failures before tripping
    /// * `reset_timeout` - How long to stay open
    /// * `success_threshold` - Half-open successes needed to close
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                total_trips: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Current state, moving an open breaker to half-open once its cooldown
    /// has elapsed. Callers consult it before a request; the answer is
    /// advisory and the request goes out either way.
    pub fn check(&self) -> CircuitState {
        let mut inner = self.inner.write();

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .opened_at
                .map_or(true, |opened| opened.elapsed() >= self.reset_timeout);

            if cooled_down {
                info!(
                    name = %self.name,
                    "Circuit breaker OPEN -> HALF_OPEN, watching for recovery"
                );
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            }
        }
        inner.state
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();

        if inner.state == CircuitState::Open {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    info!(
                        name = %self.name,
                        successes = inner.success_count,
                        "Circuit breaker HALF_OPEN -> CLOSED, exchange is answering again"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        name = %self.name,
                        failures = inner.failure_count,
                        cooldown_secs = self.reset_timeout.as_secs(),
                        "Circuit breaker TRIPPED, CLOSED -> OPEN"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.total_trips += 1;
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    name = %self.name,
                    "Failure in HALF_OPEN, back to OPEN"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.total_trips += 1;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_trips(&self) -> u64 {
        self.inner.read().total_trips
    }
}
