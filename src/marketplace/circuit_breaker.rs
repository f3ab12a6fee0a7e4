//! Circuit breaker guarding marketplace API calls.
//!
//! ```text
//!   Closed ──(failures ≥ threshold)──► Open ──(open_duration elapsed)──► HalfOpen
//!     ▲                                 ▲                                   │
//!     └──────(successes ≥ threshold)────┼───────────────────────────────────┤
//!                                       └──────────(any failure)────────────┘
//! ```
//!
//! Only failures that say something about the upstream's health (transport
//! errors, timeouts, 5xx, 429) are recorded. A 404 for one order is not.
//!
//! State lives behind a `parking_lot::Mutex`; every transition is a few
//! field writes, so the lock is never held across an await.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing.
    pub success_threshold: u32,
    /// Time spent open before letting a probe through.
    pub open_duration: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_duration,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(5, 2, Duration::from_secs(30))
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    failures: u32,
    successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    times_opened: AtomicU32,
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                failures: 0,
                successes: 0,
            }),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Whether a call may proceed. Moves Open to HalfOpen once the open period is over.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_duration);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    metrics::set_circuit_breaker_state(CircuitState::HalfOpen.gauge_value());
                    info!("Marketplace circuit breaker half-open, probing");
                    true
                } else {
                    self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    metrics::record_circuit_breaker_rejection();
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(
                    successes = inner.successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker probe succeeded"
                );
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.failures = 0;
                    metrics::set_circuit_breaker_state(CircuitState::Closed.gauge_value());
                    info!("Marketplace circuit breaker closed");
                }
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                    warn!(
                        failures = inner.failures,
                        open_duration = ?self.config.open_duration,
                        "Marketplace circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut inner);
                warn!("Marketplace circuit breaker reopened after failed probe");
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.successes = 0;
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_open();
        metrics::set_circuit_breaker_state(CircuitState::Open.gauge_value());
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
