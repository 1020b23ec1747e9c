use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_HALF_OPEN_PROBES: usize = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
#[error("rpc circuit breaker is open")]
pub struct CircuitOpenError;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probes_in_flight: usize,
}

/// Stops hammering a node that keeps failing.
///
/// After `failure_threshold` consecutive failures the breaker opens and rejects
/// calls for `cooldown`; it then lets `half_open_probes` calls through and
/// closes again on the first success.
#[derive(Debug)]
pub struct RpcCircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: usize,
    cooldown: Duration,
    half_open_probes: usize,
}

impl Default for RpcCircuitBreaker {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_COOLDOWN,
            DEFAULT_HALF_OPEN_PROBES,
        )
    }
}

impl RpcCircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration, half_open_probes: usize) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown: cooldown.max(Duration::from_millis(1)),
            half_open_probes: half_open_probes.max(1),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// Admits a call, reserving a probe slot while half-open.
    pub fn before_request(&self) -> Result<CircuitState, CircuitOpenError> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map(|opened_at| opened_at.elapsed() >= self.cooldown)
                .unwrap_or(true);
            if !cooled {
                return Err(CircuitOpenError);
            }
            inner.probes_in_flight = 0;
            Self::move_to(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.probes_in_flight >= self.half_open_probes {
                return Err(CircuitOpenError);
            }
            inner.probes_in_flight += 1;
        }

        Ok(inner.state)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.opened_at = None;
            Self::move_to(&mut inner, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.opened_at = Some(Instant::now());
            inner.probes_in_flight = 0;
            Self::move_to(&mut inner, CircuitState::Open);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn move_to(inner: &mut BreakerInner, next: CircuitState) {
        if inner.state != next {
            tracing::warn!(
                previous = ?inner.state,
                next = ?next,
                consecutive_failures = inner.consecutive_failures,
                "rpc circuit breaker state changed"
            );
            inner.state = next;
        }
    }
}
