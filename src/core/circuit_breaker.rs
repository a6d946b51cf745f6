//! Per-instance circuit breaker.
//!
//! State checks are lock-free atomics; transitions use compare-and-swap so
//! concurrent callers observe a linearizable state machine. Half-open
//! admits exactly one trial call at a time: the trial token is claimed by
//! CAS and released with the call's outcome.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::info;

use crate::{config::CircuitBreakerConfig, observability::metrics::RouterMetrics};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests are allowed.
    Closed,
    /// Requests short-circuit without a network attempt.
    Open,
    /// One trial call probes whether the backend recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn to_int(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_int(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Time source for recovery-timeout checks, injectable so tests can drive
/// the breaker through its states without sleeping.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Monotonic wall clock measured from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, delta: Duration) {
        self.ms
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Admission token returned by [`CircuitBreaker::try_acquire`]. A `Trial`
/// permit is the single half-open probe; it must be released via
/// [`CircuitBreaker::release`] so the next caller can claim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    last_failure_ms: AtomicU64,
    last_transition_ms: AtomicU64,
    trial_in_flight: AtomicBool,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    label: String,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, label: impl Into<String>) -> Self {
        Self::with_clock(config, label, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        config: CircuitBreakerConfig,
        label: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let label = label.into();
        RouterMetrics::set_breaker_state(&label, STATE_CLOSED);
        let now = clock.now_ms();
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_transition_ms: AtomicU64::new(now),
            trial_in_flight: AtomicBool::new(false),
            config,
            clock,
            label,
        }
    }

    /// Current state; lazily moves Open → HalfOpen once the recovery
    /// timeout has elapsed. The CAS guarantees only one caller performs
    /// the transition.
    pub fn state(&self) -> CircuitState {
        let current = CircuitState::from_int(self.state.load(Ordering::Acquire));

        if current == CircuitState::Open {
            let elapsed = self
                .clock
                .now_ms()
                .saturating_sub(self.last_transition_ms.load(Ordering::Acquire));
            let timeout_ms = self.config.recovery_timeout_secs * 1000;

            if elapsed >= timeout_ms {
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.last_transition_ms
                        .store(self.clock.now_ms(), Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.consecutive_successes.store(0, Ordering::Release);
                    self.trial_in_flight.store(false, Ordering::Release);

                    info!(breaker = %self.label, "circuit breaker open -> half_open");
                    RouterMetrics::record_breaker_transition(&self.label, "open", "half_open");
                    RouterMetrics::set_breaker_state(&self.label, STATE_HALF_OPEN);
                    return CircuitState::HalfOpen;
                }
                return CircuitState::from_int(self.state.load(Ordering::Acquire));
            }
        }
        current
    }

    /// Try to admit a call. `None` means short-circuit with `CircuitOpen`:
    /// either the breaker is open, or it is half-open and another caller
    /// already holds the trial token.
    pub fn try_acquire(&self) -> Option<Permit> {
        match self.state() {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if self
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Some(Permit::Trial)
                } else {
                    None
                }
            }
        }
    }

    /// Record the outcome of an admitted call and return the trial token.
    pub fn release(&self, permit: Permit, success: bool) {
        if permit == Permit::Trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
        RouterMetrics::record_breaker_outcome(&self.label, success);
    }

    fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        if CircuitState::from_int(self.state.load(Ordering::Acquire)) == CircuitState::HalfOpen
            && successes >= self.config.success_threshold
        {
            self.transition_to(CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_ms
            .store(self.clock.now_ms(), Ordering::Release);

        match CircuitState::from_int(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Failed trial: re-open and restart the recovery timeout.
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old = CircuitState::from_int(self.state.swap(new_state.to_int(), Ordering::AcqRel));
        if old == new_state {
            return;
        }

        self.last_transition_ms
            .store(self.clock.now_ms(), Ordering::Release);
        match new_state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.consecutive_successes.store(0, Ordering::Release);
            }
            CircuitState::Open => {
                self.consecutive_successes.store(0, Ordering::Release);
            }
        }
        self.trial_in_flight.store(false, Ordering::Release);

        info!(
            breaker = %self.label,
            "circuit breaker {} -> {}",
            old.as_str(),
            new_state.as_str()
        );
        RouterMetrics::record_breaker_transition(&self.label, old.as_str(), new_state.as_str());
        RouterMetrics::set_breaker_state(&self.label, new_state.to_int());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    pub fn time_since_last_failure(&self) -> Option<Duration> {
        let last = self.last_failure_ms.load(Ordering::Acquire);
        if last == 0 {
            None
        } else {
            Some(Duration::from_millis(
                self.clock.now_ms().saturating_sub(last),
            ))
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            total_failures: self.total_failures(),
            total_successes: self.total_successes(),
            time_since_last_failure: self.time_since_last_failure(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub time_since_last_failure: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_with_clock(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cb = CircuitBreaker::with_clock(config, "test", clock.clone());
        (cb, clock)
    }

    fn fail_once(cb: &CircuitBreaker) {
        let permit = cb.try_acquire().expect("call should be admitted");
        cb.release(permit, false);
    }

    #[test]
    fn test_initial_state_closed() {
        let (cb, _) = breaker_with_clock(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire(), Some(Permit::Normal));
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let (cb, _) = breaker_with_clock(config);

        fail_once(&cb);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_once(&cb);

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(), None);
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
            ..Default::default()
        };
        let (cb, clock) = breaker_with_clock(config);

        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(59));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(), None);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 1,
            ..Default::default()
        };
        let (cb, clock) = breaker_with_clock(config);

        fail_once(&cb);
        clock.advance(Duration::from_secs(2));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire();
        assert_eq!(trial, Some(Permit::Trial));
        // Racing callers are rejected while the trial is in flight.
        assert_eq!(cb.try_acquire(), None);
        assert_eq!(cb.try_acquire(), None);

        cb.release(trial.unwrap(), true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire(), Some(Permit::Normal));
    }

    #[test]
    fn test_failed_trial_reopens_and_restarts_timeout() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 10,
            ..Default::default()
        };
        let (cb, clock) = breaker_with_clock(config);

        fail_once(&cb);
        clock.advance(Duration::from_secs(10));
        let trial = cb.try_acquire().unwrap();
        cb.release(trial, false);

        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::from_secs(9));
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_success_threshold_above_one() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            recovery_timeout_secs: 1,
        };
        let (cb, clock) = breaker_with_clock(config);

        fail_once(&cb);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire().unwrap();
        cb.release(trial, true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Token was released; a second trial closes the circuit.
        let trial = cb.try_acquire().unwrap();
        assert_eq!(trial, Permit::Trial);
        cb.release(trial, true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let (cb, _) = breaker_with_clock(config);

        fail_once(&cb);
        fail_once(&cb);
        let permit = cb.try_acquire().unwrap();
        cb.release(permit, true);

        fail_once(&cb);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_concurrent_trial_acquisition() {
        use std::thread;

        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 0,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::default());
        let cb = Arc::new(CircuitBreaker::with_clock(config, "race", clock.clone()));

        fail_once(&cb);
        clock.advance(Duration::from_millis(1));

        let mut handles = vec![];
        for _ in 0..16 {
            let cb = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                matches!(cb.try_acquire(), Some(Permit::Trial))
            }));
        }
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();

        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let (cb, _) = breaker_with_clock(config);

        let permit = cb.try_acquire().unwrap();
        cb.release(permit, true);
        fail_once(&cb);
        fail_once(&cb);

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.consecutive_failures, 2);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.total_successes, 1);
        assert!(stats.time_since_last_failure.is_some());
    }
}
