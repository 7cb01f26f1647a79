//! Three-state circuit breaker guarding store calls (spec.md §4.5).
//!
//! State is held behind an `arc_swap::ArcSwap` for lock-free reads on the hot
//! path, the same pattern the teacher uses for its own swappable,
//! infrequently-mutated shared state. Transitions go through a small mutex so
//! concurrent failures don't race each other into double-opening the breaker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::config::CircuitBreakerConfig;

/// Public breaker state, as observed by callers and emitted in metric events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while a half-open probe is in flight, so concurrent callers don't
    /// all issue probes at once.
    probe_in_flight: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Whether a call may proceed, and what to do with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call is allowed through as an ordinary closed-state call.
    Allowed,
    /// Call is allowed through as the single half-open probe.
    Probe,
    /// Call is short-circuited; the breaker is open.
    ShortCircuited,
}

/// Guards calls to a single store. Shared (process-wide) and internally
/// synchronized, per spec.md §5 "Shared resources".
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: ArcSwap<Inner>,
    transition_lock: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: ArcSwap::from_pointee(Inner::default()),
            transition_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.load().state
    }

    /// Disabled breaker: every call is allowed, no state is tracked.
    pub fn disabled() -> Self {
        Self::new(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: u32::MAX,
            reset_timeout: Duration::from_secs(0),
        })
    }

    /// Call this before issuing a store call.
    pub fn admit(&self) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }
        let snapshot = self.state.load();
        match snapshot.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => {
                if snapshot.probe_in_flight {
                    Admission::ShortCircuited
                } else {
                    let _guard = self.transition_lock.lock().unwrap_or_else(|e| e.into_inner());
                    let current = self.state.load();
                    if current.state == BreakerState::HalfOpen && !current.probe_in_flight {
                        let mut next = *current.as_ref();
                        next.probe_in_flight = true;
                        self.state.store(std::sync::Arc::new(next));
                        Admission::Probe
                    } else {
                        Admission::ShortCircuited
                    }
                }
            }
            BreakerState::Open => {
                let elapsed = snapshot
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    let _guard = self.transition_lock.lock().unwrap_or_else(|e| e.into_inner());
                    let current = self.state.load();
                    if current.state == BreakerState::Open {
                        self.state.store(std::sync::Arc::new(Inner {
                            state: BreakerState::HalfOpen,
                            consecutive_failures: current.consecutive_failures,
                            opened_at: current.opened_at,
                            probe_in_flight: true,
                        }));
                        tracing::info!(from = %BreakerState::Open, to = %BreakerState::HalfOpen, "circuit breaker transition");
                        Admission::Probe
                    } else {
                        self.admit()
                    }
                } else {
                    Admission::ShortCircuited
                }
            }
        }
    }

    /// Records the outcome of a call that was admitted (`Allowed` or `Probe`).
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let _guard = self.transition_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.state.load();
        match current.state {
            BreakerState::Closed => {
                if current.consecutive_failures != 0 {
                    self.state.store(std::sync::Arc::new(Inner::default()));
                }
            }
            BreakerState::HalfOpen => {
                tracing::info!(from = %BreakerState::HalfOpen, to = %BreakerState::Closed, "circuit breaker transition");
                self.state.store(std::sync::Arc::new(Inner::default()));
            }
            BreakerState::Open => {}
        }
    }

    /// Records the outcome of a failed call.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let _guard = self.transition_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.state.load();
        match current.state {
            BreakerState::Closed => {
                let failures = current.consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::info!(from = %BreakerState::Closed, to = %BreakerState::Open, failures, "circuit breaker transition");
                    self.state.store(std::sync::Arc::new(Inner {
                        state: BreakerState::Open,
                        consecutive_failures: failures,
                        opened_at: Some(Instant::now()),
                        probe_in_flight: false,
                    }));
                } else {
                    self.state.store(std::sync::Arc::new(Inner {
                        consecutive_failures: failures,
                        ..*current.as_ref()
                    }));
                }
            }
            BreakerState::HalfOpen => {
                tracing::info!(from = %BreakerState::HalfOpen, to = %BreakerState::Open, "circuit breaker transition");
                self.state.store(std::sync::Arc::new(Inner {
                    state: BreakerState::Open,
                    consecutive_failures: current.consecutive_failures + 1,
                    opened_at: Some(Instant::now()),
                    probe_in_flight: false,
                }));
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            reset_timeout: reset,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(30));
        for _ in 0..2 {
            assert_eq!(breaker.admit(), Admission::Allowed);
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.admit(), Admission::ShortCircuited);
    }

    #[test]
    fn half_opens_after_reset_timeout_and_closes_on_probe_success() {
        let breaker = breaker(1, Duration::from_millis(10));
        assert_eq!(breaker.admit(), Admission::Allowed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.admit(), Admission::ShortCircuited);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(10));
        assert_eq!(breaker.admit(), Admission::Allowed);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_count_in_closed_state() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn disabled_breaker_never_short_circuits() {
        let breaker = CircuitBreaker::disabled();
        for _ in 0..10 {
            assert_eq!(breaker.admit(), Admission::Allowed);
            breaker.record_failure();
        }
    }
}
