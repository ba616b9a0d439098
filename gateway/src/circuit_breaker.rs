//! Per-function circuit breaker.
//!
//! CLOSED reads are lock-free; transitions go through the per-breaker mutex.
//! HALF_OPEN admits exactly one probe, concurrent callers keep seeing OPEN
//! until the probe resolves.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of consulting the breaker before an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// The caller is the HALF_OPEN probe; its outcome decides the next state.
    AllowProbe,
    Reject,
}

struct Transitions {
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    recovery_timeout: Duration,
    state_tag: AtomicU8,
    consecutive_failures: AtomicU32,
    transitions: Mutex<Transitions>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            threshold,
            recovery_timeout,
            state_tag: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            transitions: Mutex::new(Transitions {
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state_tag.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Decide whether an upstream call may proceed.
    pub fn check(&self) -> BreakerDecision {
        if self.state_tag.load(Ordering::Acquire) == STATE_CLOSED {
            return BreakerDecision::Allow;
        }

        let mut transitions = self.transitions.lock().unwrap();
        match self.state_tag.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerDecision::Allow,
            STATE_OPEN => {
                let recovered = transitions
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.recovery_timeout);
                if recovered {
                    self.state_tag.store(STATE_HALF_OPEN, Ordering::Release);
                    transitions.probe_in_flight = true;
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::Reject
                }
            }
            _ => {
                if transitions.probe_in_flight {
                    BreakerDecision::Reject
                } else {
                    transitions.probe_in_flight = true;
                    BreakerDecision::AllowProbe
                }
            }
        }
    }

    pub fn record_success(&self) {
        if self.state_tag.load(Ordering::Acquire) == STATE_CLOSED {
            self.consecutive_failures.store(0, Ordering::Release);
            return;
        }

        let mut transitions = self.transitions.lock().unwrap();
        if self.state_tag.load(Ordering::Acquire) == STATE_HALF_OPEN {
            self.state_tag.store(STATE_CLOSED, Ordering::Release);
            self.consecutive_failures.store(0, Ordering::Release);
            transitions.opened_at = None;
            transitions.probe_in_flight = false;
        }
    }

    /// The probe never reached the worker (pool timeout, provisioning
    /// failure). Clears the probe slot without judging the upstream.
    pub fn abort_probe(&self) {
        let mut transitions = self.transitions.lock().unwrap();
        if self.state_tag.load(Ordering::Acquire) == STATE_HALF_OPEN {
            transitions.probe_in_flight = false;
        }
    }

    pub fn record_failure(&self) {
        if self.state_tag.load(Ordering::Acquire) == STATE_CLOSED {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures < self.threshold {
                return;
            }
            let mut transitions = self.transitions.lock().unwrap();
            // Another racing failure may already have opened it.
            if self.state_tag.load(Ordering::Acquire) == STATE_CLOSED {
                self.state_tag.store(STATE_OPEN, Ordering::Release);
                transitions.opened_at = Some(Instant::now());
            }
            return;
        }

        let mut transitions = self.transitions.lock().unwrap();
        if self.state_tag.load(Ordering::Acquire) == STATE_HALF_OPEN {
            // Probe failed; back to OPEN with a fresh recovery window.
            self.state_tag.store(STATE_OPEN, Ordering::Release);
            transitions.opened_at = Some(Instant::now());
            transitions.probe_in_flight = false;
        }
    }
}

/// Per-function breakers, created on first use.
pub struct BreakerMap {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    threshold: u32,
    recovery_timeout: Duration,
}

impl BreakerMap {
    pub fn new(threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            threshold,
            recovery_timeout,
        }
    }

    pub fn breaker(&self, function_name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(function_name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.threshold, self.recovery_timeout))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.check(), BreakerDecision::Reject);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_single_probe_after_recovery() {
        time::pause();
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.check(), BreakerDecision::Reject);

        time::advance(Duration::from_secs(30)).await;

        // Exactly one caller becomes the probe; the rest stay rejected.
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.check(), BreakerDecision::Reject);
        assert_eq!(cb.check(), BreakerDecision::Reject);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        time::pause();
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.check(), BreakerDecision::Allow);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        time::pause();
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.check(), BreakerDecision::Reject);

        // A fresh recovery window applies from the probe failure.
        time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.check(), BreakerDecision::AllowProbe);
    }

    #[tokio::test]
    async fn test_breaker_map_is_per_function() {
        let map = BreakerMap::new(1, Duration::from_secs(30));
        map.breaker("a").record_failure();
        assert_eq!(map.breaker("a").state(), BreakerState::Open);
        assert_eq!(map.breaker("b").state(), BreakerState::Closed);
    }
}
