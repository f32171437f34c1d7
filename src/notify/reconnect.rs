// src/notify/reconnect.rs
// Consumer-edge reconnect policy. The browser client mirrors this logic;
// it lives here as an explicit state machine with an injected clock so the
// backoff schedule is testable without wall-clock timers.

use std::time::{Duration, Instant};

use crate::config::CONFIG;

use super::connection::ConnectionState;

/// Clock seam for deterministic timing in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config() -> Self {
        Self {
            base_delay: Duration::from_millis(CONFIG.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(CONFIG.reconnect_max_delay_ms),
            max_attempts: CONFIG.reconnect_max_attempts,
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based), or `None`
    /// once the attempt budget is spent. Doubles per attempt up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Why the transport closed, as seen by the consumer edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal closure code: the session ended on purpose.
    Normal,
    /// Anything else: network drop, server restart, timeout.
    Abnormal,
    /// Server signaled an authentication failure during the handshake.
    AuthFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// No reconnection; the handle is done.
    Stop,
    /// Try again after `delay` (i.e. at `at` on the injected clock).
    Retry { delay: Duration, at: Instant },
    /// Attempt budget spent; the handle is abandoned.
    Abandon,
    /// Auth failure: reconnection suppressed permanently.
    Suppressed,
}

pub struct ReconnectController<C: Clock> {
    policy: ReconnectPolicy,
    clock: C,
    attempt: u32,
    state: ConnectionState,
}

impl<C: Clock> ReconnectController<C> {
    pub fn new(policy: ReconnectPolicy, clock: C) -> Self {
        Self {
            policy,
            clock,
            attempt: 0,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Handshake completed: the counter resets so a later drop starts its
    /// backoff schedule from the beginning.
    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.state = ConnectionState::Open;
    }

    pub fn on_close(&mut self, reason: CloseReason) -> ReconnectDecision {
        match reason {
            CloseReason::Normal => {
                self.state = ConnectionState::Closed;
                ReconnectDecision::Stop
            }
            CloseReason::AuthFailure => {
                self.state = ConnectionState::AuthFailed;
                ReconnectDecision::Suppressed
            }
            CloseReason::Abnormal => {
                if self.state == ConnectionState::AuthFailed {
                    // Once auth-failed, always suppressed.
                    return ReconnectDecision::Suppressed;
                }
                match self.policy.delay_for(self.attempt) {
                    Some(delay) => {
                        self.attempt += 1;
                        self.state = ConnectionState::Connecting;
                        ReconnectDecision::Retry {
                            delay,
                            at: self.clock.now() + delay,
                        }
                    }
                    None => {
                        self.state = ConnectionState::Closed;
                        ReconnectDecision::Abandon
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(Instant);

    impl Clock for FixedClock {
        fn now(&self) -> Instant {
            self.0
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_delays_double_then_cap() {
        let p = policy();
        assert_eq!(p.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(p.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(2), Some(Duration::from_millis(400)));
        assert_eq!(p.delay_for(3), Some(Duration::from_millis(800)));
        assert_eq!(p.delay_for(4), Some(Duration::from_millis(800)));
        assert_eq!(p.delay_for(5), None);
    }

    #[test]
    fn test_normal_close_never_reconnects() {
        let mut ctrl = ReconnectController::new(policy(), FixedClock(Instant::now()));
        ctrl.on_connected();
        assert_eq!(ctrl.on_close(CloseReason::Normal), ReconnectDecision::Stop);
        assert_eq!(ctrl.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_abnormal_close_backs_off_then_abandons() {
        let mut ctrl = ReconnectController::new(policy(), FixedClock(Instant::now()));
        ctrl.on_connected();

        let mut last_delay = Duration::ZERO;
        for expected_attempt in 1..=5 {
            match ctrl.on_close(CloseReason::Abnormal) {
                ReconnectDecision::Retry { delay, .. } => {
                    assert!(delay >= last_delay, "delays must not shrink");
                    last_delay = delay;
                    assert_eq!(ctrl.attempt(), expected_attempt);
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        assert_eq!(
            ctrl.on_close(CloseReason::Abnormal),
            ReconnectDecision::Abandon
        );
        assert_eq!(ctrl.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_successful_connect_resets_backoff() {
        let mut ctrl = ReconnectController::new(policy(), FixedClock(Instant::now()));
        ctrl.on_connected();
        ctrl.on_close(CloseReason::Abnormal);
        ctrl.on_close(CloseReason::Abnormal);
        assert_eq!(ctrl.attempt(), 2);

        ctrl.on_connected();
        assert_eq!(ctrl.attempt(), 0);
        match ctrl.on_close(CloseReason::Abnormal) {
            ReconnectDecision::Retry { delay, .. } => {
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_failure_suppresses_permanently() {
        let mut ctrl = ReconnectController::new(policy(), FixedClock(Instant::now()));
        assert_eq!(
            ctrl.on_close(CloseReason::AuthFailure),
            ReconnectDecision::Suppressed
        );
        assert_eq!(ctrl.state(), ConnectionState::AuthFailed);
        // Even a later abnormal drop cannot revive it.
        assert_eq!(
            ctrl.on_close(CloseReason::Abnormal),
            ReconnectDecision::Suppressed
        );
    }
}
