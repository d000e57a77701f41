//! Call pacing and failure containment
//!
//! Two mechanisms guard the provider transport:
//! - `RpmLimiter`: sliding-window requests-per-minute cap; acquiring a
//!   slot suspends, it never errors.
//! - `CircuitBreaker`: Closed -> Open after consecutive failures; HalfOpen
//!   only via explicit redeploy, where a single probe decides.
//!
//! The decision-level `min_interval` is mission-time based and lives in
//! the commander's predicate, not here.

use crate::error::{EngineError, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Sliding-window requests-per-minute limiter.
#[derive(Debug)]
pub struct RpmLimiter {
    max_rpm: u32,
    window: VecDeque<Instant>,
}

impl RpmLimiter {
    pub fn new(max_rpm: u32) -> Self {
        Self {
            max_rpm: max_rpm.max(1),
            window: VecDeque::new(),
        }
    }

    fn evict(&mut self) {
        let now = Instant::now();
        while self
            .window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(60))
        {
            self.window.pop_front();
        }
    }

    pub fn current_rpm(&mut self) -> u32 {
        self.evict();
        self.window.len() as u32
    }

    /// Suspend until a slot is free inside the window, then take it.
    pub async fn acquire(&mut self) {
        loop {
            self.evict();
            if (self.window.len() as u32) < self.max_rpm {
                self.window.push_back(Instant::now());
                return;
            }
            // Sleep until the oldest request ages out of the window.
            let oldest = *self.window.front().expect("window is full");
            let wake = oldest + Duration::from_secs(60);
            let wait = wake.saturating_duration_since(Instant::now());
            sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    /// Explicit redeploy from Open; the next call is a probe
    HalfOpen,
    Open,
}

/// Failure containment for the provider path. Once Open, the breaker stays
/// Open until an explicit redeploy moves it to HalfOpen.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Gate an outbound call. Open means no network is touched.
    pub fn check(&self) -> Result<()> {
        match self.state {
            BreakerState::Open => Err(EngineError::BreakerOpen),
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                // Probe failed: straight back to Open.
                self.state = BreakerState::Open;
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Admin stop: open immediately regardless of counts.
    pub fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.consecutive_failures = self.consecutive_failures.max(self.threshold);
    }

    /// Explicit redeploy: allow one probe call.
    pub fn redeploy(&mut self) {
        if self.state == BreakerState::Open {
            self.state = BreakerState::HalfOpen;
        }
    }
}
