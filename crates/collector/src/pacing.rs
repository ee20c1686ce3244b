//! Process-wide pacing for portal queries.
//!
//! Every query goes through [`PacingController::run`]: it sleeps the current
//! delay, sends, and on an overload notice cools down and re-sends the same
//! query until the retry ceiling is reached. Nothing else in the crate
//! retries.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::metrics;

/// Substrings the portal puts in a throttled response body.
pub const OVERLOAD_MARKERS: [&str; 2] = ["과부하제어", "60초"];

pub fn is_overload(body: &str) -> bool {
    OVERLOAD_MARKERS.iter().any(|marker| body.contains(marker))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub delay: Duration,
    pub cooldown: Duration,
    pub max_retries: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            cooldown: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    Normal,
    Overloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingSnapshot {
    pub mode: PacingMode,
    pub delay: Duration,
    pub consecutive_successes: u64,
    pub consecutive_overloads: u64,
    pub max_retries: u32,
    pub total_overloads: u64,
    pub cooldowns_taken: u64,
}

#[derive(Debug)]
struct PacingState {
    mode: PacingMode,
    delay: Duration,
    consecutive_successes: u64,
    consecutive_overloads: u64,
    total_overloads: u64,
    cooldowns_taken: u64,
}

/// Raw reply handed back by a paced call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug)]
pub enum PacingError<E> {
    /// Still overloaded after `max_retries` cooldowns.
    Exhausted { attempts: u32 },
    Call(E),
}

#[derive(Clone)]
pub struct PacingController {
    inner: Arc<Mutex<PacingState>>,
    config: PacingConfig,
}

impl PacingController {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PacingState {
                mode: PacingMode::Normal,
                delay: config.delay,
                consecutive_successes: 0,
                consecutive_overloads: 0,
                total_overloads: 0,
                cooldowns_taken: 0,
            })),
            config,
        }
    }

    pub fn config(&self) -> PacingConfig {
        self.config
    }

    fn state(&self) -> MutexGuard<'_, PacingState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> PacingSnapshot {
        let state = self.state();
        PacingSnapshot {
            mode: state.mode,
            delay: state.delay,
            consecutive_successes: state.consecutive_successes,
            consecutive_overloads: state.consecutive_overloads,
            max_retries: self.config.max_retries,
            total_overloads: state.total_overloads,
            cooldowns_taken: state.cooldowns_taken,
        }
    }

    fn current_delay(&self) -> Duration {
        self.state().delay
    }

    /// Pre-call sleep. Also used by callers that pace without retrying.
    pub async fn pause(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn record_overload(&self) {
        let mut state = self.state();
        state.mode = PacingMode::Overloaded;
        state.consecutive_overloads += 1;
        state.consecutive_successes = 0;
        state.total_overloads += 1;
        metrics::observe_overload();
    }

    fn record_response(&self) {
        let mut state = self.state();
        state.mode = PacingMode::Normal;
        state.consecutive_successes += 1;
        state.consecutive_overloads = 0;
    }

    fn record_cooldown(&self) {
        self.state().cooldowns_taken += 1;
        metrics::observe_cooldown();
    }

    /// Runs `send` under pacing. `send` receives the retry count (0 for the
    /// first attempt) and must issue the identical query each time.
    ///
    /// Transport failures are returned as [`PacingError::Call`] without
    /// touching the counters. Only 200 replies are checked for overload
    /// markers; any other status goes straight back to the caller.
    pub async fn run<E, F, Fut>(&self, mut send: F) -> Result<RawResponse, PacingError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<RawResponse, E>>,
    {
        let mut retry = 0u32;
        loop {
            self.pause().await;
            let response = send(retry).await.map_err(PacingError::Call)?;

            if response.status != 200 || !is_overload(&response.body) {
                self.record_response();
                return Ok(response);
            }

            self.record_overload();
            if retry >= self.config.max_retries {
                tracing::warn!(attempts = retry + 1, "pacing.exhausted");
                return Err(PacingError::Exhausted {
                    attempts: retry + 1,
                });
            }

            tracing::warn!(
                retry = retry + 1,
                max_retries = self.config.max_retries,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "pacing.cooldown"
            );
            self.record_cooldown();
            tokio::time::sleep(self.config.cooldown).await;
            retry += 1;
        }
    }
}

impl Default for PacingController {
    fn default() -> Self {
        Self::new(PacingConfig::default())
    }
}
