//! Exponential-backoff reconnection scheduler for pairlink.
//!
//! [`ReconnectScheduler::run`] drives an attempt callback until it
//! succeeds, fails permanently, runs out of attempts, or is cancelled.
//! Between attempts it sleeps for a delay that starts at
//! `initial_delay` and is multiplied after every failure, capped at
//! `max_delay`. With the defaults the waits are `1, 2, 4, 8, 16, 30, 30, …`
//! seconds and the run gives up after 10 consecutive failures.
//!
//! Progress is observable two ways: the current [`ReconnectState`] through
//! a `watch` channel, and every transition as a [`ReconnectEvent`] on a
//! `broadcast` channel.
//!
//! # Integration
//!
//! ```ignore
//! let outcome = scheduler
//!     .run(None, |attempt| async move {
//!         connect().await.map_err(AttemptError::Transient)
//!     })
//!     .await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Full configuration for the reconnection scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Wait before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Consecutive failures after which the run is exhausted.
    pub max_attempts: u32,
    /// Random extra wait (0..=jitter) added to every delay. Zero by default
    /// so waits are exact.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffConfig {
    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`ReconnectScheduler::new`]. Rules:
    /// - `multiplier` below 1.0 (or not finite) is reset to 2.0.
    /// - `max_delay` is raised to at least `initial_delay`.
    /// - `max_attempts` of 0 becomes 1.
    pub fn validated(mut self) -> Self {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            warn!(multiplier = self.multiplier, "backoff multiplier below 1.0, using 2.0");
            self.multiplier = 2.0;
        }
        if self.max_delay < self.initial_delay {
            warn!(
                max_ms = self.max_delay.as_millis() as u64,
                initial_ms = self.initial_delay.as_millis() as u64,
                "max_delay below initial_delay, raising it"
            );
            self.max_delay = self.initial_delay;
        }
        if self.max_attempts == 0 {
            warn!("max_attempts of 0 would never try, using 1");
            self.max_attempts = 1;
        }
        self
    }

    /// The delay that follows `current` after one more failure.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

/// What the scheduler is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectState {
    /// Not running.
    #[default]
    Idle,
    /// Sleeping before the next attempt.
    Waiting,
    /// An attempt is in flight.
    Attempting,
}

/// A transition reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// About to sleep `delay` before attempt number `attempt` (1-based).
    Waiting {
        /// How long the scheduler will sleep.
        delay: Duration,
        /// The attempt that follows the sleep.
        attempt: u32,
    },
    /// Attempt number `attempt` has started.
    Attempting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The run stopped after `attempts` consecutive failures.
    Exhausted {
        /// How many attempts were made.
        attempts: u32,
    },
}

/// The outcome of one attempt, as reported by the callback.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Worth retrying after the next delay.
    Transient(E),
    /// Retrying cannot help; stop now.
    Permanent(E),
}

/// Why [`ReconnectScheduler::run`] stopped without a success.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// `max_attempts` consecutive attempts failed.
    #[error("gave up after {attempts} attempts")]
    Exhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: Option<E>,
    },

    /// [`ReconnectScheduler::cancel`] was called.
    #[error("reconnection cancelled")]
    Cancelled,

    /// An attempt reported a permanent failure.
    #[error("permanent failure: {0}")]
    Permanent(E),
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// A cloneable, one-shot cancellation flag.
///
/// Every clone observes the same flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancels the token, waking everything in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Retries an attempt callback with exponential backoff.
///
/// One scheduler per logical connection. It is cheap to share behind an
/// `Arc`; [`run`](Self::run) takes `&self`.
pub struct ReconnectScheduler {
    config: BackoffConfig,
    state: watch::Sender<ReconnectState>,
    events: broadcast::Sender<ReconnectEvent>,
    cancel: Mutex<CancelToken>,
    attempts: AtomicU32,
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl ReconnectScheduler {
    /// Creates a scheduler from config.
    pub fn new(config: BackoffConfig) -> Self {
        let config = config.validated();
        let (state, _) = watch::channel(ReconnectState::Idle);
        let (events, _) = broadcast::channel(64);
        debug!(
            initial_ms = config.initial_delay.as_millis() as u64,
            max_ms = config.max_delay.as_millis() as u64,
            multiplier = config.multiplier,
            max_attempts = config.max_attempts,
            "reconnect scheduler created"
        );
        Self {
            config,
            state,
            events,
            cancel: Mutex::new(CancelToken::new()),
            attempts: AtomicU32::new(0),
        }
    }

    /// The validated configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn watch_state(&self) -> watch::Receiver<ReconnectState> {
        self.state.subscribe()
    }

    /// Subscribes to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    /// Attempts made by the current (or last) run.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Stops the current run, if any, without emitting `Exhausted`.
    ///
    /// A pending wait or in-flight attempt is abandoned and `run` returns
    /// [`RetryError::Cancelled`]. Later runs are unaffected.
    pub fn cancel(&self) {
        let old = match self.cancel.lock() {
            Ok(mut token) => std::mem::take(&mut *token),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        old.cancel();
    }

    /// The token the next [`cancel()`](Self::cancel) will trip.
    ///
    /// Hand it to [`run_with_cancel()`](Self::run_with_cancel) to bind a
    /// run that starts later to cancellations issued before then.
    pub fn cancel_token(&self) -> CancelToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: ReconnectState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ReconnectEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Runs `attempt` until it succeeds.
    ///
    /// `attempt` receives the 1-based attempt number. `floor`, if given,
    /// raises the first wait to at least that long (a server's
    /// `retryAfter` hint). Success resets the attempt counter.
    ///
    /// The run is bound to the cancel token current when this is called,
    /// not when the returned future is first polled.
    pub fn run<T, E, F, Fut>(
        &self,
        floor: Option<Duration>,
        attempt: F,
    ) -> impl Future<Output = Result<T, RetryError<E>>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
    {
        let cancel = self.cancel_token();
        async move { self.run_with_cancel(&cancel, floor, attempt).await }
    }

    /// Like [`run()`](Self::run), but stops when `cancel` is tripped.
    ///
    /// A token that is already cancelled returns
    /// [`RetryError::Cancelled`] without making an attempt.
    pub async fn run_with_cancel<T, E, F, Fut>(
        &self,
        cancel: &CancelToken,
        floor: Option<Duration>,
        mut attempt: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
    {
        if cancel.is_cancelled() {
            debug!("reconnection cancelled before it started");
            return Err(RetryError::Cancelled);
        }
        let mut delay = self.config.initial_delay;
        let mut floor = floor;
        let mut last_error = None;
        self.attempts.store(0, Ordering::Relaxed);

        loop {
            let made = self.attempts.load(Ordering::Relaxed);
            if made >= self.config.max_attempts {
                warn!(attempts = made, "reconnection attempts exhausted");
                self.set_state(ReconnectState::Idle);
                self.emit(ReconnectEvent::Exhausted { attempts: made });
                return Err(RetryError::Exhausted {
                    attempts: made,
                    last_error,
                });
            }

            let wait = self.jittered(match floor.take() {
                Some(floor) => delay.max(floor),
                None => delay,
            });
            let next = made + 1;
            debug!(delay_ms = wait.as_millis() as u64, attempt = next, "waiting to reconnect");
            self.set_state(ReconnectState::Waiting);
            self.emit(ReconnectEvent::Waiting {
                delay: wait,
                attempt: next,
            });

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    debug!("reconnection cancelled while waiting");
                    self.set_state(ReconnectState::Idle);
                    return Err(RetryError::Cancelled);
                }
            }

            self.attempts.store(next, Ordering::Relaxed);
            self.set_state(ReconnectState::Attempting);
            self.emit(ReconnectEvent::Attempting { attempt: next });

            let result = tokio::select! {
                result = attempt(next) => result,
                _ = cancel.cancelled() => {
                    debug!(attempt = next, "reconnection cancelled mid-attempt");
                    self.set_state(ReconnectState::Idle);
                    return Err(RetryError::Cancelled);
                }
            };

            match result {
                Ok(value) => {
                    info!(attempt = next, "reconnected");
                    self.attempts.store(0, Ordering::Relaxed);
                    self.set_state(ReconnectState::Idle);
                    return Ok(value);
                }
                Err(AttemptError::Permanent(e)) => {
                    warn!(attempt = next, "permanent failure, not retrying");
                    self.set_state(ReconnectState::Idle);
                    return Err(RetryError::Permanent(e));
                }
                Err(AttemptError::Transient(e)) => {
                    last_error = Some(e);
                    delay = self.config.next_delay(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_delay, Duration::from_secs(30));
        assert_eq!(cfg.multiplier, 2.0);
        assert_eq!(cfg.max_attempts, 10);
    }

    #[test]
    fn test_validated_fixes_nonsense() {
        let cfg = BackoffConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            multiplier: 0.5,
            max_attempts: 0,
            jitter: Duration::ZERO,
        }
        .validated();
        assert_eq!(cfg.max_delay, Duration::from_secs(5));
        assert_eq!(cfg.multiplier, 2.0);
        assert_eq!(cfg.max_attempts, 1);
    }

    #[test]
    fn test_next_delay_doubles_and_caps() {
        let cfg = BackoffConfig::default();
        let seq: Vec<u64> = std::iter::successors(Some(cfg.initial_delay), |d| {
            Some(cfg.next_delay(*d))
        })
        .take(8)
        .map(|d| d.as_secs())
        .collect();
        assert_eq!(seq, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_cancel_token_clones_share_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        waiter.await.expect("waiter finishes");
    }
}
