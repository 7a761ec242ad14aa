//! Periodic connection checking with edge-triggered callbacks.
//!
//! A checker owns a connection state `S` and a tester. Every tick hands the
//! current state to the tester, which answers success or failure together
//! with the next state. Health flips only after `trip_threshold` consecutive
//! results of the other kind, and callbacks fire on flips, never on every
//! tick.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_HEALTHY: u8 = 1;
const HEALTH_UNHEALTHY: u8 = 2;

/// Health of a checked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckerHealth {
    /// No check has flipped the state yet.
    #[default]
    Unknown,
    /// The last flip was to success.
    Healthy,
    /// The last flip was to failure.
    Unhealthy,
}

impl From<u8> for CheckerHealth {
    fn from(raw: u8) -> Self {
        match raw {
            HEALTH_HEALTHY => CheckerHealth::Healthy,
            HEALTH_UNHEALTHY => CheckerHealth::Unhealthy,
            _ => CheckerHealth::Unknown,
        }
    }
}

impl From<CheckerHealth> for u8 {
    fn from(health: CheckerHealth) -> Self {
        match health {
            CheckerHealth::Unknown => HEALTH_UNKNOWN,
            CheckerHealth::Healthy => HEALTH_HEALTHY,
            CheckerHealth::Unhealthy => HEALTH_UNHEALTHY,
        }
    }
}

/// Tests a connection described by `S`.
#[async_trait]
pub trait ConnectionTester<S>: Send + Sync {
    /// `Ok` on success, `Err` on failure; both carry the next state.
    async fn test_connection(&self, state: &S) -> std::result::Result<S, S>;
}

type Callback<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct Callbacks<S> {
    on_success: Option<Callback<S>>,
    on_failure: Option<Callback<S>>,
}

struct CheckerInner<S> {
    name: String,
    state: AsyncMutex<S>,
    tester: Arc<dyn ConnectionTester<S>>,
    trip_threshold: u32,
    health: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    callbacks: RwLock<Callbacks<S>>,
}

impl<S: Send + Sync> CheckerInner<S> {
    fn health(&self) -> CheckerHealth {
        CheckerHealth::from(self.health.load(Ordering::Acquire))
    }

    async fn tick(&self) -> CheckerHealth {
        // Holding the state lock for the whole check serializes ticks.
        let mut state = self.state.lock().await;
        let (succeeded, next) = match self.tester.test_connection(&*state).await {
            Ok(next) => (true, next),
            Err(next) => (false, next),
        };
        *state = next;

        let health = self.health();
        let threshold = self.trip_threshold.max(1);
        if succeeded {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            let flips = match health {
                CheckerHealth::Healthy => false,
                CheckerHealth::Unknown => true,
                CheckerHealth::Unhealthy => successes >= threshold,
            };
            if flips {
                self.health.store(CheckerHealth::Healthy.into(), Ordering::Release);
                tracing::info!(checker = %self.name, "connection healthy");
                let callback = self.callbacks.read().on_success.clone();
                if let Some(callback) = callback {
                    callback(&*state);
                }
                return CheckerHealth::Healthy;
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if health != CheckerHealth::Unhealthy && failures >= threshold {
                self.health.store(CheckerHealth::Unhealthy.into(), Ordering::Release);
                tracing::warn!(checker = %self.name, failures, "connection unhealthy");
                let callback = self.callbacks.read().on_failure.clone();
                if let Some(callback) = callback {
                    callback(&*state);
                }
                return CheckerHealth::Unhealthy;
            }
            tracing::debug!(checker = %self.name, failures, "connection check failed");
        }
        health
    }
}

/// Runs a [`ConnectionTester`] on a fixed period.
pub struct PeriodicConnectionChecker<S> {
    inner: Arc<CheckerInner<S>>,
    task: Mutex<Option<CancellationToken>>,
}

impl<S> std::fmt::Debug for PeriodicConnectionChecker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicConnectionChecker")
            .field("name", &self.inner.name)
            .field("trip_threshold", &self.inner.trip_threshold)
            .finish_non_exhaustive()
    }
}

impl<S: Clone + Send + Sync + 'static> PeriodicConnectionChecker<S> {
    /// Creates a stopped checker named `name` around `initial` state.
    pub fn new(
        name: impl Into<String>,
        initial: S,
        tester: Arc<dyn ConnectionTester<S>>,
        trip_threshold: u32,
    ) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                name: name.into(),
                state: AsyncMutex::new(initial),
                tester,
                trip_threshold,
                health: AtomicU8::new(HEALTH_UNKNOWN),
                consecutive_failures: AtomicU32::new(0),
                consecutive_successes: AtomicU32::new(0),
                callbacks: RwLock::new(Callbacks {
                    on_success: None,
                    on_failure: None,
                }),
            }),
            task: Mutex::new(None),
        }
    }

    /// Called with the new state when the connection becomes healthy.
    pub fn on_success(self, callback: impl Fn(&S) + Send + Sync + 'static) -> Self {
        self.inner.callbacks.write().on_success = Some(Arc::new(callback));
        self
    }

    /// Called with the new state when the connection becomes unhealthy.
    pub fn on_failure(self, callback: impl Fn(&S) + Send + Sync + 'static) -> Self {
        self.inner.callbacks.write().on_failure = Some(Arc::new(callback));
        self
    }

    /// Current health.
    pub fn health(&self) -> CheckerHealth {
        self.inner.health()
    }

    /// Copy of the current state. Waits for a running check to finish.
    pub async fn state(&self) -> S {
        self.inner.state.lock().await.clone()
    }

    /// Runs one check now.
    pub async fn tick(&self) -> CheckerHealth {
        self.inner.tick().await
    }

    /// Starts checking every `period` after `initial_delay`. A running
    /// schedule is replaced.
    pub fn start(&self, initial_delay: Duration, period: Duration) {
        self.dispose();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        inner.tick().await;
                    }
                }
            }
            tracing::debug!(checker = %inner.name, "connection checker stopped");
        });
        *self.task.lock() = Some(cancel);
    }

    /// True between `start` and `dispose`.
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stops the schedule. A check already running completes.
    pub fn dispose(&self) {
        if let Some(cancel) = self.task.lock().take() {
            cancel.cancel();
        }
    }
}

impl<S> Drop for PeriodicConnectionChecker<S> {
    fn drop(&mut self) {
        if let Some(cancel) = self.task.get_mut().take() {
            cancel.cancel();
        }
    }
}
