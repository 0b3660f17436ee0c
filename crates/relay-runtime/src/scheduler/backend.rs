//! Scheduler backend protocol and the default tokio-interval backend

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tick callback driven by a backend.
pub type TickFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Errors from backend lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler backend is already running")]
    AlreadyRunning,

    #[error("scheduler backend is not running")]
    NotRunning,
}

/// Health snapshot of a backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,

    /// Running but ticks are drifting past the expected cadence.
    pub degraded: bool,

    pub backend: String,
    pub tick_count: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Controls when ticks happen.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// Start ticking `tick` every `interval`. Fails when already running.
    async fn start(&self, tick: TickFn, interval: Duration) -> Result<(), SchedulerError>;

    /// Stop ticking.
    async fn stop(&self) -> Result<(), SchedulerError>;

    fn health(&self) -> BackendHealth;
}

/// Single-process backend on a tokio interval.
///
/// # Example
///
/// ```ignore
/// let backend = TokioSchedulerBackend::new();
/// backend.start(tick_fn, Duration::from_secs(1)).await?;
/// ```
pub struct TokioSchedulerBackend {
    tick_count: Arc<AtomicU64>,
    last_tick: Arc<RwLock<Option<DateTime<Utc>>>>,
    interval: RwLock<Option<Duration>>,
    stop_token: RwLock<Option<CancellationToken>>,
}

impl TokioSchedulerBackend {
    pub fn new() -> Self {
        Self {
            tick_count: Arc::new(AtomicU64::new(0)),
            last_tick: Arc::new(RwLock::new(None)),
            interval: RwLock::new(None),
            stop_token: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_token
            .read()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }
}

impl Default for TokioSchedulerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerBackend for TokioSchedulerBackend {
    async fn start(&self, tick: TickFn, interval: Duration) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.stop_token.write() = Some(token.clone());
        *self.interval.write() = Some(interval);

        let tick_count = Arc::clone(&self.tick_count);
        let last_tick = Arc::clone(&self.last_tick);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        tick_count.fetch_add(1, Ordering::SeqCst);
                        *last_tick.write() = Some(Utc::now());
                        tick().await;
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!("scheduler backend loop stopped");
        });

        info!(?interval, "scheduler backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SchedulerError> {
        let mut guard = self.stop_token.write();
        match guard.take() {
            Some(token) => {
                token.cancel();
                info!("scheduler backend stopped");
                Ok(())
            }
            None => Err(SchedulerError::NotRunning),
        }
    }

    fn health(&self) -> BackendHealth {
        let running = self.is_running();
        let last_tick = *self.last_tick.read();

        // Degraded when the last tick lags more than two intervals behind.
        let degraded = match (running, last_tick, *self.interval.read()) {
            (true, Some(last), Some(interval)) => {
                let lag = Utc::now().signed_duration_since(last);
                lag.to_std().unwrap_or(Duration::ZERO) > interval * 2
            }
            _ => false,
        };

        BackendHealth {
            healthy: running && !degraded,
            degraded,
            backend: "tokio_interval".to_string(),
            tick_count: self.tick_count(),
            last_tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_tick(counter: Arc<AtomicUsize>) -> TickFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_backend_ticks_and_stops() {
        let backend = TokioSchedulerBackend::new();
        let counter = Arc::new(AtomicUsize::new(0));

        backend
            .start(counting_tick(Arc::clone(&counter)), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(backend.is_running());

        tokio::time::sleep(Duration::from_millis(90)).await;
        backend.stop().await.unwrap();
        assert!(!backend.is_running());

        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected at least 2 ticks, got {ticks}");
        assert_eq!(backend.tick_count(), ticks as u64);

        // No further ticks after stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let backend = TokioSchedulerBackend::new();
        let counter = Arc::new(AtomicUsize::new(0));

        backend
            .start(counting_tick(Arc::clone(&counter)), Duration::from_secs(60))
            .await
            .unwrap();
        let result = backend
            .start(counting_tick(counter), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(SchedulerError::AlreadyRunning)));

        backend.stop().await.unwrap();
        assert!(matches!(
            backend.stop().await,
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_health_reflects_state() {
        let backend = TokioSchedulerBackend::new();
        let health = backend.health();
        assert!(!health.healthy);
        assert_eq!(health.backend, "tokio_interval");
        assert_eq!(health.tick_count, 0);

        let counter = Arc::new(AtomicUsize::new(0));
        backend
            .start(counting_tick(counter), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let health = backend.health();
        assert!(health.healthy);
        assert!(health.last_tick.is_some());
        assert!(health.tick_count > 0);

        backend.stop().await.unwrap();
    }
}
