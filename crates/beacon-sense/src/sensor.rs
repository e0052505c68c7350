use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_proto::{PermissionState, RawSample};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// Terminal until the user re-grants access.
    #[error("position permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("position read timed out")]
    Timeout,
    /// Terminal: no position sensor on this device.
    #[error("position sensing unsupported on this device")]
    Unsupported,
}

impl SensorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SensorError::Unavailable(_) | SensorError::Timeout)
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub high_accuracy: bool,
    /// Per-read timeout; a miss is reported as SensorError::Timeout.
    pub timeout: Duration,
    /// Samples older than this are stale and dropped by backends that cache.
    pub max_sample_age: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(15),
            max_sample_age: Duration::from_secs(30),
        }
    }
}

pub type SensorEvent = Result<RawSample, SensorError>;

/// Host sensing API seam. Backends hold their own reader state; all methods
/// take `&self` so a backend can sit behind an `Arc` shared with the watch task.
#[async_trait]
pub trait SensorBackend: Send + Sync {
    /// Block until the next position sample is available. The watch loop
    /// wraps this with the configured timeout, so backends do not need
    /// their own deadline handling.
    async fn next_sample(&self, cfg: &WatchConfig) -> Result<RawSample, SensorError>;

    /// One probe read mapped to a permission state. The default probe treats
    /// a successful read as granted and a denial as denied; backends that
    /// model an OS prompt override this.
    async fn probe(&self, cfg: &WatchConfig) -> Result<PermissionState, SensorError> {
        match self.next_sample(cfg).await {
            Ok(_) => Ok(PermissionState::Granted),
            Err(SensorError::PermissionDenied) => Ok(PermissionState::Denied),
            Err(e) => Err(e),
        }
    }
}

struct WatchHandle {
    task: JoinHandle<()>,
}

/// Continuous-position-watch lifecycle over a [`SensorBackend`].
///
/// Owns at most one live watch handle; starting a new watch tears down the
/// previous one first.
pub struct PositionSensor {
    backend: Arc<dyn SensorBackend>,
    watch: Option<WatchHandle>,
    permission: PermissionState,
}

impl PositionSensor {
    pub fn new(backend: Arc<dyn SensorBackend>) -> Self {
        Self {
            backend,
            watch: None,
            permission: PermissionState::Unknown,
        }
    }

    pub fn permission(&self) -> PermissionState {
        self.permission
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Attempts one probe read and records the resulting permission state.
    /// May trigger the platform permission prompt, once per call.
    pub async fn request_permission(
        &mut self,
        cfg: &WatchConfig,
    ) -> Result<PermissionState, SensorError> {
        let state = match tokio::time::timeout(cfg.timeout, self.backend.probe(cfg)).await {
            Ok(res) => res?,
            Err(_) => return Err(SensorError::Timeout),
        };
        debug!("sensor: permission probe -> {:?}", state);
        self.permission = state;
        Ok(state)
    }

    /// Single-shot read, distinct from continuous watching.
    pub async fn current_position(&self, cfg: &WatchConfig) -> Result<RawSample, SensorError> {
        match tokio::time::timeout(cfg.timeout, self.backend.next_sample(cfg)).await {
            Ok(res) => res,
            Err(_) => Err(SensorError::Timeout),
        }
    }

    /// Begins continuous sampling, replacing any previous watch. Samples and
    /// errors are emitted on the returned channel; the call itself does not
    /// block on the first sample.
    pub fn start_watching(&mut self, cfg: WatchConfig) -> mpsc::Receiver<SensorEvent> {
        self.stop_watching();

        let (tx, rx) = mpsc::channel(32);
        let backend = self.backend.clone();
        let task = tokio::spawn(async move {
            loop {
                let ev = match tokio::time::timeout(cfg.timeout, backend.next_sample(&cfg)).await {
                    Ok(res) => res,
                    Err(_) => Err(SensorError::Timeout),
                };
                // Terminal errors end the watch; the subscriber decides what
                // to do next (reconnect, surface, stop).
                let terminal = matches!(&ev, Err(e) if !e.is_retryable());
                let retryable = matches!(&ev, Err(e) if e.is_retryable());
                if tx.send(ev).await.is_err() {
                    break;
                }
                if terminal {
                    warn!("sensor: watch ended on terminal error");
                    break;
                }
                if retryable {
                    // A broken source can fail instantly; pace the retries.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });

        self.watch = Some(WatchHandle { task });
        rx
    }

    /// Cancels the active watch handle; no-op when not watching.
    pub fn stop_watching(&mut self) {
        if let Some(w) = self.watch.take() {
            w.task.abort();
            debug!("sensor: watch stopped");
        }
    }
}

impl Drop for PositionSensor {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
