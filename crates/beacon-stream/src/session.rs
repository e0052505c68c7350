//! The streaming batcher: one driver task that owns every handle of a
//! tracking session.
//!
//! All mutable session state (watch handle, pending batch candidate, batch
//! deadline, reconnect deadline, offline queue) lives inside the driver
//! task, so cancellation is structural: once the task consumes the stop
//! signal nothing can fire afterwards and mutate state.

use std::sync::Arc;
use std::time::Duration;

use beacon_proto::{
    now_ms, GpsQuality, LocationRecord, PermissionState, RawSample, TrackingStatus,
};
use beacon_sense::quality::{classify, QualityThresholds};
use beacon_sense::reconnect::{Reconnector, RetryState};
use beacon_sense::sensor::{PositionSensor, SensorBackend, SensorError, SensorEvent, WatchConfig};
use beacon_store::{cache, LocalStore, OfflineQueue, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::NetworkMonitor;
use crate::sink::RemoteSink;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The user refused sensor access; the caller may retry start() after
    /// prompting again.
    #[error("position permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub device_id: String,
    /// Distance gate: samples that moved at least this far since the last
    /// delivered sample are sent immediately.
    pub min_distance_m: f64,
    /// Batch window for below-threshold samples.
    pub batch_interval: Duration,
    /// Fixed delay between sensor reconnection attempts.
    pub reconnect_delay: Duration,
    pub thresholds: QualityThresholds,
    pub watch: WatchConfig,
}

impl StreamConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            min_distance_m: 50.0,
            batch_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(10),
            thresholds: QualityThresholds::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Observable session state for the UI/telemetry layer. Errors surface
/// here, never as panics; while offline the last known record stays
/// readable with its timestamp.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub status: TrackingStatus,
    pub quality: GpsQuality,
    pub signal_strength: u8,
    pub last_error: Option<String>,
    pub last_known: Option<LocationRecord>,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            status: TrackingStatus::Inactive,
            quality: GpsQuality::Unknown,
            signal_strength: 0,
            last_error: None,
            last_known: None,
        }
    }
}

pub struct StreamSession {
    cfg: StreamConfig,
    sensor: PositionSensor,
    sink: Arc<dyn RemoteSink>,
    network: Arc<dyn NetworkMonitor>,
    store: Arc<dyn LocalStore>,
}

/// Handle to a running session. Dropping it stops the session.
#[derive(Debug)]
pub struct StreamHandle {
    stop_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<StreamStatus>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn status(&self) -> StreamStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status_rx.clone()
    }

    /// Signals shutdown. Returns once the signal is issued; the final flush
    /// is best-effort and runs in the background.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Waits for the driver task to finish. Mostly useful in tests and on
    /// process exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl StreamSession {
    pub fn new(
        cfg: StreamConfig,
        backend: Arc<dyn SensorBackend>,
        sink: Arc<dyn RemoteSink>,
        network: Arc<dyn NetworkMonitor>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            cfg,
            sensor: PositionSensor::new(backend),
            sink,
            network,
            store,
        }
    }

    /// Resolves permission, opens the persisted queue, starts the watch and
    /// the driver task. Returns once the watch is registered; it does not
    /// wait for a first sample.
    pub async fn start(mut self) -> Result<StreamHandle, StreamError> {
        if self.sensor.permission() != PermissionState::Granted {
            let state = self.sensor.request_permission(&self.cfg.watch).await?;
            if state != PermissionState::Granted {
                return Err(StreamError::PermissionDenied);
            }
        }

        let queue = OfflineQueue::open(self.store.clone(), &self.cfg.device_id).await?;
        let last_known = match cache::load_last_location(self.store.as_ref(), &self.cfg.device_id).await
        {
            Ok(rec) => rec,
            Err(e) => {
                warn!("stream: cached location unreadable: {}", e);
                None
            }
        };

        let samples = self.sensor.start_watching(self.cfg.watch.clone());
        info!("stream: session started for {}", self.cfg.device_id);

        let (status_tx, status_rx) = watch::channel(StreamStatus {
            status: TrackingStatus::Active,
            last_known,
            ..StreamStatus::default()
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let reconnect_delay = self.cfg.reconnect_delay;
        let driver = Driver {
            cfg: self.cfg,
            sensor: self.sensor,
            sink: self.sink,
            network: self.network,
            store: self.store,
            queue,
            status_tx,
            last_delivered: None,
            pending: None,
            batch_deadline: None,
            reconnector: Reconnector::new(reconnect_delay),
            offline_net: false,
            offline_gps: false,
            watch_open: true,
        };
        let task = tokio::spawn(driver.run(samples, stop_rx));

        Ok(StreamHandle {
            stop_tx,
            status_rx,
            task,
        })
    }
}

struct PendingSample {
    sample: RawSample,
    quality: GpsQuality,
    strength: u8,
}

struct Driver {
    cfg: StreamConfig,
    sensor: PositionSensor,
    sink: Arc<dyn RemoteSink>,
    network: Arc<dyn NetworkMonitor>,
    store: Arc<dyn LocalStore>,
    queue: OfflineQueue,
    status_tx: watch::Sender<StreamStatus>,

    /// Coordinates of the last sample a record was created for.
    last_delivered: Option<(f64, f64)>,
    /// Most recent below-threshold sample awaiting the batch window.
    pending: Option<PendingSample>,
    batch_deadline: Option<Instant>,
    reconnector: Reconnector,
    /// Standing offline causes; Active resumes only when all are clear.
    offline_net: bool,
    offline_gps: bool,
    watch_open: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut samples: mpsc::Receiver<SensorEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut net_rx = self.network.subscribe();
        if !self.network.is_online() {
            self.offline_net = true;
            self.set_tracking(TrackingStatus::Offline);
        } else if !self.queue.is_empty() {
            // Records a previous run could not deliver.
            self.drain_queue().await;
        }

        loop {
            tokio::select! {
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                ev = samples.recv(), if self.watch_open => match ev {
                    Some(Ok(sample)) => self.on_sample(sample).await,
                    Some(Err(err)) => self.on_sensor_error(err).await,
                    None => {
                        // Watch task ended underneath us; treat like a
                        // retryable sensor outage.
                        self.watch_open = false;
                        self.on_sensor_error(SensorError::Unavailable("watch closed".into()))
                            .await;
                    }
                },
                res = net_rx.changed() => {
                    if res.is_ok() {
                        let online = *net_rx.borrow_and_update();
                        self.on_network(online).await;
                    }
                }
                _ = sleep_until_opt(self.batch_deadline), if self.batch_deadline.is_some() => {
                    self.batch_deadline = None;
                    if let Some(p) = self.pending.take() {
                        debug!("stream: batch window elapsed, delivering pending sample");
                        self.deliver(p.sample, p.quality, p.strength).await;
                    }
                }
                _ = sleep_until_opt(self.reconnector.deadline()), if self.reconnector.deadline().is_some() => {
                    if let Some(rx) = self.on_reconnect_fire().await {
                        samples = rx;
                        self.watch_open = true;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    // ---- input handlers ----

    async fn on_sample(&mut self, sample: RawSample) {
        let (quality, strength) = classify(Some(&sample), None, self.cfg.thresholds);
        self.status_tx.send_modify(|st| {
            st.quality = quality;
            st.signal_strength = strength;
        });

        match quality {
            GpsQuality::Lost => {
                if !self.offline_gps {
                    warn!("stream: gps lost (accuracy {:?}m)", sample.accuracy_m);
                    self.offline_gps = true;
                }
                if self.status() == TrackingStatus::Active {
                    self.set_tracking(TrackingStatus::Offline);
                }
                if self.reconnector.state() == RetryState::Idle {
                    self.reconnector.arm();
                }
            }
            GpsQuality::Good | GpsQuality::Weak => {
                if self.offline_gps {
                    info!("stream: gps recovered");
                    self.offline_gps = false;
                }
                self.reconnector.disarm();
                self.recompute_status();
            }
            GpsQuality::Unknown => {}
        }

        let distance = self
            .last_delivered
            .map(|(lat, lon)| haversine_m(lat, lon, sample.lat, sample.lon));
        match distance {
            // No prior delivered sample: always deliver.
            None => self.deliver(sample, quality, strength).await,
            Some(d) if d >= self.cfg.min_distance_m => {
                debug!("stream: moved {:.1}m, delivering immediately", d);
                self.deliver(sample, quality, strength).await;
            }
            Some(d) => {
                debug!("stream: moved {:.1}m (< {:.0}m), batching", d, self.cfg.min_distance_m);
                // Newest below-threshold sample wins the window.
                self.pending = Some(PendingSample {
                    sample,
                    quality,
                    strength,
                });
                if self.batch_deadline.is_none() {
                    self.batch_deadline = Some(Instant::now() + self.cfg.batch_interval);
                }
            }
        }
    }

    async fn on_sensor_error(&mut self, err: SensorError) {
        let (quality, strength) = classify(None, Some(&err), self.cfg.thresholds);
        let message = err.to_string();
        self.status_tx.send_modify(|st| {
            st.quality = quality;
            st.signal_strength = strength;
            st.last_error = Some(message.clone());
        });

        if err.is_retryable() {
            warn!("stream: sensor error: {}", message);
            self.set_tracking(TrackingStatus::Error);
            if self.reconnector.state() == RetryState::Idle {
                self.reconnector.arm();
            }
        } else {
            warn!("stream: terminal sensor error: {}", message);
            self.sensor.stop_watching();
            self.watch_open = false;
            self.reconnector.disarm();
            self.set_tracking(TrackingStatus::Error);
        }
    }

    async fn on_network(&mut self, online: bool) {
        if online {
            info!("stream: network restored");
            if !self.queue.is_empty() {
                self.drain_queue().await;
            } else {
                self.offline_net = false;
                self.recompute_status();
            }
        } else {
            warn!("stream: network lost");
            self.offline_net = true;
            if self.status() == TrackingStatus::Active {
                self.set_tracking(TrackingStatus::Offline);
            }
        }
    }

    /// Fired by the reconnection deadline: re-probe permission and restart
    /// the watch. Returns the new sample channel when the watch restarted.
    async fn on_reconnect_fire(&mut self) -> Option<mpsc::Receiver<SensorEvent>> {
        self.reconnector.take_deadline();
        info!("stream: reconnect attempt {}", self.reconnector.attempts());

        match self.sensor.request_permission(&self.cfg.watch).await {
            Ok(PermissionState::Granted) => {
                let rx = self.sensor.start_watching(self.cfg.watch.clone());
                self.reconnector.disarm();
                // Accuracy state is unknown until the fresh watch reports.
                self.offline_gps = false;
                self.recompute_status();
                info!("stream: watch restarted");
                Some(rx)
            }
            Ok(state) => {
                // Denied (or a prompt the user has not answered): give up
                // retrying; an explicit start() is required.
                warn!("stream: permission {:?} during reconnect, giving up", state);
                self.sensor.stop_watching();
                self.watch_open = false;
                self.reconnector.disarm();
                self.status_tx.send_modify(|st| {
                    st.last_error = Some(SensorError::PermissionDenied.to_string());
                });
                self.set_tracking(TrackingStatus::Error);
                None
            }
            Err(e) if e.is_retryable() => {
                warn!("stream: reconnect probe failed: {}", e);
                self.status_tx
                    .send_modify(|st| st.last_error = Some(e.to_string()));
                self.reconnector.arm();
                None
            }
            Err(e) => {
                warn!("stream: reconnect hit terminal error: {}", e);
                self.status_tx
                    .send_modify(|st| st.last_error = Some(e.to_string()));
                self.reconnector.disarm();
                self.set_tracking(TrackingStatus::Error);
                None
            }
        }
    }

    // ---- delivery ----

    /// Creates a record for the sample and gets it to the sink or the
    /// queue. The cached location is updated on every attempt, online or
    /// offline, so "last known position" is always available.
    async fn deliver(&mut self, sample: RawSample, quality: GpsQuality, strength: u8) {
        self.pending = None;
        self.batch_deadline = None;

        let online = self.network.is_online();
        // While anything is still queued, new records go to the back of the
        // queue even when online, or replays would arrive out of order.
        let must_queue = !online || !self.queue.is_empty();

        let record = LocationRecord {
            lat: sample.lat,
            lon: sample.lon,
            accuracy_m: sample.accuracy_m,
            sampled_at_ms: sample.sampled_at_ms,
            status: if must_queue {
                TrackingStatus::Offline
            } else {
                self.status()
            },
            quality,
            signal_strength: strength,
            is_offline: must_queue,
            recorded_at_ms: now_ms(),
        };

        if let Err(e) =
            cache::store_last_location(self.store.as_ref(), &self.cfg.device_id, &record).await
        {
            warn!("stream: cache write failed: {}", e);
            self.status_tx
                .send_modify(|st| st.last_error = Some(format!("cache: {}", e)));
        }
        self.status_tx
            .send_modify(|st| st.last_known = Some(record.clone()));
        self.last_delivered = Some((sample.lat, sample.lon));

        if must_queue {
            if let Err(e) = self.queue.push(record).await {
                // Entry remains in memory; only durability is lost.
                warn!("stream: queue persistence failed: {}", e);
                self.status_tx
                    .send_modify(|st| st.last_error = Some(format!("queue: {}", e)));
            }
            if !online {
                self.offline_net = true;
            }
            if self.status() == TrackingStatus::Active {
                self.set_tracking(TrackingStatus::Offline);
            }
            debug!("stream: queued record ({} pending)", self.queue.len());
            if online {
                self.drain_queue().await;
            }
        } else {
            match self.sink.write(&self.cfg.device_id, &record).await {
                Ok(()) => {
                    debug!("stream: delivered record");
                }
                Err(e) => {
                    warn!("stream: write failed, queueing: {}", e);
                    self.status_tx
                        .send_modify(|st| st.last_error = Some(e.to_string()));
                    if let Err(pe) = self.queue.push(record).await {
                        warn!("stream: queue persistence failed: {}", pe);
                        self.status_tx
                            .send_modify(|st| st.last_error = Some(format!("queue: {}", pe)));
                    }
                    self.offline_net = true;
                    self.set_tracking(TrackingStatus::Offline);
                }
            }
        }
    }

    /// Drains the queue strictly in FIFO order, one awaited write at a
    /// time. The first failure stops the drain; delivered entries stay
    /// removed, the remainder is untouched.
    async fn drain_queue(&mut self) -> bool {
        let total = self.queue.len();
        let mut sent = 0usize;
        while let Some(entry) = self.queue.front().cloned() {
            match self.sink.write(&self.cfg.device_id, &entry.record).await {
                Ok(()) => {
                    if let Err(e) = self.queue.ack_front().await {
                        // Entry was delivered; a lingering file means a
                        // duplicate replay after restart, which the sink
                        // contract tolerates.
                        warn!("stream: ack failed after replay: {}", e);
                        self.status_tx
                            .send_modify(|st| st.last_error = Some(format!("queue: {}", e)));
                    }
                    sent += 1;
                }
                Err(e) => {
                    warn!(
                        "stream: replay stopped at seq {} ({}/{} sent): {}",
                        entry.seq, sent, total, e
                    );
                    self.status_tx
                        .send_modify(|st| st.last_error = Some(e.to_string()));
                    self.offline_net = true;
                    if self.status() == TrackingStatus::Active {
                        self.set_tracking(TrackingStatus::Offline);
                    }
                    return false;
                }
            }
        }
        if sent > 0 {
            info!("stream: replayed {} queued record(s)", sent);
        }
        self.offline_net = false;
        self.recompute_status();
        true
    }

    // ---- state helpers ----

    fn status(&self) -> TrackingStatus {
        self.status_tx.borrow().status
    }

    fn set_tracking(&self, status: TrackingStatus) {
        self.status_tx.send_if_modified(|st| {
            if st.status != status {
                info!("stream: {:?} -> {:?}", st.status, status);
                st.status = status;
                true
            } else {
                false
            }
        });
    }

    /// Re-derives Active/Offline from the standing offline causes. Only
    /// meaningful while a watch is live.
    fn recompute_status(&self) {
        if !self.watch_open {
            return;
        }
        let next = if self.offline_net || self.offline_gps {
            TrackingStatus::Offline
        } else {
            TrackingStatus::Active
        };
        self.set_tracking(next);
    }

    // ---- shutdown ----

    async fn shutdown(mut self) {
        info!("stream: stopping session for {}", self.cfg.device_id);
        self.sensor.stop_watching();
        self.watch_open = false;
        self.pending = None;
        self.batch_deadline = None;
        self.reconnector.disarm();

        // One final best-effort record marking the session inactive. Not
        // awaited here: stop() promises cancellation, not the flush.
        if let Some(prev) = self.status_tx.borrow().last_known.clone() {
            let record = LocationRecord {
                status: TrackingStatus::Inactive,
                is_offline: false,
                recorded_at_ms: now_ms(),
                ..prev
            };
            let sink = self.sink.clone();
            let store = self.store.clone();
            let device_id = self.cfg.device_id.clone();
            tokio::spawn(async move {
                if let Err(e) = cache::store_last_location(store.as_ref(), &device_id, &record).await
                {
                    warn!("stream: final cache write failed: {}", e);
                }
                if let Err(e) = sink.write(&device_id, &record).await {
                    warn!("stream: final flush failed: {}", e);
                }
            });
        }

        self.set_tracking(TrackingStatus::Inactive);
    }
}

// ----- Geometry -----

pub(crate) fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r = 6_371_000.0_f64;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    r * c
}
