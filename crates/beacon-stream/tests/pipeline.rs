//! End-to-end streaming behavior with a scripted sensor, manual network,
//! recording sink, and in-memory store, all under paused tokio time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_proto::{now_ms, GpsQuality, LocationRecord, PermissionState, RawSample, TrackingStatus};
use beacon_sense::sensor::{SensorBackend, SensorError, WatchConfig};
use beacon_store::{LocalStore, MemStore};
use beacon_stream::{ManualMonitor, RemoteSink, StreamConfig, StreamError, StreamSession, WriteError};
use tokio::sync::mpsc;

type SensorEvent = Result<RawSample, SensorError>;

struct ChannelBackend {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SensorEvent>>,
    permission: PermissionState,
}

impl ChannelBackend {
    fn pipe(permission: PermissionState) -> (mpsc::UnboundedSender<SensorEvent>, Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Arc::new(Self {
                rx: tokio::sync::Mutex::new(rx),
                permission,
            }),
        )
    }
}

#[async_trait]
impl SensorBackend for ChannelBackend {
    async fn next_sample(&self, _cfg: &WatchConfig) -> Result<RawSample, SensorError> {
        match self.rx.lock().await.recv().await {
            Some(ev) => ev,
            None => std::future::pending().await,
        }
    }

    async fn probe(&self, _cfg: &WatchConfig) -> Result<PermissionState, SensorError> {
        Ok(self.permission)
    }
}

#[derive(Default)]
struct RecordingSink {
    written: Mutex<Vec<LocationRecord>>,
    /// Per-write outcome script; exhausted entries succeed.
    plan: Mutex<VecDeque<bool>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, outcomes: &[bool]) {
        self.plan.lock().unwrap().extend(outcomes.iter().copied());
    }

    fn records(&self) -> Vec<LocationRecord> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSink for RecordingSink {
    async fn write(&self, _device_id: &str, record: &LocationRecord) -> Result<(), WriteError> {
        let ok = self.plan.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            self.written.lock().unwrap().push(record.clone());
            Ok(())
        } else {
            Err(WriteError::Io(std::io::Error::other("scripted failure")))
        }
    }
}

fn sample(lat: f64, lon: f64, accuracy_m: f64) -> RawSample {
    RawSample {
        lat,
        lon,
        accuracy_m: Some(accuracy_m),
        heading_deg: None,
        speed_mps: None,
        sampled_at_ms: now_ms(),
    }
}

struct Rig {
    sensor_tx: mpsc::UnboundedSender<SensorEvent>,
    sink: Arc<RecordingSink>,
    network: Arc<ManualMonitor>,
    store: Arc<MemStore>,
    session: Option<StreamSession>,
}

fn rig(permission: PermissionState) -> Rig {
    let (sensor_tx, backend) = ChannelBackend::pipe(permission);
    let sink = RecordingSink::new();
    let network = Arc::new(ManualMonitor::new(true));
    let store = Arc::new(MemStore::new());
    let session = StreamSession::new(
        StreamConfig::new("unit-7"),
        backend,
        sink.clone(),
        network.clone(),
        store.clone(),
    );
    Rig {
        sensor_tx,
        sink,
        network,
        store,
        session: Some(session),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// Near/far helpers around a 50m gate: 0.00005 deg of latitude is ~5.5m,
// 0.001 deg is ~111m.
const BASE_LAT: f64 = 51.5000;
const BASE_LON: f64 = -0.1000;

#[tokio::test(start_paused = true)]
async fn first_sample_delivers_immediately() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;

    let recs = r.sink.records();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].status, TrackingStatus::Active);
    assert_eq!(recs[0].quality, GpsQuality::Good);
    assert!(!recs[0].is_offline);
    assert_eq!(handle.status().status, TrackingStatus::Active);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn below_threshold_samples_batch_and_newest_pending_wins() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;
    assert_eq!(r.sink.records().len(), 1);

    // Two below-threshold samples inside one window; only the second may
    // survive as the pending candidate.
    r.sensor_tx
        .send(Ok(sample(BASE_LAT + 0.00005, BASE_LON, 20.0)))
        .unwrap();
    settle().await;
    r.sensor_tx
        .send(Ok(sample(BASE_LAT + 0.00008, BASE_LON, 20.0)))
        .unwrap();
    settle().await;

    // Nothing delivered before the window elapses.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(r.sink.records().len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let recs = r.sink.records();
    assert_eq!(recs.len(), 2, "exactly one batched delivery per window");
    assert!((recs[1].lat - (BASE_LAT + 0.00008)).abs() < 1e-12);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn stationary_device_is_bounded_to_one_delivery_per_window() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;

    for i in 0..3 {
        r.sensor_tx
            .send(Ok(sample(BASE_LAT + 0.00001 * i as f64, BASE_LON, 20.0)))
            .unwrap();
        settle().await;
    }
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(r.sink.records().len(), 2);

    for i in 0..2 {
        r.sensor_tx
            .send(Ok(sample(BASE_LAT + 0.00002 * i as f64, BASE_LON, 20.0)))
            .unwrap();
        settle().await;
    }
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(r.sink.records().len(), 3);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn fast_movement_preempts_the_batch_timer() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;
    r.sensor_tx
        .send(Ok(sample(BASE_LAT + 0.00005, BASE_LON, 20.0)))
        .unwrap();
    settle().await;
    assert_eq!(r.sink.records().len(), 1, "near sample must wait");

    // Over the gate: delivered immediately, well before the window.
    r.sensor_tx
        .send(Ok(sample(BASE_LAT + 0.001, BASE_LON, 20.0)))
        .unwrap();
    settle().await;
    let recs = r.sink.records();
    assert_eq!(recs.len(), 2);
    assert!((recs[1].lat - (BASE_LAT + 0.001)).abs() < 1e-12);

    // The preempted pending candidate must not fire later.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(r.sink.records().len(), 2);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn offline_deliveries_enqueue_then_replay_in_fifo_order() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;
    assert_eq!(r.sink.records().len(), 1);

    r.network.set_online(false);
    settle().await;
    assert_eq!(handle.status().status, TrackingStatus::Offline);

    // Three over-the-gate samples, each a would-be immediate delivery.
    for i in 1..=3 {
        r.sensor_tx
            .send(Ok(sample(BASE_LAT + 0.001 * i as f64, BASE_LON, 20.0)))
            .unwrap();
        settle().await;
    }
    assert_eq!(r.sink.records().len(), 1, "offline records must not reach the sink");

    // Last known position stays readable while offline.
    let last = handle.status().last_known.unwrap();
    assert!((last.lat - (BASE_LAT + 0.003)).abs() < 1e-12);
    assert!(last.is_offline);

    r.network.set_online(true);
    settle().await;

    let recs = r.sink.records();
    assert_eq!(recs.len(), 4, "queue must fully drain");
    for (i, rec) in recs[1..].iter().enumerate() {
        assert!((rec.lat - (BASE_LAT + 0.001 * (i + 1) as f64)).abs() < 1e-12);
        assert_eq!(rec.status, TrackingStatus::Offline);
        assert!(rec.is_offline);
    }
    assert_eq!(handle.status().status, TrackingStatus::Active);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn failed_replay_stops_mid_drain_and_resumes_later() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.network.set_online(false);
    settle().await;
    for i in 1..=3 {
        r.sensor_tx
            .send(Ok(sample(BASE_LAT + 0.001 * i as f64, BASE_LON, 20.0)))
            .unwrap();
        settle().await;
    }

    // First replayed write succeeds, second fails, drain must stop there.
    r.sink.script(&[true, false]);
    r.network.set_online(true);
    settle().await;

    let recs = r.sink.records();
    assert_eq!(recs.len(), 1);
    assert!((recs[0].lat - (BASE_LAT + 0.001)).abs() < 1e-12);
    assert_eq!(handle.status().status, TrackingStatus::Offline);

    // Next transition drains the remainder, still in order, no skips.
    r.network.set_online(false);
    settle().await;
    r.network.set_online(true);
    settle().await;

    let recs = r.sink.records();
    assert_eq!(recs.len(), 3);
    assert!((recs[1].lat - (BASE_LAT + 0.002)).abs() < 1e-12);
    assert!((recs[2].lat - (BASE_LAT + 0.003)).abs() < 1e-12);
    assert_eq!(handle.status().status, TrackingStatus::Active);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_pending_batch_timer() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;
    r.sensor_tx
        .send(Ok(sample(BASE_LAT + 0.00005, BASE_LON, 20.0)))
        .unwrap();
    settle().await;

    handle.stop();
    handle.join().await;
    settle().await;

    // The immediate record plus the final inactive flush; the batched
    // candidate must never fire.
    let recs = r.sink.records();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].status, TrackingStatus::Inactive);
    assert!((recs[1].lat - BASE_LAT).abs() < 1e-12);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(r.sink.records().len(), 2, "no timer may fire after stop");
}

#[tokio::test(start_paused = true)]
async fn denied_permission_fails_start_synchronously() {
    let mut r = rig(PermissionState::Denied);
    let err = r.session.take().unwrap().start().await.unwrap_err();
    assert!(matches!(err, StreamError::PermissionDenied));
    assert!(r.sink.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retryable_sensor_error_reconnects_on_the_fixed_delay() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx
        .send(Err(SensorError::Unavailable("no fix".into())))
        .unwrap();
    settle().await;
    let st = handle.status();
    assert_eq!(st.status, TrackingStatus::Error);
    assert_eq!(st.quality, GpsQuality::Lost);
    assert_eq!(st.signal_strength, 0);
    assert!(st.last_error.is_some());

    // The fixed 10s retry re-probes permission and restarts the watch.
    tokio::time::sleep(Duration::from_secs(11)).await;
    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;

    assert_eq!(handle.status().status, TrackingStatus::Active);
    assert_eq!(r.sink.records().len(), 1);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn gps_loss_goes_offline_and_recovery_reactivates() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.sensor_tx.send(Ok(sample(BASE_LAT, BASE_LON, 20.0))).unwrap();
    settle().await;
    assert_eq!(handle.status().status, TrackingStatus::Active);

    // Accuracy over the 500m lost threshold.
    r.sensor_tx
        .send(Ok(sample(BASE_LAT, BASE_LON, 600.0)))
        .unwrap();
    settle().await;
    let st = handle.status();
    assert_eq!(st.status, TrackingStatus::Offline);
    assert_eq!(st.quality, GpsQuality::Lost);
    assert_eq!(st.signal_strength, 0);

    r.sensor_tx
        .send(Ok(sample(BASE_LAT, BASE_LON, 30.0)))
        .unwrap();
    settle().await;
    let st = handle.status();
    assert_eq!(st.status, TrackingStatus::Active);
    assert_eq!(st.quality, GpsQuality::Good);
    assert_eq!(st.signal_strength, 94);

    handle.stop();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn queue_persists_across_sessions_via_the_store() {
    let mut r = rig(PermissionState::Granted);
    let handle = r.session.take().unwrap().start().await.unwrap();

    r.network.set_online(false);
    settle().await;
    for i in 1..=2 {
        r.sensor_tx
            .send(Ok(sample(BASE_LAT + 0.001 * i as f64, BASE_LON, 20.0)))
            .unwrap();
        settle().await;
    }
    // Fail the best-effort final flush so nothing reaches the sink offline.
    r.sink.script(&[false]);
    handle.stop();
    handle.join().await;
    settle().await;
    assert!(r.sink.records().is_empty());

    // Same store, fresh session: the replayed queue drains on start.
    let (sensor_tx, backend) = ChannelBackend::pipe(PermissionState::Granted);
    let session = StreamSession::new(
        StreamConfig::new("unit-7"),
        backend,
        r.sink.clone(),
        Arc::new(ManualMonitor::new(true)),
        r.store.clone(),
    );
    let handle = session.start().await.unwrap();
    settle().await;

    let recs = r.sink.records();
    assert_eq!(recs.len(), 2);
    assert!((recs[0].lat - (BASE_LAT + 0.001)).abs() < 1e-12);
    assert!((recs[1].lat - (BASE_LAT + 0.002)).abs() < 1e-12);
    assert!(r
        .store
        .keys("unit-7/queue/")
        .await
        .unwrap()
        .is_empty());

    drop(sensor_tx);
    handle.stop();
    handle.join().await;
}
