use serde::{Deserialize, Serialize};

/// Wall-clock epoch milliseconds.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Outcome of the last sensor permission probe. Never inferred; only set
/// by querying or attempting to access the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
    Unknown,
}

/// One raw position sample as produced by the sensor. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub lat: f64,
    pub lon: f64,
    /// Estimated horizontal accuracy in meters; absent when the source
    /// cannot estimate it.
    pub accuracy_m: Option<f64>,
    pub heading_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub sampled_at_ms: i64,
}

/// Discrete GPS quality tier derived from sample accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsQuality {
    Good,
    Weak,
    Lost,
    Unknown,
}

/// Session-level tracking state. Mutated only by the stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Inactive,
    Active,
    Error,
    Offline,
}

/// The unit persisted locally and transmitted to the remote sink.
/// Superseded records are new instances, never mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: Option<f64>,
    pub sampled_at_ms: i64,
    pub status: TrackingStatus,
    pub quality: GpsQuality,
    pub signal_strength: u8,
    /// True when the record was created while delivery was impossible.
    pub is_offline: bool,
    pub recorded_at_ms: i64,
}

/// A queued undelivered record. `seq` is assigned at enqueue time and is
/// strictly increasing, so seq order is arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub seq: u64,
    pub enqueued_at_ms: i64,
    pub record: LocationRecord,
}
