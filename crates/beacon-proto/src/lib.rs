pub mod record;

pub use record::{
    now_ms, GpsQuality, LocationRecord, OfflineQueueEntry, PermissionState, RawSample,
    TrackingStatus,
};
