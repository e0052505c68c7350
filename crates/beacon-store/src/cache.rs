//! Last-known-good location, kept under its own key so collaborators can
//! read it even while the device is offline and the queue is busy.

use beacon_proto::LocationRecord;
use tracing::warn;

use crate::{LocalStore, StoreError};

const LAST_LOCATION_KEY: &str = "last_location";

fn key_for(namespace: &str) -> String {
    format!("{}/{}", namespace, LAST_LOCATION_KEY)
}

pub async fn store_last_location(
    store: &dyn LocalStore,
    namespace: &str,
    record: &LocationRecord,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(record)?;
    store.set(&key_for(namespace), &bytes).await
}

/// Returns the cached record, or None when absent or unreadable. A corrupt
/// cache is logged and treated as absent; it is advisory state.
pub async fn load_last_location(
    store: &dyn LocalStore,
    namespace: &str,
) -> Result<Option<LocationRecord>, StoreError> {
    let Some(bytes) = store.get(&key_for(namespace)).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!("cache: discarding corrupt last_location for {}: {}", namespace, e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use beacon_proto::{GpsQuality, TrackingStatus};

    #[tokio::test]
    async fn round_trips_and_overwrites() {
        let store = MemStore::new();
        assert!(load_last_location(&store, "unit-1").await.unwrap().is_none());

        let mut rec = LocationRecord {
            lat: 51.5,
            lon: -0.12,
            accuracy_m: Some(12.0),
            sampled_at_ms: 10,
            status: TrackingStatus::Active,
            quality: GpsQuality::Good,
            signal_strength: 98,
            is_offline: false,
            recorded_at_ms: 11,
        };
        store_last_location(&store, "unit-1", &rec).await.unwrap();

        rec.lat = 51.6;
        rec.recorded_at_ms = 20;
        store_last_location(&store, "unit-1", &rec).await.unwrap();

        let loaded = load_last_location(&store, "unit-1").await.unwrap().unwrap();
        assert_eq!(loaded.lat, 51.6);
        assert_eq!(loaded.recorded_at_ms, 20);
    }

    #[tokio::test]
    async fn corrupt_cache_reads_as_absent() {
        let store = MemStore::new();
        store.set("unit-1/last_location", b"{bad").await.unwrap();
        assert!(load_last_location(&store, "unit-1").await.unwrap().is_none());
    }
}
