//! Durable strict-FIFO queue of undelivered location records.
//!
//! Entries live under `<namespace>/queue/<seq>` with a zero-padded sequence
//! number, so lexical key order is arrival order and a restart resumes
//! exactly where the previous process stopped. An entry is removed only
//! after its delivery is confirmed (`ack_front`), never reordered.

use std::collections::VecDeque;
use std::sync::Arc;

use beacon_proto::{now_ms, LocationRecord, OfflineQueueEntry};
use tracing::{info, warn};

use crate::{LocalStore, StoreError};

const SEQ_WIDTH: usize = 12;

pub struct OfflineQueue {
    store: Arc<dyn LocalStore>,
    namespace: String,
    entries: VecDeque<OfflineQueueEntry>,
    next_seq: u64,
}

impl OfflineQueue {
    /// Opens the queue for one device namespace, reloading any entries a
    /// previous process left behind. Corrupt entries are logged and skipped
    /// rather than wedging the whole queue.
    pub async fn open(store: Arc<dyn LocalStore>, namespace: &str) -> Result<Self, StoreError> {
        let prefix = format!("{}/queue/", namespace);
        let keys = store.keys(&prefix).await?;

        let mut entries = VecDeque::new();
        let mut next_seq = 0u64;
        for key in keys {
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<OfflineQueueEntry>(&bytes) {
                Ok(entry) => {
                    next_seq = next_seq.max(entry.seq + 1);
                    entries.push_back(entry);
                }
                Err(e) => {
                    warn!("queue: skipping corrupt entry {}: {}", key, e);
                }
            }
        }
        if !entries.is_empty() {
            info!(
                "queue: reloaded {} undelivered record(s) for {}",
                entries.len(),
                namespace
            );
        }

        Ok(Self {
            store,
            namespace: namespace.to_string(),
            entries,
            next_seq,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front(&self) -> Option<&OfflineQueueEntry> {
        self.entries.front()
    }

    pub fn entries(&self) -> impl Iterator<Item = &OfflineQueueEntry> {
        self.entries.iter()
    }

    /// Appends a record. On a persistence failure the in-memory entry is
    /// kept so the session can still drain it; the caller gets the error to
    /// surface (durability is lost for that entry, not the record itself).
    pub async fn push(&mut self, record: LocationRecord) -> Result<(), StoreError> {
        let entry = OfflineQueueEntry {
            seq: self.next_seq,
            enqueued_at_ms: now_ms(),
            record,
        };
        self.next_seq += 1;
        let key = self.key_for(entry.seq);
        self.entries.push_back(entry.clone());

        let bytes = serde_json::to_vec(&entry)?;
        self.store.set(&key, &bytes).await
    }

    /// Removes the front entry after its delivery was confirmed.
    pub async fn ack_front(&mut self) -> Result<(), StoreError> {
        let Some(entry) = self.entries.pop_front() else {
            return Ok(());
        };
        let key = self.key_for(entry.seq);
        // A failed delete leaves the file for a duplicate replay after
        // restart; the sink contract is at-least-once, so that is safe.
        self.store.delete(&key).await
    }

    fn key_for(&self, seq: u64) -> String {
        format!("{}/queue/{:0width$}", self.namespace, seq, width = SEQ_WIDTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use beacon_proto::{GpsQuality, TrackingStatus};

    fn record(lat: f64) -> LocationRecord {
        LocationRecord {
            lat,
            lon: 0.0,
            accuracy_m: Some(20.0),
            sampled_at_ms: 1,
            status: TrackingStatus::Offline,
            quality: GpsQuality::Good,
            signal_strength: 96,
            is_offline: true,
            recorded_at_ms: 2,
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let store = Arc::new(MemStore::new());
        let mut q = OfflineQueue::open(store, "unit-1").await.unwrap();

        q.push(record(1.0)).await.unwrap();
        q.push(record(2.0)).await.unwrap();
        q.push(record(3.0)).await.unwrap();
        assert_eq!(q.len(), 3);

        assert_eq!(q.front().unwrap().record.lat, 1.0);
        q.ack_front().await.unwrap();
        assert_eq!(q.front().unwrap().record.lat, 2.0);
        q.ack_front().await.unwrap();
        assert_eq!(q.front().unwrap().record.lat, 3.0);
        q.ack_front().await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn reopen_resumes_with_pending_entries_and_fresh_seq() {
        let store = Arc::new(MemStore::new());
        {
            let mut q = OfflineQueue::open(store.clone(), "unit-1").await.unwrap();
            q.push(record(1.0)).await.unwrap();
            q.push(record(2.0)).await.unwrap();
            q.ack_front().await.unwrap();
        }

        let mut q = OfflineQueue::open(store.clone(), "unit-1").await.unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.front().unwrap().record.lat, 2.0);

        // New pushes sort after the survivor.
        q.push(record(3.0)).await.unwrap();
        let keys = store.keys("unit-1/queue/").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0] < keys[1]);
    }

    #[tokio::test]
    async fn namespaces_do_not_leak_into_each_other() {
        let store = Arc::new(MemStore::new());
        let mut a = OfflineQueue::open(store.clone(), "unit-a").await.unwrap();
        a.push(record(1.0)).await.unwrap();

        let b = OfflineQueue::open(store, "unit-b").await.unwrap();
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn corrupt_entry_is_skipped_not_fatal() {
        let store = Arc::new(MemStore::new());
        {
            let mut q = OfflineQueue::open(store.clone(), "unit-1").await.unwrap();
            q.push(record(1.0)).await.unwrap();
        }
        store
            .set("unit-1/queue/000000000099", b"not json")
            .await
            .unwrap();

        let q = OfflineQueue::open(store, "unit-1").await.unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.front().unwrap().record.lat, 1.0);
    }
}
