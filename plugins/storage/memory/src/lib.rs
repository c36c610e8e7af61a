use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tokio::sync::RwLock;

use courier_api::{BoxFuture, CourierError, ProcessedStore, WriteOutcome};

/// A committed record: "this message's effects are durable".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub id: String,
    pub payload: Vec<u8>,
    pub processed_at: SystemTime,
}

/// In-memory store of processed ids.
///
/// Insertion happens under the write lock, so concurrent callers with the same
/// id see exactly one `Inserted`. `set_offline` simulates an outage: every call
/// fails with an `Io` error until it is switched back.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ProcessedRecord>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<ProcessedRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn check_online(&self) -> Result<(), CourierError> {
        if self.is_offline() {
            return Err(CourierError::io("memory store is offline"));
        }
        Ok(())
    }
}

impl ProcessedStore for MemoryStore {
    fn ping(&self) -> BoxFuture<'_, Result<(), CourierError>> {
        Box::pin(async move { self.check_online() })
    }

    fn record_if_absent<'a>(
        &'a self,
        id: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<WriteOutcome, CourierError>> {
        Box::pin(async move {
            self.check_online()?;
            let mut records = self.records.write().await;
            match records.entry(id.to_string()) {
                Entry::Occupied(_) => Ok(WriteOutcome::AlreadyPresent),
                Entry::Vacant(slot) => {
                    slot.insert(ProcessedRecord {
                        id: id.to_string(),
                        payload: payload.to_vec(),
                        processed_at: SystemTime::now(),
                    });
                    Ok(WriteOutcome::Inserted)
                }
            }
        })
    }
}
