//! A small key-value store abstraction: two blobs (energy counters, CVL
//! configuration) that must survive a reboot, with loss of either falling
//! back to compile-time defaults rather than halting the core.
//!
//! `KvStore` is used as a trait object (`&dyn KvStore`) from [`crate::energy`]
//! so the energy-persistence task doesn't need to be generic over the
//! concrete store; its methods are async, so the trait is written with
//! `async_trait` — a plain `async fn` in a trait isn't object-safe on its
//! own, so dyn dispatch needs the boxed-future desugaring `async_trait`
//! provides.

use alloc::string::String;
use alloc::vec::Vec;
use async_trait::async_trait;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the stored bytes for `key`, or `None` if absent or unreadable.
    /// Never panics on corrupt data; corruption is the caller's problem to
    /// sanitize (see `EnergyCounters::sanitized`).
    async fn load(&self, key: &str) -> Option<Vec<u8>>;

    /// Overwrites the value for `key`. Must be atomic from a concurrent
    /// reader's point of view.
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), ()>;
}

/// An in-RAM store for the desktop/simulation wiring in `gateway-fw`. A real
/// board would back this with NVS or a LittleFS file instead.
pub struct InMemoryKvStore {
    entries: embassy_sync::mutex::Mutex<
        embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
        Vec<(String, Vec<u8>)>,
    >,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: embassy_sync::mutex::Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn load(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.entries.lock().await;
        guard.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    async fn store(&self, key: &str, data: &[u8]) -> Result<(), ()> {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.iter_mut().find(|(k, _)| k == key) {
            entry.1 = data.to_vec();
            return Ok(());
        }
        guard.push((String::from(key), data.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_value() {
        embassy_futures::block_on(async {
            let store = InMemoryKvStore::new();
            assert!(store.load("k").await.is_none());
            store.store("k", &[1, 2, 3]).await.unwrap();
            assert_eq!(store.load("k").await, Some(alloc::vec![1, 2, 3]));
        });
    }

    #[test]
    fn store_overwrites_existing_key() {
        embassy_futures::block_on(async {
            let store = InMemoryKvStore::new();
            store.store("k", &[1]).await.unwrap();
            store.store("k", &[2, 2]).await.unwrap();
            assert_eq!(store.load("k").await, Some(alloc::vec![2, 2]));
        });
    }
}
