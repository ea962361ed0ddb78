//! Core C.1 — the in-process publish/subscribe fabric everything else talks
//! through. Multi-producer, multi-consumer: any task calls
//! [`EventBus::publish`]; a dedicated bus task is not required because
//! dispatch happens synchronously, inline with `publish`, under one short
//! critical section — a single registry mutex with O(subscribers) dispatch,
//! acceptable for the expected (<100) subscriber count.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};

use crate::cvl::CvlState;
use crate::error::GatewayError;
use crate::model::LiveData;

/// Upper bound on a diagnostic byte payload before it would have spilled
/// out of the pool and into the general allocator.
pub const POOL_SLOT_SIZE: usize = 512;

/// The observable event kinds, plus `SerialCommError` (the serial client's
/// failure-surfacing event) and `CanStatus` (the publisher's
/// heartbeat/transition publish). Payloads are typed fields directly on the
/// variant rather than opaque bytes behind a `void*` context, so a
/// subscriber never has to know the producer's internal layout to read one.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    BmsLiveData(LiveData),
    BmsRegisterUpdated { addr: u16, value: u16 },
    BmsOnline,
    BmsOffline,
    SerialCommError { error: GatewayError },
    CvlStateChanged { state: CvlState },
    CvlLimitsUpdated { cvl_v: f32, ccl_a: f32, dcl_a: f32 },
    CanPeerConnected,
    CanPeerDisconnected,
    CanBusError,
    CanFrameTransmitted { id: u16, dlc: u8 },
    CanStatus { peer_connected: bool, breaker_open: bool },
    EnergyPersisted,
    StorageHistoryReady,
    StorageHistoryUnavailable,
    OtaUploadReady,
    /// A diagnostic byte dump, sized against the payload pool rather than
    /// heap-allocated unconditionally.
    Diagnostic { tag: u16, payload: heapless::Vec<u8, POOL_SLOT_SIZE> },
}

bitflags::bitflags! {
    /// A subscriber's event filter. One bit per [`Event`] variant; `ALL`
    /// subscribes to everything.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFilter: u32 {
        const BMS_LIVE_DATA             = 1 << 0;
        const BMS_REGISTER_UPDATED      = 1 << 1;
        const BMS_ONLINE                = 1 << 2;
        const BMS_OFFLINE               = 1 << 3;
        const SERIAL_COMM_ERROR         = 1 << 4;
        const CVL_STATE_CHANGED         = 1 << 5;
        const CVL_LIMITS_UPDATED        = 1 << 6;
        const CAN_PEER_CONNECTED        = 1 << 7;
        const CAN_PEER_DISCONNECTED     = 1 << 8;
        const CAN_BUS_ERROR             = 1 << 9;
        const CAN_FRAME_TRANSMITTED     = 1 << 10;
        const CAN_STATUS                = 1 << 11;
        const ENERGY_PERSISTED          = 1 << 12;
        const STORAGE_HISTORY_READY     = 1 << 13;
        const STORAGE_HISTORY_UNAVAILABLE = 1 << 14;
        const OTA_UPLOAD_READY          = 1 << 15;
        const DIAGNOSTIC                = 1 << 16;
        const ALL = u32::MAX;
    }
}

impl Event {
    fn filter_bit(&self) -> EventFilter {
        match self {
            Event::BmsLiveData(_) => EventFilter::BMS_LIVE_DATA,
            Event::BmsRegisterUpdated { .. } => EventFilter::BMS_REGISTER_UPDATED,
            Event::BmsOnline => EventFilter::BMS_ONLINE,
            Event::BmsOffline => EventFilter::BMS_OFFLINE,
            Event::SerialCommError { .. } => EventFilter::SERIAL_COMM_ERROR,
            Event::CvlStateChanged { .. } => EventFilter::CVL_STATE_CHANGED,
            Event::CvlLimitsUpdated { .. } => EventFilter::CVL_LIMITS_UPDATED,
            Event::CanPeerConnected => EventFilter::CAN_PEER_CONNECTED,
            Event::CanPeerDisconnected => EventFilter::CAN_PEER_DISCONNECTED,
            Event::CanBusError => EventFilter::CAN_BUS_ERROR,
            Event::CanFrameTransmitted { .. } => EventFilter::CAN_FRAME_TRANSMITTED,
            Event::CanStatus { .. } => EventFilter::CAN_STATUS,
            Event::EnergyPersisted => EventFilter::ENERGY_PERSISTED,
            Event::StorageHistoryReady => EventFilter::STORAGE_HISTORY_READY,
            Event::StorageHistoryUnavailable => EventFilter::STORAGE_HISTORY_UNAVAILABLE,
            Event::OtaUploadReady => EventFilter::OTA_UPLOAD_READY,
            Event::Diagnostic { .. } => EventFilter::DIAGNOSTIC,
        }
    }
}

/// An opaque handle returned by [`EventBus::subscribe`]. Required to
/// `receive` and `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u32);

/// What [`EventBus::receive`] hands back: an event, a timeout, or `Closed`
/// once unsubscribed.
#[derive(Debug, Clone)]
pub enum Received {
    Event(Event),
    Timeout,
    Closed,
}

struct Subscriber {
    id: u32,
    #[allow(dead_code)] // carried for diagnostics surfaces outside this crate
    name: &'static str,
    filter: EventFilter,
    capacity: usize,
    queue: VecDeque<Event>,
    received: u32,
    dropped: u32,
    high_water: u32,
}

struct Registry {
    subscribers: Vec<Subscriber>,
    next_id: u32,
}

/// The "pool hits/misses" half of the payload pool concept. Rust's
/// ownership model removes the need for a manual refcounted slot pool — a
/// `Diagnostic` payload is just an owned, fixed-capacity buffer. What's
/// preserved here is the classification the pool existed for: payloads
/// that fit in `POOL_SLOT_SIZE` are cheap (`hit`), payloads that don't are
/// flagged so a caller building one knows it would have spilled to the
/// general allocator.
struct PoolStats {
    hits: AtomicU32,
    misses: AtomicU32,
}

impl PoolStats {
    const fn new() -> Self {
        Self {
            hits: AtomicU32::new(0),
            misses: AtomicU32::new(0),
        }
    }

    fn classify(&self, len: usize) {
        if len <= POOL_SLOT_SIZE {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusMetrics {
    pub subscribers_count: u32,
    pub published_total: u64,
    pub dispatched_total: u64,
    pub dropped_total: u64,
    pub queue_capacity_total: u32,
    pub queue_depth_current: u32,
    pub pool_hits: u32,
    pub pool_misses: u32,
}

/// The bus itself. One registry mutex guards subscribe/unsubscribe/dispatch;
/// publish counters are plain atomics so a reader never contends with a
/// publisher for them.
pub struct EventBus {
    registry: Mutex<CriticalSectionRawMutex, Registry>,
    default_capacity: usize,
    published_total: AtomicU64,
    dispatched_total: AtomicU64,
    dropped_total: AtomicU64,
    pool: PoolStats,
}

impl EventBus {
    pub fn new(cfg: crate::config::BusConfig) -> Self {
        Self {
            registry: Mutex::new(Registry {
                subscribers: Vec::new(),
                next_id: 1,
            }),
            default_capacity: cfg.default_queue_capacity,
            published_total: AtomicU64::new(0),
            dispatched_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            pool: PoolStats::new(),
        }
    }

    /// Registers a new subscriber. `capacity` of `0` uses the bus default
    /// (32), fixed for the life of the subscription.
    pub async fn subscribe(&self, name: &'static str, filter: EventFilter, capacity: usize) -> SubscriptionHandle {
        let capacity = if capacity == 0 { self.default_capacity } else { capacity };
        let mut reg = self.registry.lock().await;
        let id = reg.next_id;
        reg.next_id = reg.next_id.wrapping_add(1).max(1);
        reg.subscribers.push(Subscriber {
            id,
            name,
            filter,
            capacity,
            queue: VecDeque::new(),
            received: 0,
            dropped: 0,
            high_water: 0,
        });
        SubscriptionHandle(id)
    }

    /// Removes the subscription. Any in-flight `receive` call on this handle
    /// observes `Closed` on its next poll rather than hanging forever.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut reg = self.registry.lock().await;
        reg.subscribers.retain(|s| s.id != handle.0);
    }

    /// Dispatches `event` to every subscriber whose filter matches. Never
    /// blocks: a full inbox drops the event for that subscriber and bumps
    /// its drop counter and high-water mark; other subscribers are
    /// unaffected.
    pub async fn publish(&self, event: Event) {
        self.published_total.fetch_add(1, Ordering::Relaxed);
        if let Event::Diagnostic { payload, .. } = &event {
            self.pool.classify(payload.len());
        }
        let bit = event.filter_bit();
        let mut reg = self.registry.lock().await;
        for sub in reg.subscribers.iter_mut() {
            if !sub.filter.contains(bit) {
                continue;
            }
            if sub.queue.len() < sub.capacity {
                sub.queue.push_back(event.clone());
                sub.received += 1;
                self.dispatched_total.fetch_add(1, Ordering::Relaxed);
            } else {
                sub.dropped += 1;
                sub.high_water = sub.high_water.max(sub.queue.len() as u32);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Waits up to `timeout` for the next event on `handle`'s inbox. Polls
    /// in short slices (≤ 25 ms) rather than parking on a per-subscriber
    /// waker, which keeps the registry lock held only for instants at a
    /// time.
    pub async fn receive(&self, handle: SubscriptionHandle, timeout: Duration) -> Received {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut reg = self.registry.lock().await;
                match reg.subscribers.iter_mut().find(|s| s.id == handle.0) {
                    None => return Received::Closed,
                    Some(sub) => {
                        if let Some(event) = sub.queue.pop_front() {
                            return Received::Event(event);
                        }
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Received::Timeout;
            }
            let slice = Duration::from_millis(20).min(deadline - now);
            Timer::after(slice).await;
        }
    }

    pub async fn metrics(&self) -> BusMetrics {
        let reg = self.registry.lock().await;
        let queue_capacity_total: u32 = reg.subscribers.iter().map(|s| s.capacity as u32).sum();
        let queue_depth_current: u32 = reg.subscribers.iter().map(|s| s.queue.len() as u32).sum();
        BusMetrics {
            subscribers_count: reg.subscribers.len() as u32,
            published_total: self.published_total.load(Ordering::Relaxed),
            dispatched_total: self.dispatched_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            queue_capacity_total,
            queue_depth_current,
            pool_hits: self.pool.hits.load(Ordering::Relaxed),
            pool_misses: self.pool.misses.load(Ordering::Relaxed),
        }
    }

    /// Per-subscriber received/dropped counters, used by the drop-accounting
    /// property test (`published_total = Σ received + Σ dropped` for
    /// subscribers matching the event's filter).
    #[cfg(test)]
    async fn subscriber_counts(&self, handle: SubscriptionHandle) -> Option<(u32, u32, u32)> {
        let reg = self.registry.lock().await;
        reg.subscribers
            .iter()
            .find(|s| s.id == handle.0)
            .map(|s| (s.received, s.dropped, s.high_water))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    #[test]
    fn subscribe_receive_unsubscribe_round_trips() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let h = bus.subscribe("test", EventFilter::ALL, 4).await;
            bus.publish(Event::BmsOnline).await;
            match bus.receive(h, Duration::from_millis(50)).await {
                Received::Event(Event::BmsOnline) => {}
                other => panic!("unexpected {other:?}"),
            }

            bus.unsubscribe(h).await;
            match bus.receive(h, Duration::from_millis(50)).await {
                Received::Closed => {}
                other => panic!("expected Closed, got {other:?}"),
            }
        });
    }

    #[test]
    fn receive_times_out_when_empty() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let h = bus.subscribe("test", EventFilter::ALL, 4).await;
            match bus.receive(h, Duration::from_millis(30)).await {
                Received::Timeout => {}
                other => panic!("expected Timeout, got {other:?}"),
            }
        });
    }

    #[test]
    fn filter_excludes_non_matching_events() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let h = bus.subscribe("test", EventFilter::BMS_ONLINE, 4).await;
            bus.publish(Event::BmsOffline).await;
            bus.publish(Event::BmsOnline).await;
            match bus.receive(h, Duration::from_millis(30)).await {
                Received::Event(Event::BmsOnline) => {}
                other => panic!("unexpected {other:?}"),
            }
        });
    }

    #[test]
    fn events_are_delivered_in_publish_order() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let h = bus.subscribe("test", EventFilter::ALL, 16).await;
            for i in 0..8u16 {
                bus.publish(Event::BmsRegisterUpdated { addr: i, value: i }).await;
            }
            for i in 0..8u16 {
                match bus.receive(h, Duration::from_millis(30)).await {
                    Received::Event(Event::BmsRegisterUpdated { addr, .. }) => assert_eq!(addr, i),
                    other => panic!("unexpected {other:?}"),
                }
            }
        });
    }

    #[test]
    fn full_inbox_drops_and_counts_without_blocking_publish() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let h = bus.subscribe("test", EventFilter::ALL, 2).await;
            for _ in 0..5 {
                bus.publish(Event::BmsOnline).await;
            }
            let (received, dropped, high_water) = bus.subscriber_counts(h).await.unwrap();
            assert_eq!(received, 2);
            assert_eq!(dropped, 3);
            assert_eq!(high_water, 2);
        });
    }

    #[test]
    fn published_total_equals_sum_of_received_and_dropped() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let a = bus.subscribe("a", EventFilter::ALL, 1).await;
            let b = bus.subscribe("b", EventFilter::ALL, 10).await;
            for _ in 0..4 {
                bus.publish(Event::BmsOnline).await;
            }
            let (a_recv, a_drop, _) = bus.subscriber_counts(a).await.unwrap();
            let (b_recv, b_drop, _) = bus.subscriber_counts(b).await.unwrap();
            let metrics = bus.metrics().await;
            assert_eq!(metrics.published_total, 4);
            assert_eq!((a_recv + a_drop) as u64, metrics.published_total);
            assert_eq!((b_recv + b_drop) as u64, metrics.published_total);
        });
    }

    #[test]
    fn unrelated_subscriber_unaffected_by_a_dangling_one() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let dangling = bus.subscribe("gone", EventFilter::ALL, 4).await;
            let alive = bus.subscribe("alive", EventFilter::ALL, 4).await;
            bus.unsubscribe(dangling).await;
            bus.publish(Event::BmsOnline).await;
            match bus.receive(alive, Duration::from_millis(30)).await {
                Received::Event(Event::BmsOnline) => {}
                other => panic!("unexpected {other:?}"),
            }
        });
    }
}
