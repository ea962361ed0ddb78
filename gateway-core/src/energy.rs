//! Core C.2 — the Wh-in/Wh-out integrator. A single mutex protects both
//! counters and the previous tick's timestamp; integration always uses that
//! stored timestamp, never wall-clock read twice, so a delayed caller can't
//! retroactively shrink `Δt`.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Instant;

use crate::bus::{Event, EventBus};
use crate::config::EnergyConfig;
use crate::error::GatewayError;
use crate::storage::KvStore;

const ENERGY_STORE_KEY: &str = "energy_counters";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyCounters {
    pub charged_wh: f64,
    pub discharged_wh: f64,
}

impl EnergyCounters {
    /// Replaces NaN/Inf/negative with zero. Applied to whatever was loaded
    /// from the store, since a corrupt or stale blob shouldn't poison the
    /// running counters.
    fn sanitized(self) -> Self {
        let clean = |v: f64| if v.is_finite() && v >= 0.0 { v } else { 0.0 };
        Self {
            charged_wh: clean(self.charged_wh),
            discharged_wh: clean(self.discharged_wh),
        }
    }

    fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.charged_wh.to_le_bytes());
        out[8..16].copy_from_slice(&self.discharged_wh.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let mut charged = [0u8; 8];
        let mut discharged = [0u8; 8];
        charged.copy_from_slice(&bytes[0..8]);
        discharged.copy_from_slice(&bytes[8..16]);
        Some(
            Self {
                charged_wh: f64::from_le_bytes(charged),
                discharged_wh: f64::from_le_bytes(discharged),
            }
            .sanitized(),
        )
    }
}

struct State {
    counters: EnergyCounters,
    last_persisted: EnergyCounters,
    last_tick: Option<Instant>,
    last_persist_at: Instant,
}

/// Thread-safe Wh-in/Wh-out integrator plus write-coalesced persistence.
pub struct EnergyAccumulator<'a> {
    state: Mutex<CriticalSectionRawMutex, State>,
    cfg: EnergyConfig,
    bus: &'a EventBus,
}

impl<'a> EnergyAccumulator<'a> {
    /// Loads counters from `store` (falling back to zero on any failure or
    /// corrupt/invalid-range data) and prepares to integrate from `now`.
    pub async fn load(store: &dyn KvStore, cfg: EnergyConfig, bus: &'a EventBus, now: Instant) -> Self {
        let counters = store
            .load(ENERGY_STORE_KEY)
            .await
            .and_then(|bytes| EnergyCounters::from_bytes(&bytes))
            .unwrap_or_default();
        Self {
            state: Mutex::new(State {
                counters,
                last_persisted: counters,
                last_tick: None,
                last_persist_at: now,
            }),
            cfg,
            bus,
        }
    }

    /// Integrates one `(pack_v, pack_a, now)` sample. Rejects (and does not
    /// mutate the counters for) samples whose implied `Δt` is non-positive
    /// or larger than `max_sample_gap_s` — clock skew or a missed tick.
    pub async fn integrate_sample(&self, pack_v: f32, pack_a: f32, now: Instant) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let last_tick = match state.last_tick {
            Some(t) => t,
            None => {
                state.last_tick = Some(now);
                return Ok(());
            }
        };
        if now <= last_tick {
            return Err(GatewayError::InvalidArgument);
        }
        let dt_h = (now - last_tick).as_millis() as f64 / 3_600_000.0;
        state.last_tick = Some(now);
        if dt_h <= 0.0 || dt_h > self.cfg.max_sample_gap_s / 3600.0 {
            return Err(GatewayError::InvalidArgument);
        }

        let energy_wh = pack_v as f64 * pack_a as f64 * dt_h;
        if energy_wh > 0.0 {
            state.counters.charged_wh += energy_wh;
        } else {
            state.counters.discharged_wh += -energy_wh;
        }
        state.counters = state.counters.sanitized();
        Ok(())
    }

    pub async fn snapshot(&self) -> EnergyCounters {
        self.state.lock().await.counters
    }

    /// Directly overwrites both counters (the `set_energy_counters` command
    /// surface). Rejected atomically if either value is invalid; no partial
    /// update.
    pub async fn set_counters(&self, charged_wh: f64, discharged_wh: f64) -> Result<(), GatewayError> {
        if !charged_wh.is_finite() || !discharged_wh.is_finite() || charged_wh < 0.0 || discharged_wh < 0.0 {
            return Err(GatewayError::InvalidArgument);
        }
        let mut state = self.state.lock().await;
        state.counters = EnergyCounters {
            charged_wh,
            discharged_wh,
        };
        Ok(())
    }

    /// Writes the counters to `store` if either has moved by at least
    /// `persist_hysteresis_wh` since the last successful write, or if
    /// `persist_interval_ms` has elapsed. Intended to be called from a
    /// periodic hook or a dedicated low-priority task.
    pub async fn maybe_persist(&self, store: &dyn KvStore, now: Instant) -> Result<bool, GatewayError> {
        let (should_write, snapshot) = {
            let state = self.state.lock().await;
            let moved = (state.counters.charged_wh - state.last_persisted.charged_wh).abs()
                >= self.cfg.persist_hysteresis_wh
                || (state.counters.discharged_wh - state.last_persisted.discharged_wh).abs()
                    >= self.cfg.persist_hysteresis_wh;
            let due = now - state.last_persist_at >= embassy_time::Duration::from_millis(self.cfg.persist_interval_ms as u64);
            (moved && due, state.counters)
        };

        if !should_write {
            return Ok(false);
        }

        store
            .store(ENERGY_STORE_KEY, &snapshot.to_bytes())
            .await
            .map_err(|_| GatewayError::PersistenceFailure)?;

        let mut state = self.state.lock().await;
        state.last_persisted = snapshot;
        state.last_persist_at = now;
        drop(state);
        self.bus.publish(Event::EnergyPersisted).await;
        Ok(true)
    }

    /// Runs the 60-second persistence hook forever. Intended to be spawned
    /// as the long-lived energy-persistence task.
    pub async fn run_persistence_loop(&self, store: &dyn KvStore) -> ! {
        let mut ticker = embassy_time::Ticker::every(embassy_time::Duration::from_millis(
            self.cfg.persist_interval_ms as u64,
        ));
        loop {
            ticker.next().await;
            let _ = self.maybe_persist(store, Instant::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::BusConfig;
    use crate::storage::InMemoryKvStore;

    fn t(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn integrates_charging_sample_to_expected_wh() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let store = InMemoryKvStore::new();
            let acc = EnergyAccumulator::load(&store, EnergyConfig::default(), &bus, t(0)).await;

            acc.integrate_sample(50.0, 10.0, t(0)).await.unwrap();
            acc.integrate_sample(50.0, 10.0, t(3_600_000)).await.unwrap();

            let counters = acc.snapshot().await;
            assert!((counters.charged_wh - 500.0).abs() < 1.0);
            assert_eq!(counters.discharged_wh, 0.0);
        });
    }

    #[test]
    fn discharge_accumulates_into_discharged_counter() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let store = InMemoryKvStore::new();
            let acc = EnergyAccumulator::load(&store, EnergyConfig::default(), &bus, t(0)).await;

            acc.integrate_sample(50.0, -10.0, t(0)).await.unwrap();
            acc.integrate_sample(50.0, -10.0, t(3_600_000)).await.unwrap();

            let counters = acc.snapshot().await;
            assert!((counters.discharged_wh - 500.0).abs() < 1.0);
            assert_eq!(counters.charged_wh, 0.0);
        });
    }

    #[test]
    fn rejects_non_positive_and_oversized_gaps() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let store = InMemoryKvStore::new();
            let acc = EnergyAccumulator::load(&store, EnergyConfig::default(), &bus, t(0)).await;

            acc.integrate_sample(50.0, 10.0, t(0)).await.unwrap();
            // backwards clock
            assert!(acc.integrate_sample(50.0, 10.0, t(0)).await.is_err());
            // > 60s gap
            assert!(acc.integrate_sample(50.0, 10.0, t(120_000)).await.is_err());

            let counters = acc.snapshot().await;
            assert_eq!(counters.charged_wh, 0.0);
        });
    }

    #[test]
    fn counters_never_go_negative_or_nan() {
        let dirty = EnergyCounters {
            charged_wh: f64::NAN,
            discharged_wh: -5.0,
        };
        let clean = dirty.sanitized();
        assert_eq!(clean.charged_wh, 0.0);
        assert_eq!(clean.discharged_wh, 0.0);
    }

    #[test]
    fn persists_only_after_hysteresis_and_interval() {
        embassy_futures::block_on(async {
            let bus = EventBus::new(BusConfig::default());
            let store = InMemoryKvStore::new();
            let mut cfg = EnergyConfig::default();
            cfg.persist_interval_ms = 0;
            cfg.persist_hysteresis_wh = 10.0;
            let acc = EnergyAccumulator::load(&store, cfg, &bus, t(0)).await;

            acc.integrate_sample(50.0, 10.0, t(0)).await.unwrap();
            acc.integrate_sample(50.0, 10.0, t(360_000)).await.unwrap(); // 50 Wh, < 10 Wh? no, > hysteresis

            let wrote = acc.maybe_persist(&store, t(360_000)).await.unwrap();
            assert!(wrote);
            let again = acc.maybe_persist(&store, t(360_001)).await.unwrap();
            assert!(!again);
        });
    }

    #[test]
    fn round_trips_through_byte_encoding() {
        let counters = EnergyCounters {
            charged_wh: 123.5,
            discharged_wh: 45.25,
        };
        let bytes = counters.to_bytes();
        let back = EnergyCounters::from_bytes(&bytes).unwrap();
        assert_eq!(counters, back);
    }
}
