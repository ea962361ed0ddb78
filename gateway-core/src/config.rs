//! Every tunable this gateway uses, collected into one aggregate so no
//! algorithm hard-codes a threshold. `GatewayConfig::default()` reproduces
//! the documented TinyBMS/Victron numeric defaults.

use crate::error::GatewayError;
use crate::storage::KvStore;

#[derive(Debug, Clone, Copy)]
pub struct SerialConfig {
    /// Whether to flush the RX buffer before issuing a request.
    ///
    /// One ESP32 port ships this off; another deployment leaves it on and
    /// reports it more reliable. Defaults to `true` here (see DESIGN.md) and
    /// is exposed so a deployment can flip it back off if a particular UART
    /// bridge is known to lose bytes on flush.
    pub flush_before_read: bool,
    /// Per-request deadline before the transaction is retried or abandoned.
    pub request_deadline_ms: u32,
    /// Ceiling on the request-queue mutex acquisition.
    pub queue_mutex_timeout_ms: u32,
    /// Read chunk size while polling the RX buffer.
    pub read_chunk_ms: u32,
    pub max_retries: u8,
    /// Exponential backoff steps, one per retry attempt (ms).
    pub backoff_steps_ms: [u32; 3],
    /// Steady poll tick for the ~29-register sweep.
    pub poll_tick_ms: u32,
    /// Consecutive failed sweeps before `BmsOffline` is published.
    pub offline_after_failed_sweeps: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            flush_before_read: true,
            request_deadline_ms: 200,
            queue_mutex_timeout_ms: 5_000,
            read_chunk_ms: 50,
            max_retries: 3,
            backoff_steps_ms: [50, 100, 200],
            poll_tick_ms: 500,
            offline_after_failed_sweeps: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CvlConfig {
    pub cell_max_v: f32,
    pub cell_min_float_v: f32,
    pub bulk_target_v: f32,
    pub float_voltage_v: f32,
    pub sustain_voltage_v: f32,

    pub bulk_soc_threshold_pct: f32,
    pub transition_soc_threshold_pct: f32,
    pub float_soc_threshold_pct: f32,

    pub sustain_soc_entry_pct: f32,
    pub sustain_soc_exit_pct: f32,
    pub sustain_ccl_a: f32,
    pub sustain_dcl_a: f32,

    pub imbalance_hold_threshold_mv: u16,
    pub imbalance_release_threshold_mv: u16,
    pub imbalance_drop_max_v: f32,
    pub drop_per_mv_v: f32,
    pub minimum_ccl_in_float_a: f32,

    pub cell_safety_threshold_mv: u16,
    pub cell_safety_release_mv: u16,
    pub kp: f32,
    pub nominal_current_a: f32,

    pub max_recovery_step_v: f32,
}

impl Default for CvlConfig {
    fn default() -> Self {
        Self {
            cell_max_v: 3.40,
            cell_min_float_v: 3.30,
            bulk_target_v: 54.4,
            float_voltage_v: 53.5,
            sustain_voltage_v: 52.0,

            bulk_soc_threshold_pct: 80.0,
            transition_soc_threshold_pct: 90.0,
            float_soc_threshold_pct: 95.0,

            sustain_soc_entry_pct: 30.0,
            sustain_soc_exit_pct: 40.0,
            sustain_ccl_a: 5.0,
            sustain_dcl_a: 5.0,

            imbalance_hold_threshold_mv: 40,
            imbalance_release_threshold_mv: 30,
            imbalance_drop_max_v: 2.0,
            drop_per_mv_v: 0.05,
            minimum_ccl_in_float_a: 10.0,

            cell_safety_threshold_mv: 3600,
            cell_safety_release_mv: 3550,
            kp: 5.0,
            nominal_current_a: 100.0,

            max_recovery_step_v: 0.1,
        }
    }
}

/// Key the CVL configuration blob is stored under — the second persistent
/// record, alongside the energy counters in [`crate::energy`].
const CVL_CONFIG_STORE_KEY: &str = "cvl_config";
const CVL_CONFIG_BYTES: usize = 23 * 4;

impl CvlConfig {
    /// Packs every field as a little-endian 4-byte word (`f32` fields
    /// bit-cast, `u16` fields zero-extended) in declaration order. A flat,
    /// fixed-width encoding keeps `from_bytes` a straight reverse of
    /// `to_bytes` with no versioning concerns — this blob is only ever
    /// written and read by the same binary.
    fn to_bytes(self) -> [u8; CVL_CONFIG_BYTES] {
        let mut out = [0u8; CVL_CONFIG_BYTES];
        let mut w = 0usize;
        let mut push_f32 = |out: &mut [u8; CVL_CONFIG_BYTES], v: f32| {
            out[w * 4..w * 4 + 4].copy_from_slice(&v.to_le_bytes());
            w += 1;
        };
        push_f32(&mut out, self.cell_max_v);
        push_f32(&mut out, self.cell_min_float_v);
        push_f32(&mut out, self.bulk_target_v);
        push_f32(&mut out, self.float_voltage_v);
        push_f32(&mut out, self.sustain_voltage_v);
        push_f32(&mut out, self.bulk_soc_threshold_pct);
        push_f32(&mut out, self.transition_soc_threshold_pct);
        push_f32(&mut out, self.float_soc_threshold_pct);
        push_f32(&mut out, self.sustain_soc_entry_pct);
        push_f32(&mut out, self.sustain_soc_exit_pct);
        push_f32(&mut out, self.sustain_ccl_a);
        push_f32(&mut out, self.sustain_dcl_a);
        push_f32(&mut out, self.imbalance_hold_threshold_mv as f32);
        push_f32(&mut out, self.imbalance_release_threshold_mv as f32);
        push_f32(&mut out, self.imbalance_drop_max_v);
        push_f32(&mut out, self.drop_per_mv_v);
        push_f32(&mut out, self.minimum_ccl_in_float_a);
        push_f32(&mut out, self.cell_safety_threshold_mv as f32);
        push_f32(&mut out, self.cell_safety_release_mv as f32);
        push_f32(&mut out, self.kp);
        push_f32(&mut out, self.nominal_current_a);
        push_f32(&mut out, self.max_recovery_step_v);
        out
    }

    /// Reverses [`Self::to_bytes`]. Returns `None` on a short buffer or an
    /// out-of-range value rather than constructing a `CvlConfig` the state
    /// machine's invariants (`cell_max_v > cell_min_float_v`, …) can't trust.
    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CVL_CONFIG_BYTES {
            return None;
        }
        let mut r = 0usize;
        let mut next_f32 = |bytes: &[u8]| -> f32 {
            let v = f32::from_le_bytes(bytes[r * 4..r * 4 + 4].try_into().unwrap());
            r += 1;
            v
        };
        let cfg = CvlConfig {
            cell_max_v: next_f32(bytes),
            cell_min_float_v: next_f32(bytes),
            bulk_target_v: next_f32(bytes),
            float_voltage_v: next_f32(bytes),
            sustain_voltage_v: next_f32(bytes),
            bulk_soc_threshold_pct: next_f32(bytes),
            transition_soc_threshold_pct: next_f32(bytes),
            float_soc_threshold_pct: next_f32(bytes),
            sustain_soc_entry_pct: next_f32(bytes),
            sustain_soc_exit_pct: next_f32(bytes),
            sustain_ccl_a: next_f32(bytes),
            sustain_dcl_a: next_f32(bytes),
            imbalance_hold_threshold_mv: next_f32(bytes) as u16,
            imbalance_release_threshold_mv: next_f32(bytes) as u16,
            imbalance_drop_max_v: next_f32(bytes),
            drop_per_mv_v: next_f32(bytes),
            minimum_ccl_in_float_a: next_f32(bytes),
            cell_safety_threshold_mv: next_f32(bytes) as u16,
            cell_safety_release_mv: next_f32(bytes) as u16,
            kp: next_f32(bytes),
            nominal_current_a: next_f32(bytes),
            max_recovery_step_v: next_f32(bytes),
        };
        if !(cfg.cell_max_v.is_finite() && cfg.cell_max_v > cfg.cell_min_float_v && cfg.cell_min_float_v > 0.0) {
            return None;
        }
        Some(cfg)
    }
}

/// Loads the CVL configuration blob written by [`persist_cvl_config`],
/// falling back to [`CvlConfig::default`] if the store has nothing, the
/// blob is short, or a field is out of range — loss of the persisted
/// config must never halt the core.
pub async fn load_cvl_config(store: &dyn KvStore) -> CvlConfig {
    store
        .load(CVL_CONFIG_STORE_KEY)
        .await
        .and_then(|bytes| CvlConfig::from_bytes(&bytes))
        .unwrap_or_default()
}

/// Validates and persists a new CVL configuration, the backing half of the
/// `set_cvl_config` command surface: an invalid config is rejected
/// atomically without writing anything, and a write failure surfaces as
/// `PersistenceFailure` rather than silently keeping the old blob.
pub async fn persist_cvl_config(store: &dyn KvStore, cfg: CvlConfig) -> Result<(), GatewayError> {
    if !(cfg.cell_max_v > cfg.cell_min_float_v && cfg.cell_max_v > 0.0) {
        return Err(GatewayError::InvalidArgument);
    }
    store
        .store(CVL_CONFIG_STORE_KEY, &cfg.to_bytes())
        .await
        .map_err(|_| GatewayError::PersistenceFailure)
}

#[derive(Debug, Clone, Copy)]
pub struct CanConfig {
    pub keepalive_interval_ms: u32,
    pub keepalive_timeout_ms: u32,
    pub scheduler_resolution_ms: u32,

    pub breaker_failure_threshold: u8,
    pub breaker_open_duration_ms: u32,
    pub breaker_half_open_successes: u8,

    pub bucket_capacity: u32,
    pub bucket_refill_interval_ms: u32,

    /// Alarm thresholds used by the 0x35A encoder.
    pub over_temp_c: f32,
    pub under_temp_c: f32,
    pub overcurrent_fraction: f32,
    pub imbalance_alarm_mv: u16,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 1_000,
            keepalive_timeout_ms: 5_000,
            scheduler_resolution_ms: 250,

            breaker_failure_threshold: 5,
            breaker_open_duration_ms: 30_000,
            breaker_half_open_successes: 3,

            bucket_capacity: 10,
            bucket_refill_interval_ms: 100,

            over_temp_c: 65.0,
            under_temp_c: -10.0,
            overcurrent_fraction: 0.80,
            imbalance_alarm_mv: 40,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnergyConfig {
    pub persist_interval_ms: u32,
    pub persist_hysteresis_wh: f64,
    /// A sample is rejected if `dt_h` exceeds this many seconds worth.
    pub max_sample_gap_s: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            persist_interval_ms: 60_000,
            persist_hysteresis_wh: 10.0,
            max_sample_gap_s: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub default_queue_capacity: usize,
    pub pool_slots: usize,
    pub pool_slot_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_queue_capacity: 32,
            pool_slots: 64,
            pool_slot_size: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayConfig {
    pub serial: SerialConfig,
    pub cvl: CvlConfig,
    pub can: CanConfig,
    pub energy: EnergyConfig,
    pub bus: BusConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;

    #[test]
    fn cvl_config_round_trips_through_bytes() {
        let cfg = CvlConfig::default();
        let bytes = cfg.to_bytes();
        let back = CvlConfig::from_bytes(&bytes).unwrap();
        assert_eq!(back.bulk_target_v, cfg.bulk_target_v);
        assert_eq!(back.imbalance_hold_threshold_mv, cfg.imbalance_hold_threshold_mv);
        assert_eq!(back.cell_safety_threshold_mv, cfg.cell_safety_threshold_mv);
    }

    #[test]
    fn load_cvl_config_falls_back_to_default_when_store_is_empty() {
        embassy_futures::block_on(async {
            let store = InMemoryKvStore::new();
            let loaded = load_cvl_config(&store).await;
            assert_eq!(loaded.bulk_target_v, CvlConfig::default().bulk_target_v);
        });
    }

    #[test]
    fn persist_then_load_cvl_config_round_trips() {
        embassy_futures::block_on(async {
            let store = InMemoryKvStore::new();
            let mut cfg = CvlConfig::default();
            cfg.bulk_target_v = 55.2;
            persist_cvl_config(&store, cfg).await.unwrap();
            let loaded = load_cvl_config(&store).await;
            assert_eq!(loaded.bulk_target_v, 55.2);
        });
    }

    #[test]
    fn persist_cvl_config_rejects_invalid_voltage_ordering_without_writing() {
        embassy_futures::block_on(async {
            let store = InMemoryKvStore::new();
            let mut bad = CvlConfig::default();
            bad.cell_max_v = 3.0;
            bad.cell_min_float_v = 3.2;
            assert!(persist_cvl_config(&store, bad).await.is_err());
            assert!(store.load("cvl_config").await.is_none());
        });
    }
}
