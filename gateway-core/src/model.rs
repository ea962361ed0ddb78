//! Battery model adapter: a pure function of the register cache. Resolves
//! TinyBMS fixed-point/scale conventions (SOC in ppm, currents signed with
//! `+` = charge, temperatures in tenths of a degree, `-32768` = sensor
//! absent) into SI-unit fields.

use crate::registers::{addr, RegisterCache};

pub const MAX_CELLS: usize = 16;
const TEMP_ABSENT_SENTINEL: i16 = -32768;

/// An immutable snapshot of the battery's state. Producers copy it; nothing
/// mutates a `LiveData` once built.
#[derive(Debug, Clone, Copy)]
pub struct LiveData {
    pub pack_v: f32,
    /// Signed; positive is charging.
    pub pack_a: f32,
    pub soc_pct: f32,
    pub soh_pct: f32,
    pub cell_mv: [u16; MAX_CELLS],
    pub series_cells: usize,
    pub temp_internal_c: Option<f32>,
    pub temp_ext1_c: Option<f32>,
    pub temp_ext2_c: Option<f32>,
    pub ccl_base_a: f32,
    pub dcl_base_a: f32,
    pub capacity_ah: f32,
    pub fw_version: u16,
    pub online_status: u16,
}

impl LiveData {
    pub fn min_cell_mv(&self) -> u16 {
        self.cell_mv[..self.series_cells.max(1)]
            .iter()
            .copied()
            .filter(|&v| v > 0)
            .min()
            .unwrap_or(0)
    }

    pub fn max_cell_mv(&self) -> u16 {
        self.cell_mv[..self.series_cells.max(1)]
            .iter()
            .copied()
            .filter(|&v| v > 0)
            .max()
            .unwrap_or(0)
    }

    pub fn imbalance_mv(&self) -> u16 {
        self.max_cell_mv().saturating_sub(self.min_cell_mv())
    }

    fn decode_temp(raw: i16) -> Option<f32> {
        if raw == TEMP_ABSENT_SENTINEL {
            None
        } else {
            Some(raw as f32 / 10.0)
        }
    }

    /// Builds a snapshot from whatever is currently in the cache. Missing
    /// registers decode to zero/absent rather than stalling the sweep; a
    /// `LiveData` is immutable once built, but that says nothing about
    /// whether every source register had actually been read yet.
    pub async fn from_cache(cache: &RegisterCache) -> LiveData {
        let u16_of = |raw: Option<crate::registers::RegisterValue>| {
            raw.and_then(|v| v.raw.as_u16()).unwrap_or(0)
        };

        let pack_v_raw = u16_of(cache.get(addr::PACK_VOLTAGE).await);
        let pack_a_raw = cache
            .get(addr::PACK_CURRENT)
            .await
            .and_then(|v| v.raw.as_i16())
            .unwrap_or(0);
        let soc_ppm = cache
            .get(addr::SOC_PPM)
            .await
            .and_then(|v| v.raw.as_u32())
            .unwrap_or(0);
        let soh_raw = u16_of(cache.get(addr::SOH_PCT).await);

        let mut cell_mv = [0u16; MAX_CELLS];
        let mut series_cells = 0usize;
        for (i, slot) in cell_mv.iter_mut().enumerate() {
            let raw = u16_of(cache.get(addr::CELL_VOLTAGE_BASE + i as u16).await);
            *slot = raw;
            if raw > 0 {
                series_cells = i + 1;
            }
        }

        let temp_internal = cache
            .get(addr::TEMP_INTERNAL)
            .await
            .and_then(|v| v.raw.as_i16())
            .and_then(Self::decode_temp);
        let temp_ext1 = cache
            .get(addr::TEMP_EXTERNAL_1)
            .await
            .and_then(|v| v.raw.as_i16())
            .and_then(Self::decode_temp);
        let temp_ext2 = cache
            .get(addr::TEMP_EXTERNAL_2)
            .await
            .and_then(|v| v.raw.as_i16())
            .and_then(Self::decode_temp);

        let ccl_base = u16_of(cache.get(addr::CCL_BASE).await);
        let dcl_base = u16_of(cache.get(addr::DCL_BASE).await);
        let capacity_raw = u16_of(cache.get(addr::CAPACITY_AH).await);
        let fw_version = u16_of(cache.get(addr::FW_VERSION).await);
        let online_status = u16_of(cache.get(addr::ONLINE_STATUS).await);

        LiveData {
            pack_v: pack_v_raw as f32 / 100.0,
            pack_a: pack_a_raw as f32 / 10.0,
            soc_pct: soc_ppm as f32 / 10_000.0,
            soh_pct: soh_raw as f32 / 100.0,
            cell_mv,
            series_cells: series_cells.max(1),
            temp_internal_c: temp_internal,
            temp_ext1_c: temp_ext1,
            temp_ext2_c: temp_ext2,
            ccl_base_a: ccl_base as f32 / 10.0,
            dcl_base_a: dcl_base as f32 / 10.0,
            capacity_ah: capacity_raw as f32 / 100.0,
            fw_version,
            online_status,
        }
    }
}

/// Identity strings (serial number, family, firmware version) used by the
/// slow (2–5 s period) Victron identification frames. Kept separate from
/// [`LiveData`] because they aren't part of the steady ~29-register poll set
/// and change essentially never, so the CAN publisher reads them far less
/// often than once a second.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub serial: [u8; 16],
    pub family: [u8; 8],
    pub fw_version: u32,
    pub capacity_ah: f32,
}

impl Identity {
    fn word_to_ascii_pair(raw: u16) -> [u8; 2] {
        // Each register word packs two printable ASCII bytes, low byte
        // first, the way the TinyBMS serial/family strings are documented.
        [(raw & 0xFF) as u8, (raw >> 8) as u8]
    }

    pub async fn from_cache(cache: &RegisterCache) -> Identity {
        let mut serial = [0u8; 16];
        for word_idx in 0..8 {
            let raw = cache
                .get(addr::SERIAL_NUMBER_BASE + word_idx as u16)
                .await
                .and_then(|v| v.raw.as_u16())
                .unwrap_or(0);
            let bytes = Self::word_to_ascii_pair(raw);
            serial[word_idx * 2] = bytes[0];
            serial[word_idx * 2 + 1] = bytes[1];
        }

        let mut family = [0u8; 8];
        for word_idx in 0..4 {
            let raw = cache
                .get(addr::FAMILY_BASE + word_idx as u16)
                .await
                .and_then(|v| v.raw.as_u16())
                .unwrap_or(0);
            let bytes = Self::word_to_ascii_pair(raw);
            family[word_idx * 2] = bytes[0];
            family[word_idx * 2 + 1] = bytes[1];
        }

        let fw_version = cache
            .get(addr::FW_VERSION)
            .await
            .and_then(|v| v.raw.as_u16())
            .unwrap_or(0) as u32;
        let capacity_ah = cache
            .get(addr::CAPACITY_AH)
            .await
            .and_then(|v| v.raw.as_u16())
            .map(|raw| raw as f32 / 100.0)
            .unwrap_or(0.0);

        Identity {
            serial,
            family,
            fw_version,
            capacity_ah,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RawValue;
    use embassy_time::Instant;

    #[test]
    fn derives_min_max_and_imbalance() {
        embassy_futures::block_on(async {
            let cache = RegisterCache::new();
            let now = Instant::now();
            cache.put(addr::CELL_VOLTAGE_BASE, RawValue::U16(3280), now).await;
            cache.put(addr::CELL_VOLTAGE_BASE + 1, RawValue::U16(3250), now).await;
            cache.put(addr::CELL_VOLTAGE_BASE + 2, RawValue::U16(3300), now).await;
            let live = LiveData::from_cache(&cache).await;
            assert_eq!(live.series_cells, 3);
            assert_eq!(live.min_cell_mv(), 3250);
            assert_eq!(live.max_cell_mv(), 3300);
            assert_eq!(live.imbalance_mv(), 50);
        });
    }

    #[test]
    fn absent_temperature_sentinel_decodes_to_none() {
        embassy_futures::block_on(async {
            let cache = RegisterCache::new();
            let now = Instant::now();
            cache
                .put(addr::TEMP_EXTERNAL_1, RawValue::I16(-32768), now)
                .await;
            cache.put(addr::TEMP_INTERNAL, RawValue::I16(235), now).await;
            let live = LiveData::from_cache(&cache).await;
            assert_eq!(live.temp_ext1_c, None);
            assert_eq!(live.temp_internal_c, Some(23.5));
        });
    }

    #[test]
    fn soc_decodes_from_ppm_to_percent() {
        embassy_futures::block_on(async {
            let cache = RegisterCache::new();
            let now = Instant::now();
            cache.put(addr::SOC_PPM, RawValue::U32(500_000), now).await;
            let live = LiveData::from_cache(&cache).await;
            assert!((live.soc_pct - 50.0).abs() < 0.001);
        });
    }

    #[test]
    fn identity_decodes_ascii_words_low_byte_first() {
        embassy_futures::block_on(async {
            let cache = RegisterCache::new();
            let now = Instant::now();
            // "EN" packed low-byte-first: 'E' = 0x45, 'N' = 0x4E.
            cache
                .put(addr::SERIAL_NUMBER_BASE, RawValue::U16(0x4E45), now)
                .await;
            let identity = Identity::from_cache(&cache).await;
            assert_eq!(&identity.serial[0..2], b"EN");
        });
    }
}
