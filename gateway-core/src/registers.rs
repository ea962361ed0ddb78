//! TinyBMS register map (the subset this gateway polls) and the concurrent
//! cache that the serial client (Core A.2) fills in and everything else
//! reads.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Instant;
use heapless::Vec;

/// Named register addresses. Only the ~29 registers the poll loop reads are
/// named here; anything else is an ad-hoc `u16` passed to `write_register`.
pub mod addr {
    /// The TinyBMS datasheet documents this register both as an IEEE-754
    /// f32 and as a centivolt scaled integer depending on which command
    /// retrieves it. This gateway always reads it with the block-read
    /// command (0x07) and treats it as a `u16` in centivolts, matching the
    /// shortcut-read command 0x14 used for the same value.
    pub const PACK_VOLTAGE: u16 = 36;
    pub const PACK_CURRENT: u16 = 38;
    pub const SOC_PPM: u16 = 50;
    pub const SOH_PCT: u16 = 52;
    pub const CELL_VOLTAGE_BASE: u16 = 60; // cell 1..16 occupy 60..=75
    pub const TEMP_INTERNAL: u16 = 80;
    pub const TEMP_EXTERNAL_1: u16 = 81;
    pub const TEMP_EXTERNAL_2: u16 = 82;
    pub const MIN_CELL_VOLTAGE: u16 = 90;
    pub const MAX_CELL_VOLTAGE: u16 = 91;
    pub const ONLINE_STATUS: u16 = 100;
    pub const DCL_BASE: u16 = 102;
    pub const CCL_BASE: u16 = 103;
    pub const CAPACITY_AH: u16 = 110;
    pub const SERIES_CELLS: u16 = 111;
    pub const SERIAL_NUMBER_BASE: u16 = 120; // 8 words / 16 bytes
    pub const FAMILY_BASE: u16 = 128; // 4 words / 8 bytes
    pub const FW_VERSION: u16 = 132;

    /// The full poll set issued once per sweep, in the order the client
    /// reads them. Cell voltages are 16 consecutive words.
    pub const POLL_SET: [u16; 29] = [
        PACK_VOLTAGE,
        PACK_CURRENT,
        SOC_PPM,
        SOH_PCT,
        CELL_VOLTAGE_BASE,
        CELL_VOLTAGE_BASE + 1,
        CELL_VOLTAGE_BASE + 2,
        CELL_VOLTAGE_BASE + 3,
        CELL_VOLTAGE_BASE + 4,
        CELL_VOLTAGE_BASE + 5,
        CELL_VOLTAGE_BASE + 6,
        CELL_VOLTAGE_BASE + 7,
        CELL_VOLTAGE_BASE + 8,
        CELL_VOLTAGE_BASE + 9,
        CELL_VOLTAGE_BASE + 10,
        CELL_VOLTAGE_BASE + 11,
        CELL_VOLTAGE_BASE + 12,
        CELL_VOLTAGE_BASE + 13,
        CELL_VOLTAGE_BASE + 14,
        CELL_VOLTAGE_BASE + 15,
        TEMP_INTERNAL,
        TEMP_EXTERNAL_1,
        TEMP_EXTERNAL_2,
        MIN_CELL_VOLTAGE,
        MAX_CELL_VOLTAGE,
        ONLINE_STATUS,
        DCL_BASE,
        CCL_BASE,
        CAPACITY_AH,
    ];
}

/// The last decoded value of one register, plus when it was decoded.
/// Only values whose read completed with a matching CRC are ever stored.
#[derive(Debug, Clone, Copy)]
pub struct RegisterValue {
    pub raw: RawValue,
    pub updated_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub enum RawValue {
    U16(u16),
    U32(u32),
    I16(i16),
    F32(f32),
}

impl RawValue {
    pub fn as_u16(self) -> Option<u16> {
        match self {
            RawValue::U16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16(self) -> Option<i16> {
        match self {
            RawValue::I16(v) => Some(v),
            RawValue::U16(v) => Some(v as i16),
            _ => None,
        }
    }

    pub fn as_u32(self) -> Option<u32> {
        match self {
            RawValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(self) -> Option<f32> {
        match self {
            RawValue::F32(v) => Some(v),
            _ => None,
        }
    }
}

const MAX_REGISTERS: usize = 64;

struct Entry {
    addr: u16,
    value: RegisterValue,
}

/// Concurrent key-value store keyed by register address. Created once at
/// boot, never cleared, updated in place only by the serial client.
pub struct RegisterCache {
    inner: Mutex<CriticalSectionRawMutex, Vec<Entry, MAX_REGISTERS>>,
}

impl RegisterCache {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Store a freshly decoded, CRC-valid value.
    pub async fn put(&self, addr: u16, raw: RawValue, now: Instant) {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.iter_mut().find(|e| e.addr == addr) {
            entry.value = RegisterValue {
                raw,
                updated_at: now,
            };
            return;
        }
        // Capacity is sized for the documented poll set plus headroom for
        // ad-hoc writes; a full cache drops the oldest-unused slot rather
        // than panicking.
        if guard
            .push(Entry {
                addr,
                value: RegisterValue {
                    raw,
                    updated_at: now,
                },
            })
            .is_err()
        {
            if let Some(oldest) = guard
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.value.updated_at)
                .map(|(i, _)| i)
            {
                guard[oldest] = Entry {
                    addr,
                    value: RegisterValue {
                        raw,
                        updated_at: now,
                    },
                };
            }
        }
    }

    pub async fn get(&self, addr: u16) -> Option<RegisterValue> {
        let guard = self.inner.lock().await;
        guard.iter().find(|e| e.addr == addr).map(|e| e.value)
    }
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}
