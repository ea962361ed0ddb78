//! Core B.2 — the nineteen pure Victron CAN frame encoders, plus the 0x305
//! keepalive payload. Every function here takes only the
//! data it needs and returns exactly 8 little-endian bytes; none of them
//! touch the bus, the cache, or shared mutable state — the publisher
//! (Core B.3) is the only thing that calls these and is the only thing that
//! knows about scheduling, caching, or I/O.

use crate::config::CanConfig;
use crate::cvl::CvlOutput;
use crate::energy::EnergyCounters;
use crate::model::{Identity, LiveData};

/// One row of the channel catalogue: CAN id, period, and whether the frame
/// cache is allowed to suppress a repeat transmission of it. Table order
/// doubles as the scheduler's tie-break order: two channels with the same
/// due time fire in table order.
#[derive(Debug, Clone, Copy)]
pub struct CanChannelSpec {
    pub id: u16,
    pub period_ms: u32,
    pub cacheable: bool,
}

/// The keepalive (0x305) is scheduled and transmitted separately by the
/// publisher — it always transmits regardless of the cache and drives the
/// 0x307 handshake dialogue, so it isn't one of the nineteen data-bearing
/// rows in [`CHANNEL_TABLE`]; 0x305 is the keepalive that rides alongside
/// them.
pub const KEEPALIVE_ID: u16 = 0x305;
pub const HANDSHAKE_RX_ID: u16 = 0x307;

pub const CHANNEL_TABLE: [CanChannelSpec; 19] = [
    CanChannelSpec { id: 0x351, period_ms: 1000, cacheable: false }, // CVL-bearing: always transmits
    CanChannelSpec { id: 0x355, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x356, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x35A, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x35E, period_ms: 2000, cacheable: true },
    CanChannelSpec { id: 0x35F, period_ms: 2000, cacheable: true },
    CanChannelSpec { id: 0x370, period_ms: 2000, cacheable: true },
    CanChannelSpec { id: 0x371, period_ms: 2000, cacheable: true },
    CanChannelSpec { id: 0x372, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x373, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x374, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x375, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x376, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x377, period_ms: 1000, cacheable: true },
    CanChannelSpec { id: 0x378, period_ms: 1000, cacheable: false }, // energy counters: always transmit
    CanChannelSpec { id: 0x379, period_ms: 5000, cacheable: true },
    CanChannelSpec { id: 0x380, period_ms: 5000, cacheable: true },
    CanChannelSpec { id: 0x381, period_ms: 5000, cacheable: true },
    CanChannelSpec { id: 0x382, period_ms: 5000, cacheable: true },
];

const MANUFACTURER_NAME: &[u8] = b"Enepaq";
const BATTERY_NAME: &[u8] = b"Enepaq Battery";

fn ascii_chunk_8(full: &[u8], half: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    let start = half * 8;
    if start < full.len() {
        let end = (start + 8).min(full.len());
        out[..end - start].copy_from_slice(&full[start..end]);
    }
    out
}

pub fn encode_keepalive() -> [u8; 8] {
    [0u8; 8]
}

pub fn encode_0x351(cvl: &CvlOutput) -> [u8; 8] {
    let cvl_raw = (cvl.cvl_v * 10.0).round().clamp(0.0, u16::MAX as f32) as u16;
    let ccl_raw = (cvl.ccl_a * 10.0).round().clamp(0.0, u16::MAX as f32) as u16;
    let dcl_raw = (cvl.dcl_a * 10.0).round().clamp(0.0, u16::MAX as f32) as u16;
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&cvl_raw.to_le_bytes());
    out[2..4].copy_from_slice(&ccl_raw.to_le_bytes());
    out[4..6].copy_from_slice(&dcl_raw.to_le_bytes());
    out
}

pub fn encode_0x355(live: &LiveData) -> [u8; 8] {
    let soc_raw = (live.soc_pct * 100.0).round().clamp(0.0, u16::MAX as f32) as u16;
    let soh_raw = (live.soh_pct * 100.0).round().clamp(0.0, u16::MAX as f32) as u16;
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&soc_raw.to_le_bytes());
    out[2..4].copy_from_slice(&soh_raw.to_le_bytes());
    out[4..6].copy_from_slice(&soc_raw.to_le_bytes()); // hi-res SOC: no finer source available
    out
}

pub fn encode_0x356(live: &LiveData) -> [u8; 8] {
    let v_raw = (live.pack_v * 100.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let i_raw = (live.pack_a * 10.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let t_raw = (live.temp_internal_c.unwrap_or(0.0) * 10.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&v_raw.to_le_bytes());
    out[2..4].copy_from_slice(&i_raw.to_le_bytes());
    out[4..6].copy_from_slice(&t_raw.to_le_bytes());
    out
}

/// Two bits per condition: `00` unsupported, `01` OK, `10` active, `11`
/// reserved. All nine conditions are always "supported" in this gateway,
/// so only `01`/`10` are ever emitted.
fn pack_condition(word: &mut u32, slot: u32, active: bool) {
    let bits: u32 = if active { 0b10 } else { 0b01 };
    *word |= bits << (slot * 2);
}

pub fn encode_0x35a(live: &LiveData, cvl_cfg: &crate::config::CvlConfig, can_cfg: &CanConfig, cvl: &CvlOutput, peer_connected: bool) -> [u8; 8] {
    let max_cell_v = live.max_cell_mv() as f32 / 1000.0;
    let series = live.series_cells.max(1) as f32;
    // No separate pack OV/UV tunables exist; derive them from the CVL
    // ceiling/floor already in CvlConfig rather than adding new ones.
    let pack_ov_v = cvl_cfg.cell_max_v * series * 1.02;
    let pack_uv_v = cvl_cfg.cell_min_float_v * series * 0.85;

    let over_temp = live.temp_internal_c.map(|t| t >= can_cfg.over_temp_c).unwrap_or(false);
    let under_temp = live.temp_internal_c.map(|t| t <= can_cfg.under_temp_c).unwrap_or(false);
    let high_temp_charging = over_temp && live.pack_a > 0.0;
    let discharge_oc = live.pack_a < 0.0 && -live.pack_a >= cvl.dcl_a * can_cfg.overcurrent_fraction;
    let charge_oc = live.pack_a > 0.0 && live.pack_a >= cvl.ccl_a * can_cfg.overcurrent_fraction;
    let imbalance = live.imbalance_mv() >= can_cfg.imbalance_alarm_mv;
    let pack_ov = live.pack_v >= pack_ov_v;
    let pack_uv = live.pack_v <= pack_uv_v;
    let overall = pack_ov || pack_uv || over_temp || under_temp || discharge_oc || charge_oc || imbalance;

    let mut word = 0u32;
    pack_condition(&mut word, 0, overall);
    pack_condition(&mut word, 1, pack_ov);
    pack_condition(&mut word, 2, pack_uv);
    pack_condition(&mut word, 3, over_temp);
    pack_condition(&mut word, 4, under_temp);
    pack_condition(&mut word, 5, high_temp_charging);
    pack_condition(&mut word, 6, discharge_oc);
    pack_condition(&mut word, 7, charge_oc);
    pack_condition(&mut word, 8, imbalance);
    let _ = max_cell_v;

    let alarms = word;
    // The warning field mirrors the same conditions and additionally
    // carries the "system online" bit at byte 7 (== bit 26/27 of this word).
    // The exact alarm/warning byte split is ambiguous in the upstream
    // protocol; this follows the warning-side interpretation for the
    // online indicator.
    let mut warnings = word;
    let online_bits: u32 = if peer_connected { 0b01 } else { 0b00 };
    warnings = (warnings & !(0b11 << 26)) | (online_bits << 26);

    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&alarms.to_le_bytes());
    out[4..8].copy_from_slice(&warnings.to_le_bytes());
    out
}

pub fn encode_0x35e() -> [u8; 8] {
    ascii_chunk_8(MANUFACTURER_NAME, 0)
}

pub fn encode_0x35f(identity: &Identity) -> [u8; 8] {
    let capacity_raw = (identity.capacity_ah * 100.0).round().clamp(0.0, u32::MAX as f32) as u32;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&identity.fw_version.to_le_bytes());
    out[4..8].copy_from_slice(&capacity_raw.to_le_bytes());
    out
}

pub fn encode_0x370() -> [u8; 8] {
    ascii_chunk_8(BATTERY_NAME, 0)
}

pub fn encode_0x371() -> [u8; 8] {
    ascii_chunk_8(BATTERY_NAME, 1)
}

pub fn encode_0x372(live: &LiveData, cvl: &CvlOutput) -> [u8; 8] {
    let online = live.online_status != 0;
    let modules_online: u16 = if online { 1 } else { 0 };
    let modules_offline: u16 = if online { 0 } else { 1 };
    let modules_blocking_charge: u16 = if cvl.ccl_a <= 0.0 { 1 } else { 0 };
    let modules_blocking_discharge: u16 = if cvl.dcl_a <= 0.0 { 1 } else { 0 };
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&modules_online.to_le_bytes());
    out[2..4].copy_from_slice(&modules_offline.to_le_bytes());
    out[4..6].copy_from_slice(&modules_blocking_charge.to_le_bytes());
    out[6..8].copy_from_slice(&modules_blocking_discharge.to_le_bytes());
    out
}

pub fn encode_0x373(live: &LiveData) -> [u8; 8] {
    let (min_t, max_t) = min_max_temp_c(live);
    let min_t_raw = (min_t * 10.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let max_t_raw = (max_t * 10.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&live.min_cell_mv().to_le_bytes());
    out[2..4].copy_from_slice(&live.max_cell_mv().to_le_bytes());
    out[4..6].copy_from_slice(&min_t_raw.to_le_bytes());
    out[6..8].copy_from_slice(&max_t_raw.to_le_bytes());
    out
}

fn min_max_cell_index(live: &LiveData) -> (u8, u8) {
    let slice = &live.cell_mv[..live.series_cells.max(1)];
    let mut min_idx = 0u8;
    let mut max_idx = 0u8;
    let mut min_v = u16::MAX;
    let mut max_v = 0u16;
    for (i, &mv) in slice.iter().enumerate() {
        if mv == 0 {
            continue;
        }
        if mv < min_v {
            min_v = mv;
            min_idx = i as u8;
        }
        if mv > max_v {
            max_v = mv;
            max_idx = i as u8;
        }
    }
    (min_idx, max_idx)
}

/// Sensor index convention: `0` = internal, `1` = external 1, `2` =
/// external 2. Absent sensors are skipped; if every sensor is absent the
/// internal slot (`0`) is reported at `0.0`°C.
fn min_max_temp_c(live: &LiveData) -> (f32, f32) {
    let readings = [
        (0u8, live.temp_internal_c),
        (1u8, live.temp_ext1_c),
        (2u8, live.temp_ext2_c),
    ];
    let present: heapless::Vec<(u8, f32), 3> = readings
        .into_iter()
        .filter_map(|(idx, v)| v.map(|t| (idx, t)))
        .collect();
    if present.is_empty() {
        return (0.0, 0.0);
    }
    let min = present.iter().cloned().fold(present[0], |a, b| if b.1 < a.1 { b } else { a });
    let max = present.iter().cloned().fold(present[0], |a, b| if b.1 > a.1 { b } else { a });
    (min.1, max.1)
}

fn min_max_temp_idx(live: &LiveData) -> (u8, u8) {
    let readings = [
        (0u8, live.temp_internal_c),
        (1u8, live.temp_ext1_c),
        (2u8, live.temp_ext2_c),
    ];
    let present: heapless::Vec<(u8, f32), 3> = readings
        .into_iter()
        .filter_map(|(idx, v)| v.map(|t| (idx, t)))
        .collect();
    if present.is_empty() {
        return (0, 0);
    }
    let min = present.iter().cloned().fold(present[0], |a, b| if b.1 < a.1 { b } else { a });
    let max = present.iter().cloned().fold(present[0], |a, b| if b.1 > a.1 { b } else { a });
    (min.0, max.0)
}

pub fn encode_0x374(live: &LiveData) -> [u8; 8] {
    let (min_idx, _) = min_max_cell_index(live);
    let mut out = [0u8; 8];
    out[0] = 0; // module id: single-BMS gateway, always module 0
    out[1] = min_idx;
    out
}

pub fn encode_0x375(live: &LiveData) -> [u8; 8] {
    let (_, max_idx) = min_max_cell_index(live);
    let mut out = [0u8; 8];
    out[0] = 0;
    out[1] = max_idx;
    out
}

pub fn encode_0x376(live: &LiveData) -> [u8; 8] {
    let (min_idx, _) = min_max_temp_idx(live);
    let mut out = [0u8; 8];
    out[0] = 0;
    out[1] = min_idx;
    out
}

pub fn encode_0x377(live: &LiveData) -> [u8; 8] {
    let (_, max_idx) = min_max_temp_idx(live);
    let mut out = [0u8; 8];
    out[0] = 0;
    out[1] = max_idx;
    out
}

pub fn encode_0x378(energy: &EnergyCounters) -> [u8; 8] {
    let charged_raw = (energy.charged_wh / 100.0).round().clamp(0.0, u32::MAX as f64) as u32;
    let discharged_raw = (energy.discharged_wh / 100.0).round().clamp(0.0, u32::MAX as f64) as u32;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&charged_raw.to_le_bytes());
    out[4..8].copy_from_slice(&discharged_raw.to_le_bytes());
    out
}

pub fn encode_0x379(identity: &Identity) -> [u8; 8] {
    let capacity_raw = (identity.capacity_ah * 100.0).round().clamp(0.0, u32::MAX as f32) as u32;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&capacity_raw.to_le_bytes());
    out
}

pub fn encode_0x380(identity: &Identity) -> [u8; 8] {
    ascii_chunk_8(&identity.serial, 0)
}

pub fn encode_0x381(identity: &Identity) -> [u8; 8] {
    ascii_chunk_8(&identity.serial, 1)
}

pub fn encode_0x382(identity: &Identity) -> [u8; 8] {
    ascii_chunk_8(&identity.family, 0)
}

/// Returns `true` if bytes 4..6 of a received 0x307 handshake spell `"VIC"`
/// — the marker that signals a Victron peer has been detected.
pub fn is_victron_handshake(data: &[u8]) -> bool {
    data.len() >= 7 && &data[4..7] == b"VIC"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::cvl::CvlState;
    use crate::model::MAX_CELLS;

    fn sample_live() -> LiveData {
        let mut cell_mv = [0u16; MAX_CELLS];
        for (i, slot) in cell_mv.iter_mut().enumerate().take(16) {
            *slot = 3280 + i as u16;
        }
        LiveData {
            pack_v: 54.4,
            pack_a: 10.0,
            soc_pct: 50.0,
            soh_pct: 98.0,
            cell_mv,
            series_cells: 16,
            temp_internal_c: Some(23.5),
            temp_ext1_c: Some(20.0),
            temp_ext2_c: None,
            ccl_base_a: 50.0,
            dcl_base_a: 50.0,
            capacity_ah: 100.0,
            fw_version: 0x0102,
            online_status: 1,
        }
    }

    /// Worked example: a bulk CVL of 54.4 V encodes to 0x0220.
    #[test]
    fn scenario_one_0x351_matches_worked_example() {
        let cvl = CvlOutput { cvl_v: 54.4, ccl_a: 10.0, dcl_a: 10.0, state: CvlState::Bulk };
        let bytes = encode_0x351(&cvl);
        assert_eq!(&bytes[0..2], &[0x20, 0x02]);
    }

    #[test]
    fn encode_0x355_scales_soc_and_soh_to_centipercent() {
        let live = sample_live();
        let bytes = encode_0x355(&live);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 5000);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 9800);
    }

    #[test]
    fn encode_0x356_encodes_signed_current_and_voltage() {
        let mut live = sample_live();
        live.pack_a = -12.5;
        let bytes = encode_0x356(&live);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -125);
    }

    #[test]
    fn encode_0x35e_is_null_padded_enepaq() {
        let bytes = encode_0x35e();
        assert_eq!(&bytes[0..6], b"Enepaq");
        assert_eq!(bytes[6], 0);
        assert_eq!(bytes[7], 0);
    }

    #[test]
    fn battery_name_halves_concatenate_to_full_name() {
        let first = encode_0x370();
        let second = encode_0x371();
        let mut full = [0u8; 16];
        full[0..8].copy_from_slice(&first);
        full[8..16].copy_from_slice(&second);
        assert_eq!(&full[0..b"Enepaq Battery".len()], b"Enepaq Battery");
    }

    #[test]
    fn encode_0x378_divides_wh_counters_by_100() {
        let energy = EnergyCounters { charged_wh: 500.0, discharged_wh: 0.0 };
        let bytes = encode_0x378(&energy);
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 5);
    }

    #[test]
    fn handshake_detects_vic_marker() {
        let mut payload = [0u8; 8];
        payload[4..7].copy_from_slice(b"VIC");
        assert!(is_victron_handshake(&payload));
        assert!(!is_victron_handshake(&[0u8; 8]));
    }

    #[test]
    fn imbalance_alarm_flags_active_above_threshold() {
        let cfg = GatewayConfig::default();
        let mut live = sample_live();
        live.cell_mv[0] = 3280;
        live.cell_mv[1] = 3280 + 50; // 50 mV >= default 40 mV threshold
        let cvl = CvlOutput { cvl_v: 54.0, ccl_a: 10.0, dcl_a: 10.0, state: CvlState::Bulk };
        let bytes = encode_0x35a(&live, &cfg.cvl, &cfg.can, &cvl, true);
        let alarms = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        // bit slot 8 (imbalance) = bits 16-17.
        assert_eq!((alarms >> 16) & 0b11, 0b10);
    }

    #[test]
    fn system_online_bit_reflects_peer_connection() {
        let cfg = GatewayConfig::default();
        let live = sample_live();
        let cvl = CvlOutput { cvl_v: 54.0, ccl_a: 10.0, dcl_a: 10.0, state: CvlState::Bulk };
        let connected = encode_0x35a(&live, &cfg.cvl, &cfg.can, &cvl, true);
        let disconnected = encode_0x35a(&live, &cfg.cvl, &cfg.can, &cvl, false);
        assert_eq!((connected[7] >> 2) & 0b11, 0b01);
        assert_eq!((disconnected[7] >> 2) & 0b11, 0b00);
    }

    #[test]
    fn min_max_cell_identifiers_point_at_extremes() {
        let mut live = sample_live();
        live.cell_mv[3] = 3000; // lowest
        live.cell_mv[9] = 4000; // highest
        let min_bytes = encode_0x374(&live);
        let max_bytes = encode_0x375(&live);
        assert_eq!(min_bytes[1], 3);
        assert_eq!(max_bytes[1], 9);
    }
}
