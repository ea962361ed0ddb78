//! Core B.1 — the charge-voltage-limit state machine. Pure in the sense
//! that every tick is recomputed fresh from `LiveData` and the current
//! config; the only state carried between ticks is the three hysteresis
//! latches and the previous tick's `cvl_v`.
//!
//! `CvlController` itself never touches the event bus — it's called from
//! the CAN publisher (Core B.3), which is in the better position to decide
//! when a state transition is worth an `Event::CvlStateChanged`. The CVL is
//! recomputed once per tick, before any 0x351-dependent frame is encoded.

use crate::config::CvlConfig;
use crate::model::LiveData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CvlState {
    Bulk,
    Transition,
    FloatApproach,
    Float,
    ImbalanceHold,
    Sustain,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CvlOutput {
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub state: CvlState,
}

/// Persists the hysteresis latches and the previous tick's output across
/// calls to [`CvlController::tick`]. Reset only on an explicit operator
/// command, via [`CvlController::reset`].
pub struct CvlController {
    cfg: CvlConfig,
    previous_cvl_v: f32,
    cell_protection_active: bool,
    imbalance_hold_active: bool,
    sustain_active: bool,
    last_output: CvlOutput,
}

impl CvlController {
    pub fn new(cfg: CvlConfig) -> Self {
        let initial = CvlOutput {
            cvl_v: cfg.bulk_target_v,
            ccl_a: 0.0,
            dcl_a: 0.0,
            state: CvlState::Bulk,
        };
        Self {
            cfg,
            previous_cvl_v: cfg.bulk_target_v,
            cell_protection_active: false,
            imbalance_hold_active: false,
            sustain_active: false,
            last_output: initial,
        }
    }

    pub fn last_output(&self) -> CvlOutput {
        self.last_output
    }

    /// The live configuration, read back by the CAN publisher for the
    /// alarm-threshold derivations in the 0x35A encoder.
    pub fn config(&self) -> CvlConfig {
        self.cfg
    }

    /// Replaces the live configuration. Takes effect on the next tick; the
    /// hysteresis latches and `previous_cvl_v` are left as-is so a config
    /// reload doesn't itself look like a voltage step.
    pub fn set_config(&mut self, cfg: CvlConfig) -> Result<(), crate::error::GatewayError> {
        if !(cfg.cell_max_v > cfg.cell_min_float_v && cfg.cell_max_v > 0.0) {
            return Err(crate::error::GatewayError::InvalidArgument);
        }
        self.cfg = cfg;
        Ok(())
    }

    /// Drops every hysteresis latch and reseeds `previous_cvl_v` at the bulk
    /// target. Called only on an explicit operator command.
    pub fn reset(&mut self) {
        self.cell_protection_active = false;
        self.imbalance_hold_active = false;
        self.sustain_active = false;
        self.previous_cvl_v = self.cfg.bulk_target_v;
    }

    /// Recomputes `CvlOutput` from `live` and the controller's own
    /// persistent latches. Every invariant — the ceiling clamp, the
    /// floor-while-protected clamp, the anti-oscillation step limit, and
    /// the Sustain > ImbalanceHold > SOC priority — holds for every call,
    /// independent of call history beyond the three latches.
    pub fn tick(&mut self, live: &LiveData) -> CvlOutput {
        let cfg = &self.cfg;
        let series = live.series_cells.max(1) as f32;
        let min_float_v = cfg.cell_min_float_v * series;
        let ceiling_v = cfg.cell_max_v * series;

        // Hysteresis latches, each independent of the others.
        if self.sustain_active {
            if live.soc_pct >= cfg.sustain_soc_exit_pct {
                self.sustain_active = false;
            }
        } else if live.soc_pct <= cfg.sustain_soc_entry_pct {
            self.sustain_active = true;
        }

        let imbalance_mv = live.imbalance_mv();
        if self.imbalance_hold_active {
            if imbalance_mv <= cfg.imbalance_release_threshold_mv {
                self.imbalance_hold_active = false;
            }
        } else if imbalance_mv > cfg.imbalance_hold_threshold_mv {
            self.imbalance_hold_active = true;
        }

        let max_cell_mv = live.max_cell_mv();
        if self.cell_protection_active {
            if max_cell_mv <= cfg.cell_safety_release_mv {
                self.cell_protection_active = false;
            }
        } else if max_cell_mv >= cfg.cell_safety_threshold_mv {
            self.cell_protection_active = true;
        }

        // Priority order: Sustain > ImbalanceHold > SOC-driven state.
        let soc_state = if live.soc_pct < cfg.bulk_soc_threshold_pct {
            CvlState::Bulk
        } else if live.soc_pct < cfg.transition_soc_threshold_pct {
            CvlState::Transition
        } else if live.soc_pct < cfg.float_soc_threshold_pct {
            CvlState::FloatApproach
        } else {
            CvlState::Float
        };

        let state = if self.sustain_active {
            CvlState::Sustain
        } else if self.imbalance_hold_active {
            CvlState::ImbalanceHold
        } else {
            soc_state
        };

        let mut target_v = match state {
            CvlState::Bulk | CvlState::Transition | CvlState::FloatApproach => cfg.bulk_target_v,
            CvlState::Float => cfg.float_voltage_v,
            CvlState::Sustain => cfg.sustain_voltage_v,
            CvlState::ImbalanceHold => {
                let over_mv = imbalance_mv.saturating_sub(cfg.imbalance_hold_threshold_mv) as f32;
                let drop = (over_mv * cfg.drop_per_mv_v).min(cfg.imbalance_drop_max_v);
                (cfg.bulk_target_v - drop).max(min_float_v)
            }
        };

        // Fast-reacting cell-overvoltage guard, independent of state.
        if self.cell_protection_active {
            let max_cell_v = max_cell_mv as f32 / 1000.0;
            let threshold_v = cfg.cell_safety_threshold_mv as f32 / 1000.0;
            let reduction = (cfg.kp * (1.0 + live.pack_a / cfg.nominal_current_a) * (max_cell_v - threshold_v))
                .max(0.0)
                .min(cfg.imbalance_drop_max_v);
            target_v = (target_v - reduction).max(min_float_v);
        }

        // Anti-oscillation: increases capped, decreases unlimited.
        if target_v > self.previous_cvl_v {
            target_v = target_v.min(self.previous_cvl_v + cfg.max_recovery_step_v);
        }

        // Ultimate ceiling.
        target_v = target_v.min(ceiling_v);

        let (ccl_a, dcl_a) = match state {
            CvlState::Sustain => (live.ccl_base_a.min(cfg.sustain_ccl_a), live.dcl_base_a.min(cfg.sustain_dcl_a)),
            CvlState::Float | CvlState::ImbalanceHold => (live.ccl_base_a.min(cfg.minimum_ccl_in_float_a), live.dcl_base_a),
            _ => (live.ccl_base_a, live.dcl_base_a),
        };

        self.previous_cvl_v = target_v;
        let output = CvlOutput {
            cvl_v: target_v,
            ccl_a,
            dcl_a,
            state,
        };
        self.last_output = output;
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MAX_CELLS;

    fn live_with(soc_pct: f32, cell_mv: [u16; MAX_CELLS], series: usize, pack_a: f32) -> LiveData {
        LiveData {
            pack_v: 51.2,
            pack_a,
            soc_pct,
            soh_pct: 100.0,
            cell_mv,
            series_cells: series,
            temp_internal_c: Some(25.0),
            temp_ext1_c: None,
            temp_ext2_c: None,
            ccl_base_a: 50.0,
            dcl_base_a: 50.0,
            capacity_ah: 100.0,
            fw_version: 1,
            online_status: 1,
        }
    }

    fn flat_cells(mv: u16, n: usize) -> [u16; MAX_CELLS] {
        let mut c = [0u16; MAX_CELLS];
        for slot in c.iter_mut().take(n) {
            *slot = mv;
        }
        c
    }

    /// Scenario 1: SOC 50%, no imbalance, charging — Bulk, target = bulk_target_v.
    #[test]
    fn scenario_bulk_targets_bulk_voltage() {
        let cfg = CvlConfig::default();
        let mut ctl = CvlController::new(cfg);
        let live = live_with(50.0, flat_cells(3280, 16), 16, 10.0);
        let out = ctl.tick(&live);
        assert_eq!(out.state, CvlState::Bulk);
        assert!((out.cvl_v - cfg.bulk_target_v).abs() < 0.01);
    }

    /// Scenario 2: SOC 97% — Float, CVL below bulk, CCL capped.
    #[test]
    fn scenario_float_caps_ccl_and_lowers_voltage() {
        let cfg = CvlConfig::default();
        let mut ctl = CvlController::new(cfg);
        // Let the anti-oscillation ramp settle from bulk down to float.
        let live = live_with(97.0, flat_cells(3280, 16), 16, 2.0);
        let mut out = ctl.tick(&live);
        for _ in 0..50 {
            out = ctl.tick(&live);
        }
        assert_eq!(out.state, CvlState::Float);
        assert!(out.cvl_v < cfg.bulk_target_v);
        assert!(out.ccl_a <= cfg.minimum_ccl_in_float_a);
    }

    /// Scenario 3: imbalance enters hold at 50 mV from a 20 mV baseline.
    #[test]
    fn scenario_imbalance_hold_drops_voltage_and_caps_ccl() {
        let cfg = CvlConfig::default();
        let mut ctl = CvlController::new(cfg);
        let mut cells = flat_cells(3280, 16);
        cells[0] = 3280 + 50; // 50 mV imbalance
        let live = live_with(50.0, cells, 16, 2.0);
        let out = ctl.tick(&live);
        assert_eq!(out.state, CvlState::ImbalanceHold);
        let expected_drop = ((50u16.saturating_sub(cfg.imbalance_hold_threshold_mv)) as f32 * cfg.drop_per_mv_v)
            .min(cfg.imbalance_drop_max_v);
        let min_float_v = cfg.cell_min_float_v * 16.0;
        let expected = (cfg.bulk_target_v - expected_drop).max(min_float_v);
        assert!((out.cvl_v - expected).abs() < 0.01);
        assert!(out.ccl_a <= cfg.minimum_ccl_in_float_a);
    }

    /// Scenario 4: SOC drops to 28% — Sustain; stays in Sustain until 40%.
    #[test]
    fn scenario_sustain_has_hysteresis() {
        let cfg = CvlConfig::default();
        let mut ctl = CvlController::new(cfg);
        let cells = flat_cells(3200, 16);
        let low = live_with(28.0, cells, 16, -5.0);
        let out = ctl.tick(&low);
        assert_eq!(out.state, CvlState::Sustain);
        assert!((out.cvl_v - cfg.sustain_voltage_v).abs() < cfg.max_recovery_step_v + 0.01);
        assert!(out.ccl_a <= cfg.sustain_ccl_a);
        assert!(out.dcl_a <= cfg.sustain_dcl_a);

        // Rising to 35% must stay in Sustain (below the 40% exit threshold).
        let mid = live_with(35.0, cells, 16, -5.0);
        let out = ctl.tick(&mid);
        assert_eq!(out.state, CvlState::Sustain);

        // Crossing the exit threshold releases Sustain.
        let released = live_with(41.0, cells, 16, -5.0);
        let out = ctl.tick(&released);
        assert_ne!(out.state, CvlState::Sustain);
    }

    /// Scenario 5: cell overvoltage protection reduces CVL per the kp
    /// formula, capped and floored.
    #[test]
    fn scenario_cell_protection_reduces_cvl() {
        let mut cfg = CvlConfig::default();
        cfg.cell_safety_threshold_mv = 3600;
        cfg.kp = 5.0;
        cfg.nominal_current_a = 100.0;
        let mut ctl = CvlController::new(cfg);
        let mut cells = flat_cells(3500, 16);
        cells[3] = 3620;
        let live = live_with(60.0, cells, 16, 20.0);
        let out = ctl.tick(&live);

        let expected_reduction = (cfg.kp * (1.0 + 20.0 / 100.0) * (3.620 - 3.600))
            .min(cfg.imbalance_drop_max_v);
        let min_float_v = cfg.cell_min_float_v * 16.0;
        let expected = (cfg.bulk_target_v - expected_reduction).max(min_float_v);
        assert!((out.cvl_v - expected).abs() < 0.01);
    }

    /// Property: cvl never exceeds the ceiling, never drops below the floor
    /// while protection is active, and never increases faster than the
    /// configured recovery step.
    #[test]
    fn property_cvl_monotonic_safety() {
        let cfg = CvlConfig::default();
        let mut ctl = CvlController::new(cfg);
        let mut prev = cfg.bulk_target_v;
        let socs = [10.0, 40.0, 60.0, 85.0, 93.0, 97.0, 99.0, 50.0, 20.0];
        for &soc in &socs {
            let live = live_with(soc, flat_cells(3300, 16), 16, 5.0);
            let out = ctl.tick(&live);
            assert!(out.cvl_v <= cfg.cell_max_v * 16.0 + 1e-4);
            if out.cvl_v > prev {
                assert!(out.cvl_v <= prev + cfg.max_recovery_step_v + 1e-4);
            }
            prev = out.cvl_v;
        }
    }

    /// Property: state priority is Sustain > ImbalanceHold > SOC-driven for
    /// every combination of inputs, table-driven over representative cases.
    #[test]
    fn property_state_priority_table() {
        let cfg = CvlConfig::default();
        struct Case {
            soc: f32,
            imbalance_mv: u16,
            expect: CvlState,
        }
        let cases = [
            Case { soc: 25.0, imbalance_mv: 60, expect: CvlState::Sustain },
            Case { soc: 50.0, imbalance_mv: 60, expect: CvlState::ImbalanceHold },
            Case { soc: 50.0, imbalance_mv: 0, expect: CvlState::Bulk },
            Case { soc: 85.0, imbalance_mv: 0, expect: CvlState::Transition },
            Case { soc: 92.0, imbalance_mv: 0, expect: CvlState::FloatApproach },
            Case { soc: 99.0, imbalance_mv: 0, expect: CvlState::Float },
        ];
        for case in cases {
            let mut ctl = CvlController::new(cfg);
            let mut cells = flat_cells(3300, 16);
            cells[0] = 3300 + case.imbalance_mv;
            let live = live_with(case.soc, cells, 16, 1.0);
            let out = ctl.tick(&live);
            assert_eq!(out.state, case.expect, "soc={} imbalance={}", case.soc, case.imbalance_mv);
        }
    }

    #[test]
    fn reset_clears_latches_and_reseeds_previous_cvl() {
        let cfg = CvlConfig::default();
        let mut ctl = CvlController::new(cfg);
        let sustain_live = live_with(20.0, flat_cells(3300, 16), 16, -2.0);
        ctl.tick(&sustain_live);
        assert!(ctl.sustain_active);
        ctl.reset();
        assert!(!ctl.sustain_active);
        assert_eq!(ctl.previous_cvl_v, cfg.bulk_target_v);
    }

    #[test]
    fn set_config_rejects_invalid_voltage_ordering() {
        let mut ctl = CvlController::new(CvlConfig::default());
        let mut bad = CvlConfig::default();
        bad.cell_max_v = 3.0;
        bad.cell_min_float_v = 3.2;
        assert!(ctl.set_config(bad).is_err());
    }
}
