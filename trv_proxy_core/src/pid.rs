//! Classic PID producing a delta on top of the room setpoint.
//!
//! Integration continues inside the deadband so the I term can hold the
//! valve slightly open at equilibrium; the deadband only labels the cycle.

use tracing::{debug, info};

use crate::cfg::{ControllerKind, PidConfig};
use crate::controller::{ControlInputs, Controller, ModeReason, RegulationResult};
use crate::error::Result;
use crate::state::{ControllerState, Mode, PidState};
use crate::temp::{clamp_target, round_tenth};

#[derive(Clone, Debug, Default)]
pub struct PidDeltaRegulator {
    cfg: PidConfig,
}

impl PidDeltaRegulator {
    pub fn new(cfg: PidConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PidConfig {
        &self.cfg
    }

    pub fn compute_target(&self, inputs: &ControlInputs, state: &mut PidState) -> Result<RegulationResult> {
        let inp = inputs.validate()?;
        let cfg = &self.cfg;
        let e = inp.setpoint_c - inp.room_temp_c;

        if !inp.heating_enabled {
            return Ok(RegulationResult {
                target_c: round_tenth(clamp_target(
                    inp.setpoint_c,
                    cfg.coast_target_c,
                    cfg.max_offset_c,
                    cfg.min_target_c,
                    cfg.max_target_c,
                )),
                mode: Mode::Coast,
                error_c: e,
                p_term_c: 0.0,
                i_term_c: state.integral_c,
                bias_c: 0.0,
                trend_c_per_s: 0.0,
                predicted_temp_c: None,
                reason: ModeReason::HeatingDisabled,
                raw_target_c: cfg.coast_target_c,
                window_latch_triggered: false,
            });
        }

        let dt = inp.time_delta_s.max(1.0);

        let p = cfg.kp * e;

        let integral = (state.integral_c + cfg.ki * e * (dt / 60.0))
            .max(cfg.integral_min_c)
            .min(cfg.integral_max_c);

        let raw_derivative = match state.last_error_c {
            Some(prev) => (e - prev) / dt,
            None => 0.0,
        };
        let a = cfg.derivative_alpha;
        let derivative_ema = a * raw_derivative + (1.0 - a) * state.derivative_ema_c;
        let d = cfg.kd * derivative_ema;

        let delta = (p + integral + d).max(-cfg.max_delta_c).min(cfg.max_delta_c);
        let raw_target = inp.setpoint_c + delta;
        let target = round_tenth(clamp_target(
            inp.setpoint_c,
            raw_target,
            cfg.max_offset_c,
            cfg.min_target_c,
            cfg.max_target_c,
        ));

        let reason = if e.abs() < cfg.deadband_c { ModeReason::PidDeadband } else { ModeReason::PidActive };

        state.last_error_c = Some(e);
        state.integral_c = integral;
        state.derivative_ema_c = derivative_ema;

        debug!(
            error_c = e,
            p_term_c = p,
            i_term_c = integral,
            d_term_c = d,
            delta_c = delta,
            target_c = target,
            "pid regulation"
        );

        Ok(RegulationResult {
            target_c: target,
            mode: Mode::Hold,
            error_c: e,
            p_term_c: p,
            i_term_c: integral,
            bias_c: 0.0,
            trend_c_per_s: 0.0,
            predicted_temp_c: None,
            reason,
            raw_target_c: raw_target,
            window_latch_triggered: false,
        })
    }
}

impl Controller for PidDeltaRegulator {
    fn kind(&self) -> ControllerKind {
        ControllerKind::PidDelta
    }

    fn compute(&self, inputs: &ControlInputs, state: &mut ControllerState) -> Result<RegulationResult> {
        let inputs = inputs.validate()?;
        if let ControllerState::PidDelta(s) = state {
            return self.compute_target(&inputs, s);
        }
        info!("controller switched to pid_delta; starting from a fresh state");
        let mut fresh = PidState::default();
        let res = self.compute_target(&inputs, &mut fresh);
        *state = ControllerState::PidDelta(fresh);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p_only() -> PidDeltaRegulator {
        PidDeltaRegulator::new(PidConfig { ki: 0.0, kd: 0.0, kp: 2.0, ..Default::default() })
    }

    #[test]
    fn proportional_delta_on_setpoint() {
        let mut st = PidState::default();
        let res = p_only().compute_target(&ControlInputs::new(20.0, 19.5, 60.0, 0.0), &mut st).unwrap();
        assert_eq!(res.target_c, 21.0);
        assert_eq!(res.reason, ModeReason::PidActive);
    }

    #[test]
    fn delta_is_clamped() {
        let mut st = PidState::default();
        let res = p_only().compute_target(&ControlInputs::new(20.0, 15.0, 60.0, 0.0), &mut st).unwrap();
        assert_eq!(res.target_c, 24.0);
    }

    #[test]
    fn integrates_inside_deadband() {
        let r = PidDeltaRegulator::new(PidConfig { kd: 0.0, ..Default::default() });
        let mut st = PidState::default();
        let res = r.compute_target(&ControlInputs::new(20.0, 19.9, 60.0, 0.0), &mut st).unwrap();
        assert_eq!(res.reason, ModeReason::PidDeadband);
        assert!(st.integral_c > 0.0);
    }

    #[test]
    fn integral_is_clamped() {
        let r = PidDeltaRegulator::new(PidConfig { ki: 10.0, kd: 0.0, ..Default::default() });
        let mut st = PidState::default();
        for _ in 0..10 {
            r.compute_target(&ControlInputs::new(20.0, 18.0, 600.0, 0.0), &mut st).unwrap();
        }
        assert_eq!(st.integral_c, 2.0);
    }

    #[test]
    fn first_sample_has_no_derivative_kick() {
        let r = PidDeltaRegulator::new(PidConfig { kp: 0.0, ki: 0.0, ..Default::default() });
        let mut st = PidState::default();
        let res = r.compute_target(&ControlInputs::new(20.0, 18.0, 60.0, 0.0), &mut st).unwrap();
        assert_eq!(res.target_c, 20.0);
        assert_eq!(st.derivative_ema_c, 0.0);
    }

    #[test]
    fn heating_disabled_coasts_and_freezes() {
        let mut st = PidState { integral_c: 1.0, ..Default::default() };
        let res = PidDeltaRegulator::default()
            .compute_target(&ControlInputs::new(20.0, 18.0, 60.0, 0.0).heating(false), &mut st)
            .unwrap();
        assert_eq!(res.mode, Mode::Coast);
        // Coast target 5.0 is held at setpoint - max_offset.
        assert_eq!(res.target_c, 12.0);
        assert_eq!(st.integral_c, 1.0);
        assert_eq!(st.last_error_c, None);
    }
}
