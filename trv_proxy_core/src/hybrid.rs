//! Hybrid regulator: slow bias estimator, fast P (+ small I) response and a
//! BOOST / HOLD / COAST state machine with hysteresis.
//!
//! The output is an absolute actuator target. Whether and how that target is
//! transmitted is decided by [`crate::policy::CommandPolicy`].

use tracing::{debug, info};

use crate::cfg::{ControllerKind, RegulatorConfig};
use crate::controller::{ControlInputs, Controller, ModeReason, RegulationResult};
use crate::error::Result;
use crate::state::{ControllerState, Mode, RegulatorState};
use crate::temp::{clamp_target, round_tenth};

#[derive(Clone, Debug, Default)]
pub struct HybridRegulator {
    cfg: RegulatorConfig,
}

impl HybridRegulator {
    pub fn new(cfg: RegulatorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RegulatorConfig {
        &self.cfg
    }

    /// Compute the desired absolute actuator target and evolve `state`.
    ///
    /// Non-finite inputs are rejected before anything in `state` changes.
    pub fn compute_target(&self, inputs: &ControlInputs, state: &mut RegulatorState) -> Result<RegulationResult> {
        let inp = inputs.validate()?;
        let cfg = &self.cfg;
        let dt = inp.time_delta_s;
        let now = inp.now_s;
        let sp = inp.setpoint_c;
        let room = inp.room_temp_c;

        let e = sp - room;
        let trend = self.update_trend(room, dt, state);

        if !inp.heating_enabled {
            let target = self.clamp_corrective(sp, cfg.coast_target_c);
            self.transition(state, Mode::Coast, ModeReason::HeatingDisabled, now);
            state.trend_c_per_s = trend;
            state.last_room_temp_c = Some(room);
            return Ok(RegulationResult {
                target_c: target,
                mode: Mode::Coast,
                error_c: e,
                p_term_c: 0.0,
                i_term_c: state.i_small_c,
                bias_c: state.bias_c,
                trend_c_per_s: trend,
                predicted_temp_c: None,
                reason: ModeReason::HeatingDisabled,
                raw_target_c: cfg.coast_target_c,
                window_latch_triggered: false,
            });
        }

        // Trend latch: forces COAST ahead of the mode machine.
        let mut latch_until = state.window_latch_until_s;
        let mut latch_triggered = false;
        let mut forced = None;
        if cfg.window_latch_enabled {
            if state.window_latch_active(now) {
                forced = Some(ModeReason::WindowOpenActive);
            } else if state.last_room_temp_c.is_some()
                && dt > 0.0
                && trend <= cfg.window_open_drop_threshold_c_per_min / 60.0
            {
                latch_until = now + cfg.window_open_hold_minutes * 60.0;
                latch_triggered = true;
                forced = Some(ModeReason::WindowOpenDetected);
            }
        }

        let predicted = (cfg.predict_horizon_s > 0.0).then(|| room + trend * cfg.predict_horizon_s);

        let (mode, reason) = match forced {
            Some(r) => (Mode::Coast, r),
            None => self.decide_mode(sp, e, trend, predicted, state, now),
        };

        let bias = if mode == Mode::Hold && dt > 0.0 {
            self.update_bias(state.bias_c, e, trend, dt)
        } else {
            state.bias_c
        };

        let base = sp + bias;
        let p_term = cfg.kp * e;
        let i_prev = state.i_small_c;

        let (raw_target, target, i_next) = match mode {
            Mode::Boost => {
                let raw = (sp + cfg.boost_floor_offset_c).max(base + p_term);
                (raw, self.clamp_corrective(sp, raw), i_prev)
            }
            Mode::Coast => {
                let raw = cfg.coast_target_c;
                (raw, self.clamp_corrective(sp, raw), i_prev)
            }
            Mode::Hold => {
                let tentative = if cfg.ki_small > 0.0 && dt > 0.0 {
                    (i_prev + cfg.ki_small * e * dt).max(cfg.i_small_min_c).min(cfg.i_small_max_c)
                } else {
                    i_prev
                };
                let raw = base + p_term + tentative;
                let bounded = clamp_target(sp, raw, cfg.max_offset_c, cfg.min_target_c, cfg.max_target_c);
                if bounded != raw {
                    // Saturated: keep the previous integral (anti-windup).
                    let raw = base + p_term + i_prev;
                    (raw, self.clamp_corrective(sp, raw), i_prev)
                } else {
                    (raw, round_tenth(bounded), tentative)
                }
            }
        };

        self.transition(state, mode, reason, now);
        state.bias_c = bias;
        state.i_small_c = i_next;
        state.trend_c_per_s = trend;
        state.last_room_temp_c = Some(room);
        state.window_latch_until_s = latch_until;

        debug!(
            mode = mode.as_str(),
            reason = reason.as_str(),
            setpoint_c = sp,
            room_c = room,
            error_c = e,
            bias_c = bias,
            i_small_c = i_next,
            trend_c_per_min = trend * 60.0,
            raw_target_c = raw_target,
            target_c = target,
            "hybrid regulation"
        );

        Ok(RegulationResult {
            target_c: target,
            mode,
            error_c: e,
            p_term_c: p_term,
            i_term_c: i_next,
            bias_c: bias,
            trend_c_per_s: trend,
            predicted_temp_c: predicted,
            reason,
            raw_target_c: raw_target,
            window_latch_triggered: latch_triggered,
        })
    }

    fn transition(&self, state: &mut RegulatorState, mode: Mode, reason: ModeReason, now: f64) {
        let from = state.mode;
        if state.enter(mode, now) {
            info!(from = from.as_str(), to = mode.as_str(), reason = reason.as_str(), "hybrid mode transition");
        }
    }

    #[inline]
    fn clamp_corrective(&self, sp: f64, raw: f64) -> f64 {
        let cfg = &self.cfg;
        round_tenth(clamp_target(sp, raw, cfg.max_offset_c, cfg.min_target_c, cfg.max_target_c))
    }

    /// EMA of dT/dt in °C/s. Unchanged without a previous sample or elapsed time.
    fn update_trend(&self, room: f64, dt: f64, state: &RegulatorState) -> f64 {
        match state.last_room_temp_c {
            Some(prev) if dt > 0.0 => {
                let raw = (room - prev) / dt;
                let a = self.cfg.trend_alpha;
                a * raw + (1.0 - a) * state.trend_c_per_s
            }
            _ => state.trend_c_per_s,
        }
    }

    /// Slow offset learning, only near steady state.
    fn update_bias(&self, bias: f64, e: f64, trend: f64, dt: f64) -> f64 {
        let cfg = &self.cfg;
        if e.abs() > cfg.bias_deadband_c {
            return bias;
        }
        if (trend * 60.0).abs() > cfg.bias_trend_max_c_per_min {
            return bias;
        }

        let alpha = if cfg.bias_tau_s > 0.0 { (dt / cfg.bias_tau_s).min(1.0) } else { 0.0 };
        let desired = (bias + alpha * e).max(cfg.bias_min_c).min(cfg.bias_max_c);

        let max_step = cfg.bias_rate_limit_c_per_h / 3600.0 * dt;
        desired.max(bias - max_step).min(bias + max_step)
    }

    fn decide_mode(
        &self,
        sp: f64,
        e: f64,
        trend: f64,
        predicted: Option<f64>,
        state: &RegulatorState,
        now: f64,
    ) -> (Mode, ModeReason) {
        let cfg = &self.cfg;
        let drop_thr = cfg.trend_drop_threshold_c_per_min / 60.0;
        let rise_thr = cfg.trend_rise_threshold_c_per_min / 60.0;

        match state.mode {
            Mode::Boost => {
                let elapsed_min = (now - state.mode_entered_s).max(0.0) / 60.0;
                if elapsed_min >= cfg.boost_max_minutes {
                    (Mode::Hold, ModeReason::BoostTimeout)
                } else if e <= cfg.boost_error_off_c && trend > drop_thr {
                    (Mode::Hold, ModeReason::BoostRecovered)
                } else {
                    (Mode::Boost, ModeReason::BoostActive)
                }
            }
            Mode::Coast => {
                if e >= cfg.coast_error_off_c {
                    (Mode::Hold, ModeReason::CoastRecovered)
                } else {
                    (Mode::Coast, ModeReason::CoastActive)
                }
            }
            Mode::Hold => {
                let overshoot = predicted.is_some_and(|p| p >= sp + cfg.overshoot_margin_c);
                if e <= cfg.coast_error_on_c || overshoot {
                    (Mode::Coast, ModeReason::CoastEnter)
                } else if e >= cfg.boost_error_on_c || trend <= drop_thr {
                    (Mode::Boost, ModeReason::BoostEnter)
                } else if e.abs() <= cfg.hold_deadband_c && trend >= rise_thr {
                    (Mode::Hold, ModeReason::HoldNearTargetRising)
                } else {
                    (Mode::Hold, ModeReason::HoldNormal)
                }
            }
        }
    }
}

impl Controller for HybridRegulator {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Hybrid
    }

    fn compute(&self, inputs: &ControlInputs, state: &mut ControllerState) -> Result<RegulationResult> {
        let inputs = inputs.validate()?;
        if let ControllerState::Hybrid(s) = state {
            return self.compute_target(&inputs, s);
        }
        info!("controller switched to hybrid; starting from a fresh state");
        let mut fresh = RegulatorState {
            mode_entered_s: inputs.now_s,
            ..RegulatorState::default()
        };
        let res = self.compute_target(&inputs, &mut fresh);
        *state = ControllerState::Hybrid(fresh);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> HybridRegulator {
        HybridRegulator::new(RegulatorConfig::default())
    }

    #[test]
    fn trend_is_unchanged_without_previous_sample() {
        let r = reg();
        let st = RegulatorState { trend_c_per_s: 0.001, ..Default::default() };
        assert_eq!(r.update_trend(20.0, 60.0, &st), 0.001);
        let st = RegulatorState { last_room_temp_c: Some(19.0), trend_c_per_s: 0.001, ..Default::default() };
        assert_eq!(r.update_trend(20.0, 0.0, &st), 0.001);
    }

    #[test]
    fn trend_blends_raw_slope() {
        let r = reg();
        let st = RegulatorState { last_room_temp_c: Some(20.0), ..Default::default() };
        let t = r.update_trend(20.6, 60.0, &st);
        assert!((t - 0.25 * 0.01).abs() < 1e-12);
    }

    #[test]
    fn bias_frozen_outside_deadband() {
        let r = reg();
        assert_eq!(r.update_bias(0.3, 0.5, 0.0, 60.0), 0.3);
        // Trend too steep (0.02 °C/min > 0.01 °C/min).
        assert_eq!(r.update_bias(0.3, 0.05, 0.02 / 60.0, 60.0), 0.3);
    }

    #[test]
    fn bias_step_is_rate_limited() {
        let cfg = RegulatorConfig { bias_tau_s: 1.0, ..Default::default() };
        let r = HybridRegulator::new(cfg);
        // alpha = 1, so the unlimited step would be the full error.
        let b = r.update_bias(0.0, 0.1, 0.0, 60.0);
        let max_step = 0.5 / 3600.0 * 60.0;
        assert!((b - max_step).abs() < 1e-12);
    }

    #[test]
    fn boost_target_uses_relative_floor() {
        let r = reg();
        let mut st = RegulatorState { mode: Mode::Boost, ..Default::default() };
        // Small error keeps BOOST (0.5 > boost_error_off 0.2); P term 2.5 < floor 3.0.
        let res = r.compute_target(&ControlInputs::new(20.0, 19.5, 0.0, 10.0), &mut st).unwrap();
        assert_eq!(res.mode, Mode::Boost);
        assert_eq!(res.target_c, 23.0);
    }

    #[test]
    fn overshoot_prediction_enters_coast() {
        let r = reg();
        let mut st = RegulatorState {
            last_room_temp_c: Some(20.8),
            trend_c_per_s: 0.05 / 60.0,
            ..Default::default()
        };
        let res = r.compute_target(&ControlInputs::new(21.0, 20.9, 60.0, 60.0), &mut st).unwrap();
        assert_eq!(res.mode, Mode::Coast);
        assert_eq!(res.reason, ModeReason::CoastEnter);
        assert!(res.predicted_temp_c.unwrap() > 21.2);
    }
}
