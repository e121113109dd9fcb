//! Controller capability shared by the hybrid and PID-delta strategies.

use serde::{Deserialize, Serialize};

use crate::cfg::{ControllerConfig, ControllerKind};
use crate::error::{CoreError, Result};
use crate::hybrid::HybridRegulator;
use crate::pid::PidDeltaRegulator;
use crate::state::{ControllerState, Mode};

/// One cycle's worth of controller inputs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlInputs {
    pub setpoint_c: f64,
    pub room_temp_c: f64,
    pub time_delta_s: f64,
    pub heating_enabled: bool,
    /// Caller's monotonic clock, seconds.
    pub now_s: f64,
}

impl ControlInputs {
    pub fn new(setpoint_c: f64, room_temp_c: f64, time_delta_s: f64, now_s: f64) -> Self {
        Self {
            setpoint_c,
            room_temp_c,
            time_delta_s,
            heating_enabled: true,
            now_s,
        }
    }

    pub fn heating(mut self, enabled: bool) -> Self {
        self.heating_enabled = enabled;
        self
    }

    /// Reject non-finite values; clamp a negative `dt` to zero.
    pub fn validate(&self) -> Result<ControlInputs> {
        let checks = [
            ("setpoint_c", self.setpoint_c),
            ("room_temp_c", self.room_temp_c),
            ("time_delta_s", self.time_delta_s),
            ("now_s", self.now_s),
        ];
        for (field, value) in checks {
            if !value.is_finite() {
                return Err(CoreError::NonFiniteInput { field, value });
            }
        }
        Ok(ControlInputs {
            time_delta_s: self.time_delta_s.max(0.0),
            ..*self
        })
    }
}

/// Why the controller picked its mode this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeReason {
    HeatingDisabled,
    WindowOpenDetected,
    WindowOpenActive,
    BoostTimeout,
    BoostRecovered,
    BoostActive,
    BoostEnter,
    CoastRecovered,
    CoastActive,
    CoastEnter,
    HoldNearTargetRising,
    HoldNormal,
    PidActive,
    PidDeadband,
}

impl ModeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeatingDisabled => "heating_disabled",
            Self::WindowOpenDetected => "window_open_detected",
            Self::WindowOpenActive => "window_open_active",
            Self::BoostTimeout => "boost_timeout",
            Self::BoostRecovered => "boost_recovered",
            Self::BoostActive => "boost_active",
            Self::BoostEnter => "boost_enter",
            Self::CoastRecovered => "coast_recovered",
            Self::CoastActive => "coast_active",
            Self::CoastEnter => "coast_enter",
            Self::HoldNearTargetRising => "hold_near_target_rising",
            Self::HoldNormal => "hold_normal",
            Self::PidActive => "pid_active",
            Self::PidDeadband => "pid_deadband",
        }
    }
}

impl std::fmt::Display for ModeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one regulation cycle. Consumed by the command policy and
/// telemetry, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegulationResult {
    /// Clamped and rounded absolute actuator target.
    pub target_c: f64,
    pub mode: Mode,
    /// setpoint - room temperature (positive = too cold).
    pub error_c: f64,
    pub p_term_c: f64,
    pub i_term_c: f64,
    pub bias_c: f64,
    pub trend_c_per_s: f64,
    pub predicted_temp_c: Option<f64>,
    pub reason: ModeReason,
    /// Target before clamping.
    pub raw_target_c: f64,
    /// The trend latch armed on this cycle.
    pub window_latch_triggered: bool,
}

pub trait Controller: Send + Sync {
    fn kind(&self) -> ControllerKind;

    /// Compute the actuator target and evolve `state`.
    ///
    /// On `Err` the state is untouched.
    fn compute(&self, inputs: &ControlInputs, state: &mut ControllerState) -> Result<RegulationResult>;
}

pub fn build_controller(cfg: &ControllerConfig) -> Box<dyn Controller> {
    match cfg.kind {
        ControllerKind::Hybrid => Box::new(HybridRegulator::new(cfg.hybrid.clone())),
        ControllerKind::PidDelta => Box::new(PidDeltaRegulator::new(cfg.pid.clone())),
    }
}
