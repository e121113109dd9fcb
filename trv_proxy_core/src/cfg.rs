use serde::{Deserialize, Serialize};

/// Tunables for the hybrid (bias + mode machine) regulator.
///
/// Trend thresholds are given per minute because that is how people reason
/// about room temperature; the regulator converts them to °C/s internally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorConfig {
    // Actuator limits (absolute target sent to the TRV)
    pub min_target_c: f64,
    pub max_target_c: f64,
    /// Relative band around the room setpoint for corrective targets.
    pub max_offset_c: f64,

    // Fast comfort response
    pub kp: f64,
    pub ki_small: f64,
    pub i_small_min_c: f64,
    pub i_small_max_c: f64,

    // Slow bias estimator
    pub bias_tau_s: f64,
    pub bias_deadband_c: f64,
    pub bias_trend_max_c_per_min: f64,
    pub bias_rate_limit_c_per_h: f64,
    pub bias_min_c: f64,
    pub bias_max_c: f64,

    // Trend / prediction
    pub trend_alpha: f64,
    pub trend_drop_threshold_c_per_min: f64,
    pub trend_rise_threshold_c_per_min: f64,
    pub predict_horizon_s: f64,
    pub overshoot_margin_c: f64,

    /// Trend-based window latch. Off when a window sensor is the canonical
    /// mechanism.
    pub window_latch_enabled: bool,
    pub window_open_drop_threshold_c_per_min: f64,
    pub window_open_hold_minutes: f64,

    // Mode thresholds
    pub hold_deadband_c: f64,
    pub boost_error_on_c: f64,
    pub boost_error_off_c: f64,
    pub boost_floor_offset_c: f64,
    pub boost_max_minutes: f64,
    pub coast_error_on_c: f64,
    pub coast_error_off_c: f64,
    pub coast_target_c: f64,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            min_target_c: 5.0,
            max_target_c: 25.0,
            max_offset_c: 8.0,

            kp: 5.0,
            ki_small: 0.0002,
            i_small_min_c: -2.0,
            i_small_max_c: 2.0,

            bias_tau_s: 4.0 * 3600.0,
            bias_deadband_c: 0.1,
            bias_trend_max_c_per_min: 0.01,
            bias_rate_limit_c_per_h: 0.5,
            bias_min_c: -5.0,
            bias_max_c: 5.0,

            trend_alpha: 0.25,
            trend_drop_threshold_c_per_min: -0.03,
            trend_rise_threshold_c_per_min: 0.03,
            predict_horizon_s: 900.0,
            overshoot_margin_c: 0.2,

            window_latch_enabled: true,
            window_open_drop_threshold_c_per_min: -0.2,
            window_open_hold_minutes: 15.0,

            hold_deadband_c: 0.1,
            boost_error_on_c: 0.6,
            boost_error_off_c: 0.2,
            boost_floor_offset_c: 3.0,
            boost_max_minutes: 30.0,
            coast_error_on_c: -0.3,
            coast_error_off_c: -0.1,
            coast_target_c: 5.0,
        }
    }
}

/// Tunables for the classic PID-delta strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f64,
    /// Integral gain per minute (applied as `ki * e * dt / 60`).
    pub ki: f64,
    pub kd: f64,
    pub deadband_c: f64,
    pub max_delta_c: f64,
    pub integral_min_c: f64,
    pub integral_max_c: f64,
    pub derivative_alpha: f64,

    pub min_target_c: f64,
    pub max_target_c: f64,
    pub max_offset_c: f64,
    pub coast_target_c: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 7.0,
            ki: 0.005,
            kd: 600.0,
            deadband_c: 0.2,
            max_delta_c: 4.0,
            integral_min_c: -2.0,
            integral_max_c: 2.0,
            derivative_alpha: 0.2,

            min_target_c: 5.0,
            max_target_c: 25.0,
            max_offset_c: 8.0,
            coast_target_c: 5.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    #[default]
    Hybrid,
    PidDelta,
}

impl ControllerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::PidDelta => "pid_delta",
        }
    }
}

/// Strategy selection plus the tunables of both strategies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub kind: ControllerKind,
    pub hybrid: RegulatorConfig,
    pub pid: PidConfig,
}

/// Command hygiene between the regulator and the physical actuator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicyConfig {
    pub min_command_interval_s: f64,
    pub min_setpoint_delta_c: f64,
    pub step_up_limit_c: f64,

    // Fast recovery relaxation
    pub fast_recovery_interval_s: f64,
    pub fast_recovery_max_c: f64,
    /// Room error (setpoint - room) at or above which fast recovery applies.
    pub fast_recovery_error_c: f64,
    /// Desired-vs-last-sent gap at or above which fast recovery applies.
    pub fast_recovery_gap_c: f64,
}

impl Default for CommandPolicyConfig {
    fn default() -> Self {
        Self {
            min_command_interval_s: 60.0,
            min_setpoint_delta_c: 0.2,
            step_up_limit_c: 0.5,

            fast_recovery_interval_s: 15.0,
            fast_recovery_max_c: 2.0,
            fast_recovery_error_c: 1.0,
            fast_recovery_gap_c: 2.0,
        }
    }
}
