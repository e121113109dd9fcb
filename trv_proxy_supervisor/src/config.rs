//! User-facing configuration for one proxied thermostat.

use serde::{Deserialize, Serialize};

use trv_proxy_core::{CommandPolicyConfig, ControllerConfig, ControllerKind, WindowConfig};

use crate::error::ConfigError;

/// Which window-open mechanism drives the frost-protection override.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowDetection {
    /// Binary contact sensor with open delay / close hold.
    Sensor,
    /// Regulator's rapid-drop latch, for sensorless rooms.
    Trend,
    Off,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub room_sensor: String,
    pub actuator: String,

    pub window_sensor: Option<String>,
    /// `None` picks `Sensor` when a window sensor is set, else `Trend`.
    pub window_detection: Option<WindowDetection>,
    pub window_open_delay_min: f64,
    pub window_close_delay_min: f64,

    pub controller: ControllerKind,
    /// Overrides the strategy's default gain when set.
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,

    pub min_target_c: f64,
    pub max_target_c: f64,
    pub frost_protect_c: f64,
    pub default_setpoint_c: f64,
    pub control_interval_s: f64,
    /// Minimum gap above the last sent value for the one-off resume jump.
    pub resume_jump_gap_c: f64,

    pub policy: CommandPolicyConfig,
    /// Full controller tunables; the fields above are applied on top.
    pub tuning: ControllerConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "TRV Proxy".to_string(),
            room_sensor: String::new(),
            actuator: String::new(),

            window_sensor: None,
            window_detection: None,
            window_open_delay_min: 0.0,
            window_close_delay_min: 0.0,

            controller: ControllerKind::Hybrid,
            kp: None,
            ki: None,
            kd: None,

            min_target_c: 5.0,
            max_target_c: 25.0,
            frost_protect_c: 5.0,
            default_setpoint_c: 20.0,
            control_interval_s: 60.0,
            resume_jump_gap_c: 0.05,

            policy: CommandPolicyConfig::default(),
            tuning: ControllerConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn new(room_sensor: impl Into<String>, actuator: impl Into<String>) -> Self {
        Self {
            room_sensor: room_sensor.into(),
            actuator: actuator.into(),
            ..Self::default()
        }
    }

    pub fn with_window_sensor(mut self, entity: impl Into<String>, open_delay_min: f64, close_delay_min: f64) -> Self {
        self.window_sensor = Some(entity.into());
        self.window_open_delay_min = open_delay_min;
        self.window_close_delay_min = close_delay_min;
        self
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn window_detection(&self) -> WindowDetection {
        self.window_detection.unwrap_or(if self.window_sensor.is_some() {
            WindowDetection::Sensor
        } else {
            WindowDetection::Trend
        })
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            open_delay_s: self.window_open_delay_min.max(0.0) * 60.0,
            close_hold_s: self.window_close_delay_min.max(0.0) * 60.0,
        }
    }

    /// Controller tunables with the user-facing surface applied.
    pub fn controller_config(&self) -> ControllerConfig {
        let mut c = self.tuning.clone();
        c.kind = self.controller;

        let h = &mut c.hybrid;
        if let Some(kp) = self.kp {
            h.kp = kp;
        }
        if let Some(ki) = self.ki {
            h.ki_small = ki.min(0.001);
        }
        h.min_target_c = self.min_target_c;
        h.max_target_c = self.max_target_c;
        h.coast_target_c = self.frost_protect_c;
        h.window_latch_enabled = self.window_detection() == WindowDetection::Trend;

        let p = &mut c.pid;
        if let Some(kp) = self.kp {
            p.kp = kp;
        }
        if let Some(ki) = self.ki {
            p.ki = ki;
        }
        if let Some(kd) = self.kd {
            p.kd = kd;
        }
        p.min_target_c = self.min_target_c;
        p.max_target_c = self.max_target_c;
        p.coast_target_c = self.frost_protect_c;
        c
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_sensor.trim().is_empty() {
            return Err(ConfigError::Empty("room_sensor"));
        }
        if self.actuator.trim().is_empty() {
            return Err(ConfigError::Empty("actuator"));
        }
        let non_negative = [
            ("window_open_delay_min", self.window_open_delay_min),
            ("window_close_delay_min", self.window_close_delay_min),
            ("control_interval_s", self.control_interval_s),
            ("resume_jump_gap_c", self.resume_jump_gap_c),
            ("policy.min_command_interval_s", self.policy.min_command_interval_s),
            ("policy.min_setpoint_delta_c", self.policy.min_setpoint_delta_c),
            ("policy.step_up_limit_c", self.policy.step_up_limit_c),
            ("policy.fast_recovery_interval_s", self.policy.fast_recovery_interval_s),
            ("policy.fast_recovery_max_c", self.policy.fast_recovery_max_c),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Negative { field, value });
            }
        }
        for (field, value) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ConfigError::Negative { field, value: v });
                }
            }
        }
        if !(self.min_target_c.is_finite() && self.max_target_c.is_finite()) || self.min_target_c >= self.max_target_c {
            return Err(ConfigError::TargetRange { min: self.min_target_c, max: self.max_target_c });
        }
        if !(self.min_target_c..=self.max_target_c).contains(&self.frost_protect_c) {
            return Err(ConfigError::FrostOutOfRange(self.frost_protect_c));
        }
        if self.window_detection() == WindowDetection::Sensor && self.window_sensor.is_none() {
            return Err(ConfigError::MissingWindowSensor);
        }
        Ok(())
    }
}
