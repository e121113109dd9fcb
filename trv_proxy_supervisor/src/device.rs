//! One proxied thermostat: the control cycle and the state it owns.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use trv_proxy_core::{
    build_controller, round_tenth, CommandMemory, CommandPolicy, ControlInputs, Controller,
    ControllerKind, ControllerState, Mode, PidState, PolicyDecision, RecoverySignal,
    RegulationResult, RegulatorState, WindowState, WindowStatus, WindowTracker,
};

use crate::adapter::{finite, ActuatorReading, Clock, ThermostatHost};
use crate::config::{DeviceConfig, WindowDetection};
use crate::error::{ConfigError, Result, SupervisorError};

/// Margin used for "actuator will heat" and "forced decrease" comparisons.
const WILL_HEAT_EPS_C: f64 = 0.05;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    #[default]
    Heat,
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    Heating,
    Idle,
    Off,
}

/// What woke the device up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Startup,
    PeriodicTick,
    SetpointChanged,
    HvacModeChanged,
    WindowSensorChanged,
    RoomSensorChanged,
    DeadlineExpired,
    ConfigReloaded,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::PeriodicTick => "periodic_tick",
            Self::SetpointChanged => "setpoint_changed",
            Self::HvacModeChanged => "hvac_mode_changed",
            Self::WindowSensorChanged => "window_sensor_changed",
            Self::RoomSensorChanged => "room_sensor_changed",
            Self::DeadlineExpired => "deadline_expired",
            Self::ConfigReloaded => "config_reloaded",
        }
    }

    /// Stable wire code, used across the C ABI and coalesced triggers.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Startup => 0,
            Self::PeriodicTick => 1,
            Self::SetpointChanged => 2,
            Self::HvacModeChanged => 3,
            Self::WindowSensorChanged => 4,
            Self::RoomSensorChanged => 5,
            Self::DeadlineExpired => 6,
            Self::ConfigReloaded => 7,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Startup,
            1 => Self::PeriodicTick,
            2 => Self::SetpointChanged,
            3 => Self::HvacModeChanged,
            4 => Self::WindowSensorChanged,
            5 => Self::RoomSensorChanged,
            6 => Self::DeadlineExpired,
            7 => Self::ConfigReloaded,
            _ => return None,
        })
    }
}

/// Writes that bypass the command policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideReason {
    /// First write after a window-forced period, sent verbatim.
    WindowResume,
    /// Drop to frost protection while the window is open.
    WindowForced,
}

impl OverrideReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WindowResume => "window_resume",
            Self::WindowForced => "window_forced",
        }
    }
}

/// Outcome of one control cycle, for telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Operator-facing label, e.g. `sent(urgent_decrease)|window_open_forced`.
    pub status: String,
    pub trigger: EventKind,
    pub result: Option<RegulationResult>,
    pub decision: Option<PolicyDecision>,
    pub override_reason: Option<OverrideReason>,
    /// Value accepted by the actuator on this cycle.
    pub sent_c: Option<f64>,
    pub write_error: Option<String>,
    pub window: Option<WindowStatus>,
    pub hvac_action: HvacAction,
    pub actuator_temperature_c: Option<f64>,
    pub actuator_setpoint_c: Option<f64>,
}

/// Persisted per-device state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSnapshot {
    pub setpoint_c: f64,
    pub hvac_mode: HvacMode,
    pub controller_state: ControllerState,
    pub memory: CommandMemory,
    pub window: WindowState,
    pub last_forced: bool,
    pub resume_pending: bool,
}

fn fresh_state(kind: ControllerKind) -> ControllerState {
    match kind {
        ControllerKind::Hybrid => ControllerState::Hybrid(RegulatorState::default()),
        ControllerKind::PidDelta => ControllerState::PidDelta(PidState::default()),
    }
}

fn hvac_action(mode: HvacMode, actuator: &ActuatorReading) -> HvacAction {
    if mode == HvacMode::Off {
        return HvacAction::Off;
    }
    match (actuator.current_setpoint_c, actuator.internal_temperature_c) {
        (Some(sp), Some(t)) if sp > t + WILL_HEAT_EPS_C => HvacAction::Heating,
        _ => HvacAction::Idle,
    }
}

pub struct DeviceLoop {
    id: String,
    cfg: DeviceConfig,
    controller: Box<dyn Controller>,
    policy: CommandPolicy,
    state: ControllerState,
    memory: CommandMemory,
    window: WindowTracker,

    setpoint_c: f64,
    hvac_mode: HvacMode,

    /// Monotonic time of the last cycle that reached the controller.
    last_cycle_s: Option<f64>,
    last_forced: bool,
    resume_pending: bool,
    last_report: Option<CycleReport>,
}

impl std::fmt::Debug for DeviceLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLoop")
            .field("id", &self.id)
            .field("controller", &self.controller.kind())
            .field("state", &self.state)
            .field("memory", &self.memory)
            .field("setpoint_c", &self.setpoint_c)
            .field("hvac_mode", &self.hvac_mode)
            .finish_non_exhaustive()
    }
}

impl DeviceLoop {
    pub fn new(id: impl Into<String>, cfg: DeviceConfig) -> std::result::Result<Self, ConfigError> {
        cfg.validate()?;
        let controller_cfg = cfg.controller_config();
        Ok(Self {
            id: id.into(),
            controller: build_controller(&controller_cfg),
            policy: CommandPolicy::new(cfg.policy.clone()),
            state: fresh_state(controller_cfg.kind),
            memory: CommandMemory::new(),
            window: WindowTracker::new(cfg.window_config()),
            setpoint_c: cfg.default_setpoint_c,
            hvac_mode: HvacMode::Heat,
            last_cycle_s: None,
            last_forced: false,
            resume_pending: false,
            last_report: None,
            cfg,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn memory(&self) -> &CommandMemory {
        &self.memory
    }

    pub fn setpoint_c(&self) -> f64 {
        self.setpoint_c
    }

    pub fn hvac_mode(&self) -> HvacMode {
        self.hvac_mode
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    /// User setpoint; clamped into the configured target range.
    pub fn set_setpoint(&mut self, value_c: f64) -> Result<()> {
        if !value_c.is_finite() {
            return Err(SupervisorError::InvalidSetpoint(value_c));
        }
        self.setpoint_c = value_c.max(self.cfg.min_target_c).min(self.cfg.max_target_c);
        Ok(())
    }

    pub fn set_hvac_mode(&mut self, mode: HvacMode) {
        self.hvac_mode = mode;
    }

    /// Hot reload. Regulator state and command memory survive; a changed
    /// strategy starts from its own fresh state on the next cycle.
    pub fn apply_config(&mut self, cfg: DeviceConfig) -> std::result::Result<(), ConfigError> {
        cfg.validate()?;
        let controller_cfg = cfg.controller_config();
        if cfg.window_detection() != WindowDetection::Sensor {
            self.window.reset();
            self.last_forced = false;
            self.resume_pending = false;
        }
        self.window.set_config(cfg.window_config());
        self.controller = build_controller(&controller_cfg);
        self.policy = CommandPolicy::new(cfg.policy.clone());
        self.setpoint_c = self.setpoint_c.max(cfg.min_target_c).min(cfg.max_target_c);
        info!(
            device = %self.id,
            controller = controller_cfg.kind.as_str(),
            "configuration reloaded"
        );
        self.cfg = cfg;
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<f64> {
        self.window.next_deadline()
    }

    /// Period the host should use for `EventKind::PeriodicTick`.
    pub fn control_interval_s(&self) -> f64 {
        self.cfg.control_interval_s
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            setpoint_c: self.setpoint_c,
            hvac_mode: self.hvac_mode,
            controller_state: self.state.clone(),
            memory: self.memory,
            window: *self.window.state(),
            last_forced: self.last_forced,
            resume_pending: self.resume_pending,
        }
    }

    /// Load persisted state, moving monotonic stamps onto `now_s`.
    pub fn restore(&mut self, snap: DeviceSnapshot, now_s: f64) {
        if snap.setpoint_c.is_finite() {
            self.setpoint_c = snap.setpoint_c.max(self.cfg.min_target_c).min(self.cfg.max_target_c);
        }
        self.hvac_mode = snap.hvac_mode;
        self.state = snap.controller_state;
        self.state.rebase(now_s);
        self.memory = snap.memory;
        self.window = WindowTracker::with_state(self.cfg.window_config(), snap.window);
        self.window.rebase(now_s);
        self.last_forced = snap.last_forced;
        self.resume_pending = snap.resume_pending;
        self.last_cycle_s = None;
    }

    /// Run one control cycle against the host.
    pub fn run_cycle(&mut self, host: &dyn ThermostatHost, clock: &dyn Clock, trigger: EventKind) -> CycleReport {
        let report = self.cycle(host, clock, trigger);
        self.last_report = Some(report.clone());
        report
    }

    fn cycle(&mut self, host: &dyn ThermostatHost, clock: &dyn Clock, trigger: EventKind) -> CycleReport {
        let now = clock.monotonic_s();
        let actuator = host.read_actuator(&self.cfg.actuator).sanitized();
        let mut report = CycleReport {
            status: String::new(),
            trigger,
            result: None,
            decision: None,
            override_reason: None,
            sent_c: None,
            write_error: None,
            window: None,
            hvac_action: hvac_action(self.hvac_mode, &actuator),
            actuator_temperature_c: actuator.internal_temperature_c,
            actuator_setpoint_c: actuator.current_setpoint_c,
        };

        let Some(room) = finite(host.read_sensor(&self.cfg.room_sensor)) else {
            warn!(device = %self.id, sensor = %self.cfg.room_sensor, "room sensor unavailable, cycle skipped");
            report.status = "waiting_for_sensors".to_string();
            return report;
        };

        let window = match (self.cfg.window_detection(), &self.cfg.window_sensor) {
            (WindowDetection::Sensor, Some(entity)) => {
                self.window.observe(host.read_window(entity), now);
                Some(self.window.evaluate(now))
            }
            _ => None,
        };
        let forced = window.is_some_and(|w| w.forced);
        report.window = window;

        let dt = self.last_cycle_s.map_or(0.0, |t| (now - t).max(0.0));
        let frost = self.cfg.frost_protect_c;
        let setpoint = match self.hvac_mode {
            HvacMode::Heat => self.setpoint_c,
            HvacMode::Off => frost,
        };
        let inputs = ControlInputs::new(setpoint, room, dt, now).heating(self.hvac_mode == HvacMode::Heat && !forced);

        let result = match self.controller.compute(&inputs, &mut self.state) {
            Ok(r) => r,
            Err(e) => {
                warn!(device = %self.id, error = %e, "regulation skipped");
                report.status = format!("skipped({e})");
                return report;
            }
        };
        self.last_cycle_s = Some(now);

        let desired = if forced { round_tenth(frost) } else { result.target_c };

        if self.last_forced && !forced {
            self.resume_pending = true;
        } else if forced {
            self.resume_pending = false;
        }
        self.last_forced = forced;

        let wall = clock.wall_s();
        let gap = self.cfg.resume_jump_gap_c;
        let (send_value, label) = match self.memory.last_sent_setpoint() {
            Some(last) if self.resume_pending && desired > last + gap => {
                report.override_reason = Some(OverrideReason::WindowResume);
                (Some(desired), OverrideReason::WindowResume.as_str().to_string())
            }
            Some(last) if forced && desired < last - WILL_HEAT_EPS_C => {
                report.override_reason = Some(OverrideReason::WindowForced);
                (Some(desired), OverrideReason::WindowForced.as_str().to_string())
            }
            _ => {
                self.resume_pending = false;
                let signal = RecoverySignal {
                    boost: result.mode == Mode::Boost,
                    room_error_c: setpoint - room,
                };
                let decision = self.policy.apply_memory(desired, &self.memory, wall, &signal);
                report.decision = Some(decision);
                (decision.send.then_some(decision.setpoint), decision.to_string())
            }
        };

        let mut status = match send_value {
            Some(value) => match host.write_actuator_setpoint(&self.cfg.actuator, value) {
                Ok(()) => {
                    self.memory.record(value, wall);
                    if report.override_reason == Some(OverrideReason::WindowResume) {
                        self.resume_pending = false;
                    }
                    report.sent_c = Some(value);
                    debug!(device = %self.id, value, reason = %label, "actuator setpoint written");
                    format!("sent({label})")
                }
                Err(e) => {
                    warn!(device = %self.id, value, error = %e, "actuator write failed");
                    report.write_error = Some(e.to_string());
                    format!("write_failed({label})")
                }
            },
            None => label,
        };
        if let Some(reason) = window.and_then(|w| w.reason) {
            status.push('|');
            status.push_str(reason.as_str());
        }

        report.status = status;
        report.result = Some(result);
        report
    }
}
