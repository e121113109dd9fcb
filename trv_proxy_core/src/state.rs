use serde::{Deserialize, Serialize};

/// Operating modes of the hybrid controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Boost,
    #[default]
    Hold,
    Coast,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Boost => "boost",
            Mode::Hold => "hold",
            Mode::Coast => "coast",
        }
    }
}

/// Hybrid regulator state carried between cycles.
///
/// Timestamps are on the caller's monotonic clock (seconds).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorState {
    pub mode: Mode,
    pub bias_c: f64,
    pub i_small_c: f64,
    pub trend_c_per_s: f64,
    pub last_room_temp_c: Option<f64>,
    pub mode_entered_s: f64,
    pub window_latch_until_s: f64,
}

impl RegulatorState {
    /// Switch mode, stamping the entry time only on an actual transition.
    #[inline]
    pub fn enter(&mut self, mode: Mode, now_s: f64) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        self.mode_entered_s = now_s;
        true
    }

    pub fn window_latch_active(&self, now_s: f64) -> bool {
        now_s < self.window_latch_until_s
    }

    /// Move monotonic timestamps onto a new clock epoch.
    ///
    /// Monotonic clocks restart with the process, so restored timestamps are
    /// only meaningful relative to each other.
    pub fn rebase(&mut self, now_s: f64) {
        self.mode_entered_s = now_s;
        self.window_latch_until_s = 0.0;
    }
}

/// PID-delta state carried between cycles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidState {
    pub last_error_c: Option<f64>,
    pub integral_c: f64,
    pub derivative_ema_c: f64,
}

impl PidState {
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// State of whichever controller strategy is active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerState {
    Hybrid(RegulatorState),
    PidDelta(PidState),
}

impl Default for ControllerState {
    fn default() -> Self {
        ControllerState::Hybrid(RegulatorState::default())
    }
}

impl ControllerState {
    pub fn mode(&self) -> Mode {
        match self {
            ControllerState::Hybrid(s) => s.mode,
            ControllerState::PidDelta(_) => Mode::Hold,
        }
    }

    pub fn rebase(&mut self, now_s: f64) {
        if let ControllerState::Hybrid(s) = self {
            s.rebase(now_s);
        }
    }
}

/// What was last written to the actuator, and when (wall clock, seconds).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMemory {
    last: Option<(f64, f64)>,
}

impl CommandMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent_setpoint(&self) -> Option<f64> {
        self.last.map(|(sp, _)| sp)
    }

    pub fn last_sent_ts(&self) -> Option<f64> {
        self.last.map(|(_, ts)| ts)
    }

    /// Record an accepted write. Setpoint and timestamp change together.
    #[inline]
    pub fn record(&mut self, setpoint_c: f64, ts: f64) {
        self.last = Some((setpoint_c, ts));
    }

    #[inline]
    pub fn reset(&mut self) {
        self.last = None;
    }
}
