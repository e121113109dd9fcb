//! Sensor-driven window-open override.
//!
//! CLOSED -> PENDING_OPEN -> FORCED_OPEN -> PENDING_CLOSE -> CLOSED, with the
//! actuator pinned to frost protection while FORCED_OPEN or PENDING_CLOSE.
//! Deadlines are on the caller's monotonic clock.

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub open_delay_s: f64,
    pub close_hold_s: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    #[default]
    Closed,
    PendingOpen,
    ForcedOpen,
    PendingClose,
}

impl WindowPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::PendingOpen => "pending_open",
            Self::ForcedOpen => "forced_open",
            Self::PendingClose => "pending_close",
        }
    }

    pub fn is_forced(self) -> bool {
        matches!(self, Self::ForcedOpen | Self::PendingClose)
    }

    pub fn reason(self) -> Option<WindowReason> {
        match self {
            Self::Closed => None,
            Self::PendingOpen => Some(WindowReason::OpenPending),
            Self::ForcedOpen => Some(WindowReason::OpenForced),
            Self::PendingClose => Some(WindowReason::CloseHold),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowReason {
    OpenPending,
    OpenForced,
    CloseHold,
}

impl WindowReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenPending => "window_open_pending",
            Self::OpenForced => "window_open_forced",
            Self::CloseHold => "window_close_hold",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowState {
    /// Last reading the sensor gave (true = open).
    pub sensor_open: bool,
    pub phase: WindowPhase,
    pub open_deadline_s: Option<f64>,
    pub close_deadline_s: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub phase: WindowPhase,
    pub forced: bool,
    pub reason: Option<WindowReason>,
    pub open_remaining_s: f64,
    pub close_remaining_s: f64,
}

#[derive(Clone, Debug, Default)]
pub struct WindowTracker {
    cfg: WindowConfig,
    state: WindowState,
}

impl WindowTracker {
    pub fn new(cfg: WindowConfig) -> Self {
        Self { cfg, state: WindowState::default() }
    }

    pub fn with_state(cfg: WindowConfig, state: WindowState) -> Self {
        Self { cfg, state }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.cfg
    }

    /// Hot reload. Pending deadlines already running are kept.
    pub fn set_config(&mut self, cfg: WindowConfig) {
        self.cfg = cfg;
    }

    pub fn state(&self) -> &WindowState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = WindowState::default();
    }

    /// Feed a sensor reading. `None` (unavailable) keeps the last reading.
    pub fn observe(&mut self, reading: Option<bool>, now_s: f64) {
        let Some(open) = reading else {
            self.advance(now_s);
            return;
        };
        let before = self.state.phase;
        self.state.sensor_open = open;

        match (open, before) {
            (true, WindowPhase::Closed) => {
                self.state.phase = WindowPhase::PendingOpen;
                self.state.open_deadline_s = Some(now_s + self.cfg.open_delay_s.max(0.0));
                self.state.close_deadline_s = None;
            }
            (true, WindowPhase::PendingClose) => {
                self.state.phase = WindowPhase::ForcedOpen;
                self.state.close_deadline_s = None;
            }
            (false, WindowPhase::PendingOpen) => {
                self.state.phase = WindowPhase::Closed;
                self.state.open_deadline_s = None;
            }
            (false, WindowPhase::ForcedOpen) => {
                self.state.phase = WindowPhase::PendingClose;
                self.state.close_deadline_s = Some(now_s + self.cfg.close_hold_s.max(0.0));
            }
            _ => {}
        }
        self.advance(now_s);
        self.log_change(before);
    }

    /// Expire pending deadlines and report the current forcing.
    pub fn evaluate(&mut self, now_s: f64) -> WindowStatus {
        let before = self.state.phase;
        self.advance(now_s);
        self.log_change(before);

        let st = &self.state;
        let remaining = |d: Option<f64>| d.map(|d| (d - now_s).max(0.0)).unwrap_or(0.0);
        WindowStatus {
            phase: st.phase,
            forced: st.phase.is_forced(),
            reason: st.phase.reason(),
            open_remaining_s: if st.phase == WindowPhase::PendingOpen { remaining(st.open_deadline_s) } else { 0.0 },
            close_remaining_s: if st.phase == WindowPhase::PendingClose { remaining(st.close_deadline_s) } else { 0.0 },
        }
    }

    /// Earliest pending deadline, for scheduling a one-shot wake-up.
    pub fn next_deadline(&self) -> Option<f64> {
        match self.state.phase {
            WindowPhase::PendingOpen => self.state.open_deadline_s,
            WindowPhase::PendingClose => self.state.close_deadline_s,
            _ => None,
        }
    }

    /// Restart running countdowns on a new monotonic epoch.
    pub fn rebase(&mut self, now_s: f64) {
        match self.state.phase {
            WindowPhase::PendingOpen => self.state.open_deadline_s = Some(now_s + self.cfg.open_delay_s.max(0.0)),
            WindowPhase::PendingClose => self.state.close_deadline_s = Some(now_s + self.cfg.close_hold_s.max(0.0)),
            _ => {
                self.state.open_deadline_s = None;
                self.state.close_deadline_s = None;
            }
        }
    }

    fn advance(&mut self, now_s: f64) {
        match self.state.phase {
            WindowPhase::PendingOpen if self.state.open_deadline_s.map_or(true, |d| now_s >= d) => {
                self.state.phase = WindowPhase::ForcedOpen;
                self.state.open_deadline_s = None;
            }
            WindowPhase::PendingClose if self.state.close_deadline_s.map_or(true, |d| now_s >= d) => {
                self.state.phase = WindowPhase::Closed;
                self.state.close_deadline_s = None;
            }
            _ => {}
        }
    }

    fn log_change(&self, before: WindowPhase) {
        if before != self.state.phase {
            info!(from = before.as_str(), to = self.state.phase.as_str(), "window phase change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(open: f64, close: f64) -> WindowTracker {
        WindowTracker::new(WindowConfig { open_delay_s: open, close_hold_s: close })
    }

    #[test]
    fn zero_delays_force_and_release_immediately() {
        let mut w = tracker(0.0, 0.0);
        w.observe(Some(true), 0.0);
        assert_eq!(w.evaluate(0.0).phase, WindowPhase::ForcedOpen);
        w.observe(Some(false), 1.0);
        let st = w.evaluate(1.0);
        assert_eq!(st.phase, WindowPhase::Closed);
        assert!(!st.forced);
    }

    #[test]
    fn closing_while_pending_open_skips_hold() {
        let mut w = tracker(120.0, 300.0);
        w.observe(Some(true), 0.0);
        assert_eq!(w.evaluate(10.0).reason, Some(WindowReason::OpenPending));
        w.observe(Some(false), 20.0);
        assert_eq!(w.evaluate(20.0).phase, WindowPhase::Closed);
        assert_eq!(w.next_deadline(), None);
    }

    #[test]
    fn reopening_during_hold_stays_forced() {
        let mut w = tracker(0.0, 300.0);
        w.observe(Some(true), 0.0);
        w.observe(Some(false), 10.0);
        assert_eq!(w.evaluate(20.0).phase, WindowPhase::PendingClose);
        w.observe(Some(true), 30.0);
        assert_eq!(w.evaluate(30.0).phase, WindowPhase::ForcedOpen);
    }

    #[test]
    fn unavailable_reading_keeps_phase() {
        let mut w = tracker(0.0, 0.0);
        w.observe(Some(true), 0.0);
        w.observe(None, 5.0);
        assert!(w.evaluate(5.0).forced);
    }

    #[test]
    fn rebase_restarts_countdown() {
        let mut w = tracker(60.0, 0.0);
        w.observe(Some(true), 1_000.0);
        w.rebase(5.0);
        assert_eq!(w.next_deadline(), Some(65.0));
    }
}
