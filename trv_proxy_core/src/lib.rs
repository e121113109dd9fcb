//! trv_proxy_core
//!
//! Pure regulation engine for a proxied thermostat valve: controllers that
//! turn (setpoint, room temperature, elapsed time) into an actuator target,
//! the command policy that decides whether to transmit it, and the
//! window-open override state machine.
//!
//! No IO, no clocks: callers pass monotonic and wall-clock time in.

pub mod cfg;
pub mod error;
pub mod temp;

pub mod state;
pub mod controller;
pub mod hybrid;
pub mod pid;
pub mod policy;
pub mod window;

pub use cfg::{CommandPolicyConfig, ControllerConfig, ControllerKind, PidConfig, RegulatorConfig};
pub use error::{CoreError, Result};
pub use temp::round_tenth;

pub use state::{CommandMemory, ControllerState, Mode, PidState, RegulatorState};
pub use controller::{build_controller, ControlInputs, Controller, ModeReason, RegulationResult};
pub use hybrid::HybridRegulator;
pub use pid::PidDeltaRegulator;
pub use policy::{CommandPolicy, PolicyDecision, PolicyReason, RecoverySignal};
pub use window::{WindowConfig, WindowPhase, WindowReason, WindowState, WindowStatus, WindowTracker};
