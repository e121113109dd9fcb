//! trv_proxy_supervisor
//!
//! Orchestration layer around `trv_proxy_core`:
//! - reads room, actuator and window entities through a host trait
//! - runs one control cycle per proxied thermostat
//! - serializes cycles per device and coalesces bursts of triggers
//! - hot-reloads configuration and snapshots state for persistence
//!
//! No async, no threads of its own. Time comes from a [`Clock`].

pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod supervisor;

pub use adapter::{ActuatorReading, Clock, ManualClock, SystemClock, ThermostatHost};
pub use config::{DeviceConfig, WindowDetection};
pub use device::{
    CycleReport, DeviceLoop, DeviceSnapshot, EventKind, HvacAction, HvacMode, OverrideReason,
};
pub use error::{ConfigError, HostError, Result, SupervisorError};
pub use supervisor::{CycleOutcome, ProxySupervisor, RestoreStats, SupervisorSnapshot};
