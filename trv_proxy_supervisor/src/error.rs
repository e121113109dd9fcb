use thiserror::Error;

/// Failures reported by the host-integration layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("entity `{0}` is unavailable")]
    Unavailable(String),
    #[error("actuator write to `{entity}` failed: {message}")]
    WriteFailed { entity: String, message: String },
}

/// Configuration rejected by [`crate::config::DeviceConfig::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{0}` must not be empty")]
    Empty(&'static str),
    #[error("`{field}` must be finite and >= 0, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("min_target_c ({min}) must be below max_target_c ({max})")]
    TargetRange { min: f64, max: f64 },
    #[error("frost_protect_c ({0}) lies outside the target range")]
    FrostOutOfRange(f64),
    #[error("window detection `sensor` needs a window sensor")]
    MissingWindowSensor,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
    #[error("device `{0}` is already registered")]
    DuplicateDevice(String),
    #[error("invalid setpoint {0}")]
    InvalidSetpoint(f64),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
