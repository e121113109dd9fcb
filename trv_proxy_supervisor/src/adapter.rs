//! Host collaborator interface.
//!
//! The supervisor never talks to a home-automation bus directly. Products
//! implement [`ThermostatHost`] over whatever entity registry and service
//! calls they have, and hand in a [`Clock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::HostError;

/// What the actuator reports about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ActuatorReading {
    pub internal_temperature_c: Option<f64>,
    pub current_setpoint_c: Option<f64>,
}

impl ActuatorReading {
    /// Drop NaN / infinite values.
    pub fn sanitized(self) -> Self {
        Self {
            internal_temperature_c: finite(self.internal_temperature_c),
            current_setpoint_c: finite(self.current_setpoint_c),
        }
    }
}

#[inline]
pub fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

pub trait ThermostatHost {
    /// Numeric sensor reading, `None` when unavailable.
    fn read_sensor(&self, entity: &str) -> Option<f64>;

    /// Binary window/door contact, `true` = open.
    fn read_window(&self, entity: &str) -> Option<bool>;

    fn read_actuator(&self, entity: &str) -> ActuatorReading;

    /// Blocking "set temperature" call on the actuator.
    fn write_actuator_setpoint(&self, entity: &str, value_c: f64) -> Result<(), HostError>;
}

/// Time source. Monotonic seconds drive dt and deadlines; wall-clock seconds
/// stamp actuator writes.
pub trait Clock {
    fn monotonic_s(&self) -> f64;
    fn wall_s(&self) -> f64;
}

#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_s(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn wall_s(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Hand-driven clock for hosts that own their own timebase (and for tests).
#[derive(Debug, Default)]
pub struct ManualClock {
    mono: AtomicU64,
    wall: AtomicU64,
}

impl ManualClock {
    pub fn new(mono_s: f64, wall_s: f64) -> Self {
        Self {
            mono: AtomicU64::new(mono_s.to_bits()),
            wall: AtomicU64::new(wall_s.to_bits()),
        }
    }

    /// Move both clocks forward.
    pub fn advance(&self, secs: f64) {
        self.set(self.monotonic_s() + secs, self.wall_s() + secs);
    }

    pub fn set(&self, mono_s: f64, wall_s: f64) {
        self.mono.store(mono_s.to_bits(), Ordering::SeqCst);
        self.wall.store(wall_s.to_bits(), Ordering::SeqCst);
    }

    /// Step only the wall clock (NTP correction, DST bugs, ...).
    pub fn set_wall(&self, wall_s: f64) {
        self.wall.store(wall_s.to_bits(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_s(&self) -> f64 {
        f64::from_bits(self.mono.load(Ordering::SeqCst))
    }

    fn wall_s(&self) -> f64 {
        f64::from_bits(self.wall.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_drops_non_finite() {
        let r = ActuatorReading {
            internal_temperature_c: Some(f64::NAN),
            current_setpoint_c: Some(21.0),
        }
        .sanitized();
        assert_eq!(r.internal_temperature_c, None);
        assert_eq!(r.current_setpoint_c, Some(21.0));
    }

    #[test]
    fn manual_clock_advances_both() {
        let c = ManualClock::new(10.0, 1_000.0);
        c.advance(5.0);
        assert_eq!(c.monotonic_s(), 15.0);
        assert_eq!(c.wall_s(), 1_005.0);
        c.set_wall(0.0);
        assert_eq!(c.monotonic_s(), 15.0);
    }
}
