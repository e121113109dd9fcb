//! Command hygiene: whether and how to transmit a desired target.
//!
//! Priority order: first send, noise guard, urgent decrease, rate limit,
//! step-up limit. Decreases are never rate limited.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cfg::CommandPolicyConfig;
use crate::state::CommandMemory;
use crate::temp::round_tenth;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyReason {
    FirstSend,
    BelowMinDelta,
    UrgentDecrease,
    RateLimited,
    StepUpLimited,
    StepUpTooSmall,
    Send,
}

impl PolicyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstSend => "first_send",
            Self::BelowMinDelta => "below_min_delta",
            Self::UrgentDecrease => "urgent_decrease",
            Self::RateLimited => "rate_limited",
            Self::StepUpLimited => "step_up_limited",
            Self::StepUpTooSmall => "step_up_too_small",
            Self::Send => "send",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub send: bool,
    /// Value to write when `send`, otherwise the last sent value.
    pub setpoint: f64,
    pub reason: PolicyReason,
    pub fast_recovery: bool,
    /// Step cap that was applied, if any.
    pub step_limit_c: Option<f64>,
    pub rate_limit_remaining_s: Option<f64>,
    /// Noise threshold in force, for the `below_min_delta(..)` label.
    pub min_delta_c: f64,
}

impl PolicyDecision {
    fn new(send: bool, setpoint: f64, reason: PolicyReason, min_delta_c: f64) -> Self {
        Self {
            send,
            setpoint,
            reason,
            fast_recovery: false,
            step_limit_c: None,
            rate_limit_remaining_s: None,
            min_delta_c,
        }
    }
}

/// Operator-facing label, e.g. `rate_limited(42s)` or `below_min_delta(0.2C)`.
impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            PolicyReason::RateLimited => {
                let rem = self.rate_limit_remaining_s.unwrap_or(0.0).ceil() as i64;
                write!(f, "rate_limited({rem}s)")
            }
            PolicyReason::BelowMinDelta => write!(f, "below_min_delta({}C)", self.min_delta_c),
            PolicyReason::StepUpLimited => match self.step_limit_c {
                Some(step) => write!(f, "step_up_limited({step}C)"),
                None => f.write_str(self.reason.as_str()),
            },
            PolicyReason::Send => f.write_str("normal_update"),
            other => f.write_str(other.as_str()),
        }?;
        if self.fast_recovery {
            f.write_str("|fast_recovery")?;
        }
        Ok(())
    }
}

/// Regulator-side hints that may relax rate and step limits.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecoverySignal {
    pub boost: bool,
    /// setpoint - room temperature.
    pub room_error_c: f64,
}

#[derive(Clone, Debug, Default)]
pub struct CommandPolicy {
    cfg: CommandPolicyConfig,
}

impl CommandPolicy {
    pub fn new(cfg: CommandPolicyConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &CommandPolicyConfig {
        &self.cfg
    }

    /// Normal variant: no fast-recovery relaxation.
    pub fn apply(
        &self,
        desired_setpoint: f64,
        last_sent_setpoint: Option<f64>,
        last_sent_ts: Option<f64>,
        now_ts: f64,
    ) -> PolicyDecision {
        self.decide(desired_setpoint, last_sent_setpoint, last_sent_ts, now_ts, None)
    }

    pub fn apply_with(
        &self,
        desired_setpoint: f64,
        last_sent_setpoint: Option<f64>,
        last_sent_ts: Option<f64>,
        now_ts: f64,
        signal: &RecoverySignal,
    ) -> PolicyDecision {
        self.decide(desired_setpoint, last_sent_setpoint, last_sent_ts, now_ts, Some(signal))
    }

    pub fn apply_memory(
        &self,
        desired_setpoint: f64,
        memory: &CommandMemory,
        now_ts: f64,
        signal: &RecoverySignal,
    ) -> PolicyDecision {
        self.apply_with(desired_setpoint, memory.last_sent_setpoint(), memory.last_sent_ts(), now_ts, signal)
    }

    fn decide(
        &self,
        desired: f64,
        last_sent: Option<f64>,
        last_ts: Option<f64>,
        now_ts: f64,
        signal: Option<&RecoverySignal>,
    ) -> PolicyDecision {
        let cfg = &self.cfg;
        let min_delta = cfg.min_setpoint_delta_c;

        let (last, last_ts) = match (last_sent, last_ts) {
            (Some(l), Some(t)) => (l, t),
            _ => {
                debug!(decision = "first_send", desired, "command policy");
                return PolicyDecision::new(true, desired, PolicyReason::FirstSend, min_delta);
            }
        };

        // Hundredths, so 0.1 °C grid values compare exactly against the thresholds.
        let delta = ((desired - last) * 100.0).round() / 100.0;
        // A wall clock that stepped backwards counts as an expired interval.
        let elapsed = if now_ts >= last_ts { now_ts - last_ts } else { f64::INFINITY };

        let fast = signal.is_some_and(|s| {
            s.boost || s.room_error_c >= cfg.fast_recovery_error_c || delta >= cfg.fast_recovery_gap_c
        });
        let (interval, step) = if fast {
            (
                cfg.fast_recovery_interval_s.min(cfg.min_command_interval_s),
                cfg.fast_recovery_max_c.max(cfg.step_up_limit_c),
            )
        } else {
            (cfg.min_command_interval_s, cfg.step_up_limit_c)
        };

        let mut decision = if delta.abs() < min_delta {
            PolicyDecision::new(false, last, PolicyReason::BelowMinDelta, min_delta)
        } else if delta <= -min_delta {
            PolicyDecision::new(true, desired, PolicyReason::UrgentDecrease, min_delta)
        } else if elapsed < interval {
            let mut d = PolicyDecision::new(false, last, PolicyReason::RateLimited, min_delta);
            d.rate_limit_remaining_s = Some(interval - elapsed);
            d.fast_recovery = fast;
            d
        } else if delta > step {
            let limited = round_tenth(last + step);
            let mut d = if ((limited - last) * 100.0).round() / 100.0 < min_delta {
                PolicyDecision::new(false, last, PolicyReason::StepUpTooSmall, min_delta)
            } else {
                PolicyDecision::new(true, limited, PolicyReason::StepUpLimited, min_delta)
            };
            d.step_limit_c = Some(step);
            d.fast_recovery = fast;
            d
        } else {
            let mut d = PolicyDecision::new(true, desired, PolicyReason::Send, min_delta);
            d.fast_recovery = fast;
            d
        };
        if decision.reason == PolicyReason::UrgentDecrease || decision.reason == PolicyReason::BelowMinDelta {
            decision.fast_recovery = false;
        }

        debug!(
            decision = decision.reason.as_str(),
            desired,
            last,
            elapsed_s = elapsed,
            delta,
            fast_recovery = fast,
            min_delta,
            min_interval_s = interval,
            step_up_limit_c = step,
            sent = decision.setpoint,
            "command policy"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_detail() {
        let p = CommandPolicy::default();
        let d = p.apply(21.5, Some(21.0), Some(100.0), 118.0);
        assert_eq!(d.reason, PolicyReason::RateLimited);
        assert_eq!(d.to_string(), "rate_limited(42s)");

        let d = p.apply(21.1, Some(21.0), Some(100.0), 500.0);
        assert_eq!(d.to_string(), "below_min_delta(0.2C)");

        let d = p.apply(23.0, Some(21.0), Some(100.0), 500.0);
        assert_eq!(d.to_string(), "step_up_limited(0.5C)");
    }

    #[test]
    fn exact_tenth_grid_deltas_hit_the_threshold() {
        let p = CommandPolicy::default();
        // 20.8 - 21.0 is -0.1999999999999993 in f64.
        for (desired, last) in [(20.8, 21.0), (22.1, 22.3), (20.3, 20.5)] {
            let d = p.apply(desired, Some(last), Some(100.0), 100.0);
            assert!(d.send, "{desired} from {last}");
            assert_eq!(d.reason, PolicyReason::UrgentDecrease);
        }
        let d = p.apply(21.0, Some(20.8), Some(0.0), 500.0);
        assert!(d.send);
        assert_eq!(d.reason, PolicyReason::Send);

        let d = p.apply(20.9, Some(21.0), Some(100.0), 100.0);
        assert_eq!(d.reason, PolicyReason::BelowMinDelta);
    }

    #[test]
    fn step_limited_value_lands_on_tenth_grid() {
        let p = CommandPolicy::default();
        let d = p.apply(22.0, Some(20.3), Some(0.0), 500.0);
        assert_eq!(d.reason, PolicyReason::StepUpLimited);
        assert_eq!(d.setpoint, round_tenth(20.8));
        assert_eq!(d.setpoint, 20.8);
    }

    #[test]
    fn backwards_clock_does_not_block_increases() {
        let p = CommandPolicy::default();
        let d = p.apply(21.4, Some(21.0), Some(1_000.0), 10.0);
        assert!(d.send);
        assert_eq!(d.reason, PolicyReason::Send);
    }

    #[test]
    fn step_up_too_small_when_step_below_noise_guard() {
        let p = CommandPolicy::new(CommandPolicyConfig { step_up_limit_c: 0.1, ..Default::default() });
        let d = p.apply(22.0, Some(21.0), Some(0.0), 500.0);
        assert!(!d.send);
        assert_eq!(d.reason, PolicyReason::StepUpTooSmall);
        assert_eq!(d.setpoint, 21.0);
    }

    #[test]
    fn fast_recovery_relaxes_interval_and_step() {
        let p = CommandPolicy::default();
        let sig = RecoverySignal { boost: true, room_error_c: 3.0 };
        let d = p.apply_with(25.0, Some(21.0), Some(100.0), 120.0, &sig);
        assert!(d.send);
        assert!(d.fast_recovery);
        assert_eq!(d.reason, PolicyReason::StepUpLimited);
        assert_eq!(d.setpoint, 23.0);
        assert_eq!(d.to_string(), "step_up_limited(2C)|fast_recovery");

        // Inside the shortened interval it still waits.
        let d = p.apply_with(25.0, Some(21.0), Some(100.0), 105.0, &sig);
        assert!(!d.send);
        assert_eq!(d.reason, PolicyReason::RateLimited);
    }

    #[test]
    fn gap_alone_triggers_fast_recovery() {
        let p = CommandPolicy::default();
        let sig = RecoverySignal::default();
        let d = p.apply_with(20.0, Some(17.5), Some(0.0), 100.0, &sig);
        assert!(d.fast_recovery);
        assert_eq!(d.setpoint, 19.5);
    }
}
