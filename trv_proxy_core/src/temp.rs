/// Round to the 0.1 °C resolution TRVs expose.
#[inline]
pub fn round_tenth(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Clamp to `setpoint ± max_offset`, then to the absolute actuator bounds.
#[inline]
pub fn clamp_target(setpoint_c: f64, target_c: f64, max_offset_c: f64, min_c: f64, max_c: f64) -> f64 {
    let rel = target_c
        .max(setpoint_c - max_offset_c)
        .min(setpoint_c + max_offset_c);
    clamp_absolute(rel, min_c, max_c)
}

#[inline]
pub fn clamp_absolute(target_c: f64, min_c: f64, max_c: f64) -> f64 {
    target_c.max(min_c).min(max_c)
}
