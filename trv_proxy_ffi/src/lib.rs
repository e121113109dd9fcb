#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::ptr;

use trv_proxy_core::{CommandPolicy, CommandPolicyConfig, PolicyReason};
use trv_proxy_supervisor::{
    ActuatorReading, Clock, CycleOutcome, DeviceConfig, EventKind, HostError, HvacMode, ProxySupervisor,
    SupervisorError, SupervisorSnapshot, SystemClock, ThermostatHost,
};

/// FFI ABI version for trv_proxy_ffi.
///
/// Bump this when any `#[repr(C)]` struct layout or exported function signature changes.
pub const TRV_PROXY_FFI_VERSION: u32 = 1;

#[no_mangle]
pub extern "C" fn trv_proxy_ffi_version() -> u32 {
    TRV_PROXY_FFI_VERSION
}

pub const TRV_OK: i32 = 0;
pub const TRV_ERR_NULL: i32 = -1;
pub const TRV_ERR_UTF8: i32 = -2;
pub const TRV_ERR_UNKNOWN_DEVICE: i32 = -3;
pub const TRV_ERR_DUPLICATE_DEVICE: i32 = -4;
pub const TRV_ERR_CONFIG: i32 = -5;
pub const TRV_ERR_INVALID_SETPOINT: i32 = -6;
pub const TRV_ERR_JSON: i32 = -7;
pub const TRV_ERR_BAD_ARG: i32 = -8;

fn rc_for(e: &SupervisorError) -> i32 {
    match e {
        SupervisorError::UnknownDevice(_) => TRV_ERR_UNKNOWN_DEVICE,
        SupervisorError::DuplicateDevice(_) => TRV_ERR_DUPLICATE_DEVICE,
        SupervisorError::InvalidSetpoint(_) => TRV_ERR_INVALID_SETPOINT,
        SupervisorError::Config(_) => TRV_ERR_CONFIG,
        SupervisorError::Json(_) => TRV_ERR_JSON,
    }
}

/// FFI string view (UTF-8 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrvStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl TrvStr {
    fn as_str(&self) -> Option<&str> {
        if self.ptr.is_null() {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr, self.len) };
        std::str::from_utf8(bytes).ok()
    }

    fn borrowed(s: &str) -> Self {
        Self { ptr: s.as_ptr(), len: s.len() }
    }
}

/// Actuator self-report. `has_*` = 0 marks the value as unavailable.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TrvActuatorReading {
    pub has_internal: u8,
    pub internal_c: f64,
    pub has_setpoint: u8,
    pub setpoint_c: f64,
}

/// Host callbacks. Every function receives `ctx` back unchanged.
///
/// - `read_sensor` / `read_window` return 1 and fill `out` when a value is
///   available, 0 otherwise. Window `out` is 1 for open.
/// - `write_setpoint` returns 0 on success.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrvHostVTable {
    pub ctx: *mut c_void,
    pub read_sensor: Option<unsafe extern "C" fn(ctx: *mut c_void, entity: TrvStr, out: *mut f64) -> u8>,
    pub read_window: Option<unsafe extern "C" fn(ctx: *mut c_void, entity: TrvStr, out: *mut u8) -> u8>,
    pub read_actuator: Option<unsafe extern "C" fn(ctx: *mut c_void, entity: TrvStr, out: *mut TrvActuatorReading)>,
    pub write_setpoint: Option<unsafe extern "C" fn(ctx: *mut c_void, entity: TrvStr, value_c: f64) -> i32>,
}

struct FfiHost {
    vt: TrvHostVTable,
}

impl ThermostatHost for FfiHost {
    fn read_sensor(&self, entity: &str) -> Option<f64> {
        let f = self.vt.read_sensor?;
        let mut out = f64::NAN;
        let ok = unsafe { f(self.vt.ctx, TrvStr::borrowed(entity), &mut out) };
        (ok != 0).then_some(out)
    }

    fn read_window(&self, entity: &str) -> Option<bool> {
        let f = self.vt.read_window?;
        let mut out = 0u8;
        let ok = unsafe { f(self.vt.ctx, TrvStr::borrowed(entity), &mut out) };
        (ok != 0).then_some(out != 0)
    }

    fn read_actuator(&self, entity: &str) -> ActuatorReading {
        let Some(f) = self.vt.read_actuator else {
            return ActuatorReading::default();
        };
        let mut out = TrvActuatorReading::default();
        unsafe { f(self.vt.ctx, TrvStr::borrowed(entity), &mut out) };
        ActuatorReading {
            internal_temperature_c: (out.has_internal != 0).then_some(out.internal_c),
            current_setpoint_c: (out.has_setpoint != 0).then_some(out.setpoint_c),
        }
    }

    fn write_actuator_setpoint(&self, entity: &str, value_c: f64) -> Result<(), HostError> {
        let Some(f) = self.vt.write_setpoint else {
            return Err(HostError::Unavailable(entity.to_string()));
        };
        let rc = unsafe { f(self.vt.ctx, TrvStr::borrowed(entity), value_c) };
        if rc == 0 {
            Ok(())
        } else {
            Err(HostError::WriteFailed { entity: entity.to_string(), message: format!("host rc {rc}") })
        }
    }
}

/// Opaque handle exposed over FFI.
pub struct TrvProxyHandle {
    inner: ProxySupervisor,
    host: FfiHost,
    clock: SystemClock,
}

/// Owned byte buffer (JSON documents).
#[repr(C)]
pub struct TrvBytes {
    pub ptr: *mut u8,
    pub len: usize,
}

impl TrvBytes {
    fn null() -> Self {
        Self { ptr: ptr::null_mut(), len: 0 }
    }

    fn from_vec(buf: Vec<u8>) -> Self {
        let mut boxed = buf.into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        let len = boxed.len();
        // Freed by trv_proxy_bytes_free.
        std::mem::forget(boxed);
        Self { ptr, len }
    }
}

/// Restore result statistics (FFI-safe).
#[repr(C)]
pub struct TrvRestoreStats {
    pub applied: u32,
    pub skipped: u32,
    pub rc: i32,
}

/// Create a new handle.
///
/// `shards` controls registry sharding. This library does not spawn threads;
/// concurrent calls on one handle serialize per device.
#[no_mangle]
pub extern "C" fn trv_proxy_new(shards: usize, host: TrvHostVTable) -> *mut TrvProxyHandle {
    let handle = TrvProxyHandle {
        inner: ProxySupervisor::new(shards.max(1)),
        host: FfiHost { vt: host },
        clock: SystemClock::new(),
    };
    Box::into_raw(Box::new(handle))
}

#[no_mangle]
pub unsafe extern "C" fn trv_proxy_free(h: *mut TrvProxyHandle) {
    if !h.is_null() {
        drop(Box::from_raw(h));
    }
}

/// Register a device from a JSON `DeviceConfig` document.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_register_device(h: *mut TrvProxyHandle, id: TrvStr, cfg_json: TrvStr) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let (Some(id), Some(json)) = (id.as_str(), cfg_json.as_str()) else {
        return TRV_ERR_UTF8;
    };
    let cfg = match DeviceConfig::from_json(json) {
        Ok(c) => c,
        Err(_) => return TRV_ERR_JSON,
    };
    match handle.inner.register(id, cfg) {
        Ok(()) => TRV_OK,
        Err(e) => rc_for(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn trv_proxy_deregister_device(h: *mut TrvProxyHandle, id: TrvStr) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let Some(id) = id.as_str() else {
        return TRV_ERR_UTF8;
    };
    match (*h).inner.deregister(id) {
        Ok(()) => TRV_OK,
        Err(e) => rc_for(&e),
    }
}

/// Hot-reload a device's configuration from JSON.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_update_config(h: *mut TrvProxyHandle, id: TrvStr, cfg_json: TrvStr) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let (Some(id), Some(json)) = (id.as_str(), cfg_json.as_str()) else {
        return TRV_ERR_UTF8;
    };
    let cfg = match DeviceConfig::from_json(json) {
        Ok(c) => c,
        Err(_) => return TRV_ERR_JSON,
    };
    outcome_rc(handle.inner.update_config(&handle.host, &handle.clock, id, cfg))
}

/// 1 = a cycle ran, 0 = coalesced into one already running.
fn outcome_rc(r: trv_proxy_supervisor::Result<CycleOutcome>) -> i32 {
    match r {
        Ok(CycleOutcome::Ran(_)) => 1,
        Ok(CycleOutcome::Coalesced) => 0,
        Err(e) => rc_for(&e),
    }
}

/// Periodic tick over every device. Returns the number of cycles that ran.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_tick(h: *mut TrvProxyHandle) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let out = handle.inner.on_periodic_tick(&handle.host, &handle.clock);
    out.iter().filter(|(_, o)| matches!(o, CycleOutcome::Ran(_))).count() as i32
}

/// External event; `kind` is an `EventKind` wire code.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_event(h: *mut TrvProxyHandle, id: TrvStr, kind: u8) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let Some(id) = id.as_str() else {
        return TRV_ERR_UTF8;
    };
    let Some(kind) = EventKind::from_u8(kind) else {
        return TRV_ERR_BAD_ARG;
    };
    outcome_rc(handle.inner.on_external_event(&handle.host, &handle.clock, id, kind))
}

#[no_mangle]
pub unsafe extern "C" fn trv_proxy_set_target(h: *mut TrvProxyHandle, id: TrvStr, value_c: f64) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let Some(id) = id.as_str() else {
        return TRV_ERR_UTF8;
    };
    outcome_rc(handle.inner.set_target_temperature(&handle.host, &handle.clock, id, value_c))
}

/// `mode`: 0 = off, 1 = heat.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_set_hvac_mode(h: *mut TrvProxyHandle, id: TrvStr, mode: u8) -> i32 {
    if h.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let Some(id) = id.as_str() else {
        return TRV_ERR_UTF8;
    };
    let mode = match mode {
        0 => HvacMode::Off,
        1 => HvacMode::Heat,
        _ => return TRV_ERR_BAD_ARG,
    };
    outcome_rc(handle.inner.set_hvac_mode(&handle.host, &handle.clock, id, mode))
}

/// Seconds until the device's next window deadline, written to `out_s`.
/// Returns 1 when a deadline is pending, 0 when none.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_next_deadline(h: *mut TrvProxyHandle, id: TrvStr, out_s: *mut f64) -> i32 {
    if h.is_null() || out_s.is_null() {
        return TRV_ERR_NULL;
    }
    let handle = &*h;
    let Some(id) = id.as_str() else {
        return TRV_ERR_UTF8;
    };
    match handle.inner.next_deadline(id) {
        Ok(Some(deadline)) => {
            *out_s = (deadline - handle.clock.monotonic_s()).max(0.0);
            1
        }
        Ok(None) => 0,
        Err(e) => rc_for(&e),
    }
}

/// Periodic tick interval configured for the device, in seconds.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_control_interval(h: *mut TrvProxyHandle, id: TrvStr, out_s: *mut f64) -> i32 {
    if h.is_null() || out_s.is_null() {
        return TRV_ERR_NULL;
    }
    let Some(id) = id.as_str() else {
        return TRV_ERR_UTF8;
    };
    match (*h).inner.device_control_interval_s(id) {
        Ok(interval) => {
            *out_s = interval;
            TRV_OK
        }
        Err(e) => rc_for(&e),
    }
}

/// Last cycle report of a device as JSON (`null` before the first cycle).
/// Null buffer on error.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_status_json(h: *mut TrvProxyHandle, id: TrvStr) -> TrvBytes {
    if h.is_null() {
        return TrvBytes::null();
    }
    let Some(id) = id.as_str() else {
        return TrvBytes::null();
    };
    match (*h).inner.last_report(id) {
        Ok(report) => match serde_json::to_vec(&report) {
            Ok(buf) => TrvBytes::from_vec(buf),
            Err(_) => TrvBytes::null(),
        },
        Err(_) => TrvBytes::null(),
    }
}

/// Snapshot all devices as a JSON document.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_snapshot(h: *mut TrvProxyHandle) -> TrvBytes {
    if h.is_null() {
        return TrvBytes::null();
    }
    match serde_json::to_vec(&(*h).inner.snapshot()) {
        Ok(buf) => TrvBytes::from_vec(buf),
        Err(_) => TrvBytes::null(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn trv_proxy_bytes_free(b: TrvBytes) {
    if !b.ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(b.ptr, b.len);
        drop(Box::from_raw(slice_ptr));
    }
}

/// Restore from a snapshot produced by `trv_proxy_snapshot`.
/// `merge != 0` leaves devices absent from the snapshot untouched.
#[no_mangle]
pub unsafe extern "C" fn trv_proxy_restore(
    h: *mut TrvProxyHandle,
    bytes: *const u8,
    len: usize,
    merge: u8,
) -> TrvRestoreStats {
    let fail = |rc| TrvRestoreStats { applied: 0, skipped: 0, rc };
    if h.is_null() || bytes.is_null() {
        return fail(TRV_ERR_NULL);
    }
    let handle = &*h;
    let data = std::slice::from_raw_parts(bytes, len);
    let Ok(json) = std::str::from_utf8(data) else {
        return fail(TRV_ERR_UTF8);
    };
    let snap = match SupervisorSnapshot::from_json(json) {
        Ok(s) => s,
        Err(e) => return fail(rc_for(&e)),
    };
    let stats = if merge != 0 {
        handle.inner.restore_merge(snap, &handle.clock)
    } else {
        handle.inner.restore(snap, &handle.clock)
    };
    TrvRestoreStats {
        applied: stats.applied as u32,
        skipped: stats.skipped as u32,
        rc: TRV_OK,
    }
}

/// Command policy tunables for the stateless entry point.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrvPolicyCfg {
    pub min_command_interval_s: f64,
    pub min_setpoint_delta_c: f64,
    pub step_up_limit_c: f64,
}

#[no_mangle]
pub extern "C" fn trv_policy_cfg_default() -> TrvPolicyCfg {
    let d = CommandPolicyConfig::default();
    TrvPolicyCfg {
        min_command_interval_s: d.min_command_interval_s,
        min_setpoint_delta_c: d.min_setpoint_delta_c,
        step_up_limit_c: d.step_up_limit_c,
    }
}

/// Policy reason as a C-friendly enum.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrvPolicyReason {
    FirstSend = 0,
    BelowMinDelta = 1,
    UrgentDecrease = 2,
    RateLimited = 3,
    StepUpLimited = 4,
    StepUpTooSmall = 5,
    Send = 6,
}

fn reason_to_ffi(r: PolicyReason) -> TrvPolicyReason {
    match r {
        PolicyReason::FirstSend => TrvPolicyReason::FirstSend,
        PolicyReason::BelowMinDelta => TrvPolicyReason::BelowMinDelta,
        PolicyReason::UrgentDecrease => TrvPolicyReason::UrgentDecrease,
        PolicyReason::RateLimited => TrvPolicyReason::RateLimited,
        PolicyReason::StepUpLimited => TrvPolicyReason::StepUpLimited,
        PolicyReason::StepUpTooSmall => TrvPolicyReason::StepUpTooSmall,
        PolicyReason::Send => TrvPolicyReason::Send,
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TrvPolicyDecision {
    pub send: u8,
    pub setpoint: f64,
    pub reason: TrvPolicyReason,
}

/// Stateless command policy (no fast recovery). `has_last = 0` means
/// nothing has been sent yet.
#[no_mangle]
pub extern "C" fn trv_policy_apply(
    cfg: TrvPolicyCfg,
    desired_c: f64,
    has_last: u8,
    last_sent_c: f64,
    last_sent_ts: f64,
    now_ts: f64,
) -> TrvPolicyDecision {
    let policy = CommandPolicy::new(CommandPolicyConfig {
        min_command_interval_s: cfg.min_command_interval_s,
        min_setpoint_delta_c: cfg.min_setpoint_delta_c,
        step_up_limit_c: cfg.step_up_limit_c,
        ..CommandPolicyConfig::default()
    });
    let (last, ts) = if has_last != 0 { (Some(last_sent_c), Some(last_sent_ts)) } else { (None, None) };
    let d = policy.apply(desired_c, last, ts, now_ts);
    TrvPolicyDecision {
        send: d.send as u8,
        setpoint: d.setpoint,
        reason: reason_to_ffi(d.reason),
    }
}
