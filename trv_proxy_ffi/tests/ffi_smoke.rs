//! FFI smoke tests.
//!
//! These call the exported `extern "C"` functions directly (as an external
//! consumer would) to validate:
//! - the host vtable is driven correctly
//! - allocation/free symmetry for returned buffers
//! - snapshot/restore round-trip works

use std::ffi::c_void;
use std::ptr;

use trv_proxy_ffi::*;

fn s(s: &str) -> TrvStr {
    TrvStr {
        ptr: s.as_ptr(),
        len: s.len(),
    }
}

#[derive(Default)]
struct Host {
    room_c: Option<f64>,
    writes: Vec<f64>,
}

unsafe fn host<'a>(ctx: *mut c_void) -> &'a mut Host {
    &mut *(ctx as *mut Host)
}

unsafe extern "C" fn read_sensor(ctx: *mut c_void, _entity: TrvStr, out: *mut f64) -> u8 {
    match host(ctx).room_c {
        Some(v) => {
            *out = v;
            1
        }
        None => 0,
    }
}

unsafe extern "C" fn read_actuator(ctx: *mut c_void, _entity: TrvStr, out: *mut TrvActuatorReading) {
    if let Some(&last) = host(ctx).writes.last() {
        (*out).has_setpoint = 1;
        (*out).setpoint_c = last;
    }
}

unsafe extern "C" fn write_setpoint(ctx: *mut c_void, _entity: TrvStr, value_c: f64) -> i32 {
    host(ctx).writes.push(value_c);
    0
}

fn vtable(h: &mut Host) -> TrvHostVTable {
    TrvHostVTable {
        ctx: h as *mut Host as *mut c_void,
        read_sensor: Some(read_sensor),
        read_window: None,
        read_actuator: Some(read_actuator),
        write_setpoint: Some(write_setpoint),
    }
}

const CFG: &str = r#"{"room_sensor":"sensor.room","actuator":"climate.trv"}"#;

unsafe fn bytes_to_string(b: &TrvBytes) -> String {
    let data = std::slice::from_raw_parts(b.ptr, b.len);
    String::from_utf8(data.to_vec()).unwrap()
}

#[test]
fn ffi_version_and_stateless_policy() {
    assert_eq!(trv_proxy_ffi_version(), TRV_PROXY_FFI_VERSION);

    let cfg = trv_policy_cfg_default();
    assert_eq!(cfg.min_command_interval_s, 60.0);

    let d = trv_policy_apply(cfg, 21.0, 0, 0.0, 0.0, 100.0);
    assert_eq!(d.send, 1);
    assert_eq!(d.reason, TrvPolicyReason::FirstSend);

    let d = trv_policy_apply(cfg, 20.1, 1, 20.0, 0.0, 100.0);
    assert_eq!(d.send, 0);
    assert_eq!(d.reason, TrvPolicyReason::BelowMinDelta);
    assert_eq!(d.setpoint, 20.0);

    let d = trv_policy_apply(cfg, 22.0, 1, 20.0, 0.0, 100.0);
    assert_eq!(d.reason, TrvPolicyReason::StepUpLimited);
    assert_eq!(d.setpoint, 20.5);
}

#[test]
fn ffi_register_tick_and_status() {
    let mut host_state = Host { room_c: Some(18.0), ..Host::default() };
    let h = trv_proxy_new(2, vtable(&mut host_state));
    assert!(!h.is_null());

    unsafe {
        assert_eq!(trv_proxy_register_device(h, s("living"), s(CFG)), TRV_OK);
        assert_eq!(trv_proxy_register_device(h, s("living"), s(CFG)), TRV_ERR_DUPLICATE_DEVICE);
        assert_eq!(trv_proxy_register_device(h, s("bad"), s("{not json")), TRV_ERR_JSON);
        assert_eq!(trv_proxy_register_device(h, s("empty"), s("{}")), TRV_ERR_CONFIG);

        assert_eq!(trv_proxy_tick(h), 1);
        assert_eq!(trv_proxy_event(h, s("kitchen"), 1), TRV_ERR_UNKNOWN_DEVICE);
        assert_eq!(trv_proxy_event(h, s("living"), 200), TRV_ERR_BAD_ARG);
        assert_eq!(trv_proxy_set_target(h, s("living"), f64::NAN), TRV_ERR_INVALID_SETPOINT);

        let status = trv_proxy_status_json(h, s("living"));
        assert!(!status.ptr.is_null());
        let json = bytes_to_string(&status);
        assert!(json.contains("sent(first_send)"), "{json}");
        trv_proxy_bytes_free(status);

        let mut remaining = -1.0;
        assert_eq!(trv_proxy_next_deadline(h, s("living"), &mut remaining), 0);
        let mut interval = 0.0;
        assert_eq!(trv_proxy_control_interval(h, s("living"), &mut interval), TRV_OK);
        assert_eq!(interval, 60.0);
        assert_eq!(trv_proxy_control_interval(h, s("nope"), &mut interval), TRV_ERR_UNKNOWN_DEVICE);

        assert_eq!(trv_proxy_set_hvac_mode(h, s("living"), 0), 1);
        trv_proxy_free(h);
    }
    assert_eq!(host_state.writes, vec![25.0, 5.0]);
}

#[test]
fn ffi_snapshot_restore_roundtrip() {
    let mut host_state = Host { room_c: Some(20.0), ..Host::default() };
    let h = trv_proxy_new(1, vtable(&mut host_state));

    unsafe {
        assert_eq!(trv_proxy_register_device(h, s("living"), s(CFG)), TRV_OK);
        assert_eq!(trv_proxy_set_target(h, s("living"), 21.0), 1);

        let snap = trv_proxy_snapshot(h);
        assert!(!snap.ptr.is_null());
        assert!(bytes_to_string(&snap).contains("living"));

        let stats = trv_proxy_restore(h, snap.ptr as *const u8, snap.len, 0);
        assert_eq!(stats.rc, TRV_OK);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.skipped, 0);

        let bad = b"not a snapshot";
        let stats = trv_proxy_restore(h, bad.as_ptr(), bad.len(), 1);
        assert_eq!(stats.rc, TRV_ERR_JSON);

        let stats = trv_proxy_restore(h, ptr::null(), 0, 0);
        assert_eq!(stats.rc, TRV_ERR_NULL);

        trv_proxy_bytes_free(snap);
        trv_proxy_free(h);
    }
}
