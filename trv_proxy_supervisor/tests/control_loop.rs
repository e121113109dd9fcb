use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

use trv_proxy_core::Mode;
use trv_proxy_supervisor::{
    ActuatorReading, CycleOutcome, CycleReport, DeviceConfig, EventKind, HostError, HvacAction,
    HvacMode, ManualClock, OverrideReason, ProxySupervisor, SupervisorError, SupervisorSnapshot,
    ThermostatHost,
};

#[derive(Default)]
struct Entities {
    sensors: HashMap<String, f64>,
    windows: HashMap<String, bool>,
    actuators: HashMap<String, ActuatorReading>,
    writes: Vec<(String, f64)>,
}

struct FakeHost {
    entities: Mutex<Entities>,
    fail_writes: AtomicBool,
    sensor_reads: AtomicUsize,
    block_next_write: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            entities: Mutex::new(Entities::default()),
            fail_writes: AtomicBool::new(false),
            sensor_reads: AtomicUsize::new(0),
            block_next_write: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }

    fn set_room(&self, entity: &str, value: f64) {
        self.entities.lock().unwrap().sensors.insert(entity.to_string(), value);
    }

    fn set_window(&self, entity: &str, open: bool) {
        self.entities.lock().unwrap().windows.insert(entity.to_string(), open);
    }

    fn writes(&self) -> Vec<(String, f64)> {
        self.entities.lock().unwrap().writes.clone()
    }
}

impl ThermostatHost for FakeHost {
    fn read_sensor(&self, entity: &str) -> Option<f64> {
        self.sensor_reads.fetch_add(1, Ordering::SeqCst);
        self.entities.lock().unwrap().sensors.get(entity).copied()
    }

    fn read_window(&self, entity: &str) -> Option<bool> {
        self.entities.lock().unwrap().windows.get(entity).copied()
    }

    fn read_actuator(&self, entity: &str) -> ActuatorReading {
        self.entities.lock().unwrap().actuators.get(entity).copied().unwrap_or_default()
    }

    fn write_actuator_setpoint(&self, entity: &str, value_c: f64) -> Result<(), HostError> {
        if self.block_next_write.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HostError::WriteFailed {
                entity: entity.to_string(),
                message: "timeout".to_string(),
            });
        }
        let mut e = self.entities.lock().unwrap();
        e.writes.push((entity.to_string(), value_c));
        let reading = e.actuators.entry(entity.to_string()).or_default();
        reading.current_setpoint_c = Some(value_c);
        Ok(())
    }
}

fn living() -> DeviceConfig {
    DeviceConfig::new("sensor.living", "climate.living")
}

fn ran(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Ran(r) => r,
        CycleOutcome::Coalesced => panic!("expected a cycle to run"),
    }
}

fn tick(sup: &ProxySupervisor, host: &FakeHost, clock: &ManualClock, id: &str) -> CycleReport {
    ran(sup.on_external_event(host, clock, id, EventKind::PeriodicTick).unwrap())
}

fn setup(cfg: DeviceConfig) -> (ProxySupervisor, FakeHost, ManualClock) {
    let sup = ProxySupervisor::new(4);
    sup.register("living", cfg).unwrap();
    (sup, FakeHost::new(), ManualClock::new(100.0, 1_000.0))
}

#[test]
fn missing_or_invalid_room_reading_waits() {
    let (sup, host, clock) = setup(living());

    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "waiting_for_sensors");
    assert!(r.result.is_none());

    host.set_room("sensor.living", f64::NAN);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "waiting_for_sensors");
    assert!(host.writes().is_empty());
    assert_eq!(sup.device_snapshot("living").unwrap().memory.last_sent_setpoint(), None);
}

#[test]
fn cold_start_sends_boost_target_once() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 18.0);

    let r = tick(&sup, &host, &clock, "living");
    // The actuator has not reported anything yet; only the room sensor gates the cycle.
    assert_eq!(r.actuator_temperature_c, None);
    assert_eq!(r.status, "sent(first_send)");
    assert_eq!(r.sent_c, Some(25.0));
    assert_eq!(r.result.as_ref().map(|x| x.mode), Some(Mode::Boost));
    assert_eq!(host.writes(), vec![("climate.living".to_string(), 25.0)]);

    clock.advance(10.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "below_min_delta(0.2C)");
    assert_eq!(host.writes().len(), 1);
}

#[test]
fn increases_are_rate_limited_then_step_limited() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 20.0);

    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.sent_c, Some(20.0));

    clock.advance(10.0);
    let r = ran(sup.set_target_temperature(&host, &clock, "living", 20.2).unwrap());
    assert_eq!(r.trigger, EventKind::SetpointChanged);
    assert_eq!(r.status, "rate_limited(50s)");
    assert_eq!(r.sent_c, None);

    clock.advance(50.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "sent(step_up_limited(0.5C))");
    assert_eq!(r.sent_c, Some(20.5));
}

#[test]
fn failed_write_leaves_memory_untouched_and_retries() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 18.0);
    host.fail_writes.store(true, Ordering::SeqCst);

    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "write_failed(first_send)");
    assert!(r.write_error.as_deref().is_some_and(|e| e.contains("timeout")));
    assert_eq!(sup.device_snapshot("living").unwrap().memory.last_sent_setpoint(), None);

    host.fail_writes.store(false, Ordering::SeqCst);
    clock.advance(10.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "sent(first_send)");
    assert_eq!(sup.device_snapshot("living").unwrap().memory.last_sent_setpoint(), Some(25.0));
}

#[test]
fn hvac_off_drops_to_frost_protection() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 18.0);
    tick(&sup, &host, &clock, "living");

    clock.advance(5.0);
    let r = ran(sup.set_hvac_mode(&host, &clock, "living", HvacMode::Off).unwrap());
    assert_eq!(r.status, "sent(urgent_decrease)");
    assert_eq!(r.sent_c, Some(5.0));
    assert_eq!(r.hvac_action, HvacAction::Off);
}

#[test]
fn open_window_forces_frost_then_resumes_once() {
    let cfg = living().with_window_sensor("binary_sensor.living_window", 0.0, 0.0);
    let (sup, host, clock) = setup(cfg);
    host.set_room("sensor.living", 20.0);
    host.set_window("binary_sensor.living_window", false);

    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.sent_c, Some(20.0));

    host.set_window("binary_sensor.living_window", true);
    clock.advance(10.0);
    let r = ran(sup.on_external_event(&host, &clock, "living", EventKind::WindowSensorChanged).unwrap());
    assert_eq!(r.status, "sent(window_forced)|window_open_forced");
    assert_eq!(r.override_reason, Some(OverrideReason::WindowForced));
    assert_eq!(r.sent_c, Some(5.0));

    host.set_window("binary_sensor.living_window", false);
    clock.advance(10.0);
    let r = ran(sup.on_external_event(&host, &clock, "living", EventKind::WindowSensorChanged).unwrap());
    assert_eq!(r.status, "sent(window_resume)");
    assert_eq!(r.sent_c, Some(20.0));

    clock.advance(10.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.override_reason, None);
    assert_eq!(r.status, "below_min_delta(0.2C)");

    // Past the jump, increases go back through the step limit.
    clock.advance(60.0);
    let r = ran(sup.set_target_temperature(&host, &clock, "living", 20.2).unwrap());
    assert_eq!(r.override_reason, None);
    assert_eq!(r.status, "sent(step_up_limited(0.5C))");
    assert_eq!(r.sent_c, Some(20.5));
}

#[test]
fn close_hold_keeps_frost_until_expiry_then_resumes() {
    let cfg = living().with_window_sensor("binary_sensor.w", 0.0, 1.0);
    let (sup, host, clock) = setup(cfg);
    host.set_room("sensor.living", 20.0);
    host.set_window("binary_sensor.w", false);
    tick(&sup, &host, &clock, "living");

    host.set_window("binary_sensor.w", true);
    clock.advance(10.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.sent_c, Some(5.0));

    host.set_window("binary_sensor.w", false);
    clock.advance(10.0);
    let r = ran(sup.on_external_event(&host, &clock, "living", EventKind::WindowSensorChanged).unwrap());
    assert_eq!(r.status, "below_min_delta(0.2C)|window_close_hold");
    assert_eq!(r.sent_c, None);
    assert_eq!(sup.next_deadline("living").unwrap(), Some(180.0));

    clock.advance(30.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "below_min_delta(0.2C)|window_close_hold");
    assert_eq!(r.window.map(|w| w.close_remaining_s), Some(30.0));
    assert_eq!(host.writes().last().map(|w| w.1), Some(5.0));

    clock.advance(30.0);
    let r = ran(sup.on_external_event(&host, &clock, "living", EventKind::DeadlineExpired).unwrap());
    assert_eq!(r.override_reason, Some(OverrideReason::WindowResume));
    assert_eq!(r.status, "sent(window_resume)");
    assert_eq!(r.sent_c, Some(20.0));
}

#[test]
fn failed_resume_jump_stays_pending() {
    let cfg = living().with_window_sensor("binary_sensor.w", 0.0, 0.0);
    let (sup, host, clock) = setup(cfg);
    host.set_room("sensor.living", 20.0);
    host.set_window("binary_sensor.w", false);
    tick(&sup, &host, &clock, "living");

    host.set_window("binary_sensor.w", true);
    clock.advance(10.0);
    tick(&sup, &host, &clock, "living");

    host.set_window("binary_sensor.w", false);
    host.fail_writes.store(true, Ordering::SeqCst);
    clock.advance(10.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "write_failed(window_resume)");
    assert!(sup.device_snapshot("living").unwrap().resume_pending);

    host.fail_writes.store(false, Ordering::SeqCst);
    clock.advance(10.0);
    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "sent(window_resume)");
    assert!(!sup.device_snapshot("living").unwrap().resume_pending);
}

#[test]
fn open_delay_reports_pending_and_deadline() {
    let cfg = living().with_window_sensor("binary_sensor.w", 1.0, 2.0);
    let (sup, host, clock) = setup(cfg);
    host.set_room("sensor.living", 20.0);
    host.set_window("binary_sensor.w", true);

    let r = tick(&sup, &host, &clock, "living");
    assert_eq!(r.status, "sent(first_send)|window_open_pending");
    assert_eq!(sup.next_deadline("living").unwrap(), Some(160.0));

    clock.advance(60.0);
    let r = ran(sup.on_external_event(&host, &clock, "living", EventKind::DeadlineExpired).unwrap());
    assert!(r.status.ends_with("|window_open_forced"), "{}", r.status);
    assert_eq!(r.sent_c, Some(5.0));
    assert_eq!(sup.next_deadline("living").unwrap(), None);
}

#[test]
fn config_reload_keeps_memory_and_state() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 18.0);
    tick(&sup, &host, &clock, "living");

    clock.advance(10.0);
    let cfg = DeviceConfig { kp: Some(4.0), ..living() };
    let r = ran(sup.update_config(&host, &clock, "living", cfg).unwrap());
    assert_eq!(r.trigger, EventKind::ConfigReloaded);
    assert_eq!(r.status, "below_min_delta(0.2C)");

    let snap = sup.device_snapshot("living").unwrap();
    assert_eq!(snap.memory.last_sent_setpoint(), Some(25.0));
    assert_eq!(snap.controller_state.mode(), Mode::Boost);

    let bad = DeviceConfig { min_target_c: 30.0, ..living() };
    assert!(matches!(
        sup.update_config(&host, &clock, "living", bad),
        Err(SupervisorError::Config(_))
    ));
}

#[test]
fn snapshot_survives_json_and_skips_unknown_devices() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 18.0);
    sup.set_target_temperature(&host, &clock, "living", 21.5).unwrap();

    let json = sup.snapshot().to_json().unwrap();
    let snap = SupervisorSnapshot::from_json(&json).unwrap();
    assert_eq!(snap.devices.len(), 1);

    let restored = ProxySupervisor::new(2);
    restored.register("living", living()).unwrap();
    let later = ManualClock::new(5.0, 2_000.0);
    let stats = restored.restore(snap.clone(), &later);
    assert_eq!((stats.applied, stats.skipped), (1, 0));

    let dev = restored.device_snapshot("living").unwrap();
    assert_eq!(dev.setpoint_c, 21.5);
    assert_eq!(dev.memory.last_sent_setpoint(), Some(25.0));
    assert_eq!(dev.controller_state.mode(), Mode::Boost);

    let empty = ProxySupervisor::new(1);
    let stats = empty.restore_merge(snap, &later);
    assert_eq!((stats.applied, stats.skipped), (0, 1));
}

#[test]
fn concurrent_trigger_is_coalesced_into_one_rerun() {
    let (sup, host, clock) = setup(living());
    host.set_room("sensor.living", 18.0);
    host.block_next_write.store(true, Ordering::SeqCst);

    std::thread::scope(|s| {
        let first = s.spawn(|| sup.run_cycle(&host, &clock, "living", EventKind::PeriodicTick).unwrap());

        host.entered.wait();
        let second = sup.run_cycle(&host, &clock, "living", EventKind::RoomSensorChanged).unwrap();
        assert_eq!(second, CycleOutcome::Coalesced);
        host.release.wait();

        let r = ran(first.join().unwrap());
        assert_eq!(r.trigger, EventKind::RoomSensorChanged);
        assert_eq!(r.status, "below_min_delta(0.2C)");
    });
    assert_eq!(host.sensor_reads.load(Ordering::SeqCst), 2);
    assert_eq!(host.writes().len(), 1);
}

#[test]
fn devices_are_independent() {
    let sup = ProxySupervisor::new(3);
    sup.register("bedroom", DeviceConfig::new("sensor.bedroom", "climate.bedroom")).unwrap();
    sup.register("attic", DeviceConfig::new("sensor.attic", "climate.attic")).unwrap();
    let host = FakeHost::new();
    let clock = ManualClock::new(0.0, 0.0);
    host.set_room("sensor.bedroom", 18.0);

    let out = sup.on_periodic_tick(&host, &clock);
    let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["attic", "bedroom"]);
    assert_eq!(out[0].1.report().unwrap().status, "waiting_for_sensors");
    assert_eq!(out[1].1.report().unwrap().status, "sent(first_send)");

    assert!(matches!(
        sup.on_external_event(&host, &clock, "kitchen", EventKind::Startup),
        Err(SupervisorError::UnknownDevice(_))
    ));
}
