//! Sharded device registry.
//!
//! Devices are keyed by id and spread over shards with a deterministic hash.
//! Each device sits behind its own mutex, so a slow actuator write on one
//! device never blocks another. Cycles for the same device never overlap:
//! a request arriving while one is in flight is coalesced into a single
//! re-run performed by the thread already holding the device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{Clock, ThermostatHost};
use crate::config::DeviceConfig;
use crate::device::{CycleReport, DeviceLoop, DeviceSnapshot, EventKind, HvacMode};
use crate::error::{Result, SupervisorError};

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Ran(CycleReport),
    /// Another caller was mid-cycle; it will run once more on our behalf.
    Coalesced,
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Ran(r) => Some(r),
            CycleOutcome::Coalesced => None,
        }
    }
}

/// Snapshot of supervisor state for storage-agnostic persistence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    /// Per-device state, sorted by id.
    pub devices: Vec<(String, DeviceSnapshot)>,
}

impl SupervisorSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Counters returned by restore operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    /// Devices whose state was loaded from the snapshot.
    pub applied: usize,
    /// Snapshot entries for devices that are not registered.
    pub skipped: usize,
}

#[derive(Debug)]
struct DeviceSlot {
    device: Mutex<DeviceLoop>,
    rerun: AtomicBool,
    /// Latest coalesced trigger, as `EventKind::to_u8`.
    trigger: AtomicU8,
}

impl DeviceSlot {
    fn new(device: DeviceLoop) -> Self {
        Self {
            device: Mutex::new(device),
            rerun: AtomicBool::new(false),
            trigger: AtomicU8::new(EventKind::Startup.to_u8()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceLoop> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default, Debug)]
struct Shard {
    devices: HashMap<String, Arc<DeviceSlot>>,
}

/// Deterministic FNV-1a hash (stable across runs).
fn fnv1a_u64(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn shard_index(device_id: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    (fnv1a_u64(device_id) as usize) % shard_count
}

/// Registry of proxied thermostats.
///
/// `shards == 1` behaves like a single registry lock. The supervisor spawns
/// no threads; callers share it across threads behind an `Arc`.
#[derive(Debug)]
pub struct ProxySupervisor {
    shards: Vec<Mutex<Shard>>,
}

impl Default for ProxySupervisor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ProxySupervisor {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, device_id: &str) -> MutexGuard<'_, Shard> {
        self.shards[shard_index(device_id, self.shards.len())]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, device_id: &str) -> Result<Arc<DeviceSlot>> {
        self.shard(device_id)
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownDevice(device_id.to_string()))
    }

    pub fn register(&self, device_id: impl Into<String>, cfg: DeviceConfig) -> Result<()> {
        let device_id = device_id.into();
        let device = DeviceLoop::new(device_id.clone(), cfg)?;
        let mut shard = self.shard(&device_id);
        if shard.devices.contains_key(&device_id) {
            return Err(SupervisorError::DuplicateDevice(device_id));
        }
        debug!(device = %device_id, "device registered");
        shard.devices.insert(device_id, Arc::new(DeviceSlot::new(device)));
        Ok(())
    }

    pub fn deregister(&self, device_id: &str) -> Result<()> {
        self.shard(device_id)
            .devices
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| SupervisorError::UnknownDevice(device_id.to_string()))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.shard(device_id).devices.contains_key(device_id)
    }

    /// Registered ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            out.extend(guard.devices.keys().cloned());
        }
        out.sort();
        out
    }

    /// Run one cycle for `device_id`, or coalesce into the one in flight.
    pub fn run_cycle(
        &self,
        host: &dyn ThermostatHost,
        clock: &dyn Clock,
        device_id: &str,
        trigger: EventKind,
    ) -> Result<CycleOutcome> {
        let slot = self.slot(device_id)?;
        Ok(Self::drive(&slot, host, clock, trigger))
    }

    fn drive(slot: &DeviceSlot, host: &dyn ThermostatHost, clock: &dyn Clock, trigger: EventKind) -> CycleOutcome {
        slot.trigger.store(trigger.to_u8(), Ordering::SeqCst);
        slot.rerun.store(true, Ordering::SeqCst);

        let mut last = None;
        loop {
            let mut device = match slot.device.try_lock() {
                Ok(g) => g,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    return match last {
                        Some(r) => CycleOutcome::Ran(r),
                        None => {
                            debug!(trigger = trigger.as_str(), "cycle coalesced");
                            CycleOutcome::Coalesced
                        }
                    }
                }
            };
            while slot.rerun.swap(false, Ordering::SeqCst) {
                let kind = EventKind::from_u8(slot.trigger.load(Ordering::SeqCst)).unwrap_or(trigger);
                last = Some(device.run_cycle(host, clock, kind));
            }
            drop(device);

            // A request that landed between the final swap and the unlock
            // found the lock held and returned; pick it up here.
            if !slot.rerun.load(Ordering::SeqCst) {
                break;
            }
        }
        match last {
            Some(r) => CycleOutcome::Ran(r),
            None => CycleOutcome::Coalesced,
        }
    }

    /// One cycle per device, in id order.
    pub fn on_periodic_tick(&self, host: &dyn ThermostatHost, clock: &dyn Clock) -> Vec<(String, CycleOutcome)> {
        let mut out = Vec::new();
        for id in self.device_ids() {
            // Deregistered since the id list was taken.
            if let Ok(outcome) = self.run_cycle(host, clock, &id, EventKind::PeriodicTick) {
                out.push((id, outcome));
            }
        }
        out
    }

    pub fn on_external_event(
        &self,
        host: &dyn ThermostatHost,
        clock: &dyn Clock,
        device_id: &str,
        event: EventKind,
    ) -> Result<CycleOutcome> {
        self.run_cycle(host, clock, device_id, event)
    }

    pub fn set_target_temperature(
        &self,
        host: &dyn ThermostatHost,
        clock: &dyn Clock,
        device_id: &str,
        value_c: f64,
    ) -> Result<CycleOutcome> {
        let slot = self.slot(device_id)?;
        slot.lock().set_setpoint(value_c)?;
        Ok(Self::drive(&slot, host, clock, EventKind::SetpointChanged))
    }

    pub fn set_hvac_mode(
        &self,
        host: &dyn ThermostatHost,
        clock: &dyn Clock,
        device_id: &str,
        mode: HvacMode,
    ) -> Result<CycleOutcome> {
        let slot = self.slot(device_id)?;
        slot.lock().set_hvac_mode(mode);
        Ok(Self::drive(&slot, host, clock, EventKind::HvacModeChanged))
    }

    /// Hot reload; regulator state and command memory are kept.
    pub fn update_config(
        &self,
        host: &dyn ThermostatHost,
        clock: &dyn Clock,
        device_id: &str,
        cfg: DeviceConfig,
    ) -> Result<CycleOutcome> {
        let slot = self.slot(device_id)?;
        slot.lock().apply_config(cfg)?;
        Ok(Self::drive(&slot, host, clock, EventKind::ConfigReloaded))
    }

    pub fn last_report(&self, device_id: &str) -> Result<Option<CycleReport>> {
        Ok(self.slot(device_id)?.lock().last_report().cloned())
    }

    /// Earliest pending window deadline on the monotonic clock.
    pub fn next_deadline(&self, device_id: &str) -> Result<Option<f64>> {
        Ok(self.slot(device_id)?.lock().next_deadline())
    }

    /// Shortest configured tick period across devices, for a host that
    /// drives all of them from one timer.
    pub fn control_interval_s(&self) -> Option<f64> {
        self.slots()
            .into_iter()
            .map(|(_, slot)| slot.lock().control_interval_s())
            .filter(|s| *s > 0.0)
            .min_by(f64::total_cmp)
    }

    pub fn device_control_interval_s(&self, device_id: &str) -> Result<f64> {
        Ok(self.slot(device_id)?.lock().control_interval_s())
    }

    pub fn device_snapshot(&self, device_id: &str) -> Result<DeviceSnapshot> {
        Ok(self.slot(device_id)?.lock().snapshot())
    }

    fn slots(&self) -> Vec<(String, Arc<DeviceSlot>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            out.extend(guard.devices.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Export all device state, sorted by id.
    ///
    /// No IO: callers decide how and where to persist this.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            devices: self
                .slots()
                .into_iter()
                .map(|(id, slot)| {
                    let snap = slot.lock().snapshot();
                    (id, snap)
                })
                .collect(),
        }
    }

    /// Export only the devices matching `predicate`.
    pub fn snapshot_filtered<F>(&self, mut predicate: F) -> SupervisorSnapshot
    where
        F: FnMut(&str, &DeviceSnapshot) -> bool,
    {
        let mut snap = self.snapshot();
        snap.devices.retain(|(id, s)| predicate(id, s));
        snap
    }

    /// Load a snapshot into the registered devices.
    ///
    /// Registered devices missing from the snapshot are reset to their
    /// configured defaults; unknown ids are skipped.
    pub fn restore(&self, snap: SupervisorSnapshot, clock: &dyn Clock) -> RestoreStats {
        let now = clock.monotonic_s();
        let mut pending: HashMap<String, DeviceSnapshot> = snap.devices.into_iter().collect();
        let mut stats = RestoreStats::default();
        for (id, slot) in self.slots() {
            let mut device = slot.lock();
            match pending.remove(&id) {
                Some(s) => {
                    device.restore(s, now);
                    stats.applied += 1;
                }
                None => {
                    let fresh = DeviceSnapshot {
                        setpoint_c: device.config().default_setpoint_c,
                        ..DeviceSnapshot::default()
                    };
                    device.restore(fresh, now);
                }
            }
        }
        stats.skipped = pending.len();
        stats
    }

    /// Like [`restore`](Self::restore) but leaves devices absent from the
    /// snapshot untouched.
    pub fn restore_merge(&self, snap: SupervisorSnapshot, clock: &dyn Clock) -> RestoreStats {
        let now = clock.monotonic_s();
        let mut stats = RestoreStats::default();
        for (id, s) in snap.devices {
            match self.slot(&id) {
                Ok(slot) => {
                    slot.lock().restore(s, now);
                    stats.applied += 1;
                }
                Err(_) => stats.skipped += 1,
            }
        }
        stats
    }
}
