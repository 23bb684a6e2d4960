#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityLevel {
    OBS_NONE,
    OBS_SAFE,
    OBS_DEV,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    OK,
    DEGRADED,
    FAULTED,
}

#[cfg(feature = "obs_none")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_NONE;

#[cfg(all(feature = "obs_dev", not(feature = "obs_none")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_DEV;

#[cfg(all(not(feature = "obs_none"), not(feature = "obs_dev")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_SAFE;

pub const OBS_NONE: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_NONE);
pub const OBS_DEV: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_DEV);

use std::sync::atomic::{AtomicU64, Ordering};

static HEALTH_STATE: AtomicU64 = AtomicU64::new(HealthState::OK as u64);

static SESSIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static START_FAILURES: AtomicU64 = AtomicU64::new(0);
static SESSIONS_STOPPED: AtomicU64 = AtomicU64::new(0);
static STOP_FAILURES: AtomicU64 = AtomicU64::new(0);
static STALE_INSTANCES_TERMINATED: AtomicU64 = AtomicU64::new(0);

#[inline]
fn bump(counter: &AtomicU64) {
    if !OBS_NONE {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn set_health(state: HealthState) {
    HEALTH_STATE.store(state as u64, Ordering::Relaxed);
}

#[inline]
pub fn get_health() -> HealthState {
    match HEALTH_STATE.load(Ordering::Relaxed) {
        x if x == HealthState::OK as u64 => HealthState::OK,
        x if x == HealthState::DEGRADED as u64 => HealthState::DEGRADED,
        _ => HealthState::FAULTED,
    }
}

#[inline]
pub fn record_session_started() {
    bump(&SESSIONS_STARTED);
    set_health(HealthState::OK);
}

#[inline]
pub fn record_start_failure() {
    bump(&START_FAILURES);
    set_health(HealthState::FAULTED);
}

#[inline]
pub fn record_session_stopped() {
    bump(&SESSIONS_STOPPED);
}

/// A teardown error leaves the host possibly dirty; health drops to degraded.
#[inline]
pub fn record_stop_failure() {
    bump(&STOP_FAILURES);
    set_health(HealthState::DEGRADED);
}

#[inline]
pub fn record_stale_instance_terminated() {
    bump(&STALE_INSTANCES_TERMINATED);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilitySnapshot {
    pub sessions_started: u64,
    pub start_failures: u64,
    pub sessions_stopped: u64,
    pub stop_failures: u64,
    pub stale_instances_terminated: u64,
    pub health: HealthState,
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        sessions_started: SESSIONS_STARTED.load(Ordering::Relaxed),
        start_failures: START_FAILURES.load(Ordering::Relaxed),
        sessions_stopped: SESSIONS_STOPPED.load(Ordering::Relaxed),
        stop_failures: STOP_FAILURES.load(Ordering::Relaxed),
        stale_instances_terminated: STALE_INSTANCES_TERMINATED.load(Ordering::Relaxed),
        health: get_health(),
    }
}
