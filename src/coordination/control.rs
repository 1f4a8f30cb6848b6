//! External control input and the fatigue signal
//!
//! The UI layer and the drowsiness detector live outside the core. Their
//! handlers only stage intent here; the coordination loop picks it up at the
//! start of its next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::types::Lane;

/// Intent staged between two ticks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedControl {
    /// Latest lane-change request; consumed by the next tick, never queued
    pub lane_request: Option<Lane>,
    /// Sum of speed deltas requested since the last tick (m/s)
    pub speed_delta: f32,
    /// Number of drowsy-mode toggles since the last tick
    pub drowsy_toggles: u32,
    pub spawn_emergency: bool,
    pub clear_emergency: bool,
}

impl StagedControl {
    pub fn is_empty(&self) -> bool {
        *self == StagedControl::default()
    }
}

/// Cloneable handle given to whatever produces control events
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    staged: Arc<Mutex<StagedControl>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn stage(&self, f: impl FnOnce(&mut StagedControl)) {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut staged);
    }

    pub fn request_lane_change(&self, lane: Lane) {
        self.stage(|s| s.lane_request = Some(lane));
    }

    pub fn request_speed_delta(&self, delta: f32) {
        if delta.is_finite() {
            self.stage(|s| s.speed_delta += delta);
        }
    }

    pub fn toggle_drowsy(&self) {
        self.stage(|s| s.drowsy_toggles += 1);
    }

    pub fn spawn_emergency(&self) {
        self.stage(|s| {
            s.spawn_emergency = true;
            s.clear_emergency = false;
        });
    }

    pub fn clear_emergency(&self) {
        self.stage(|s| {
            s.clear_emergency = true;
            s.spawn_emergency = false;
        });
    }

    /// Take everything staged so far, leaving nothing behind
    pub fn take(&self) -> StagedControl {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *staged)
    }
}

/// Boolean fatigue signal polled once per tick
pub trait FatigueSignal: Send {
    fn is_fatigued(&mut self) -> bool;
}

/// A detector that never reports fatigue
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFatigue;

impl FatigueSignal for NoFatigue {
    fn is_fatigued(&mut self) -> bool {
        false
    }
}

/// Fatigue flag shared with a detector running on another thread
#[derive(Debug, Clone, Default)]
pub struct SharedFatigueFlag {
    flag: Arc<AtomicBool>,
}

impl SharedFatigueFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, fatigued: bool) {
        self.flag.store(fatigued, Ordering::Relaxed);
    }
}

impl FatigueSignal for SharedFatigueFlag {
    fn is_fatigued(&mut self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
