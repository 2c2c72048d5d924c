//! Connection lifetime policy and the activity-driven idle timer.
//!
//! The surrounding process supplies per-user-level timeout policy; this
//! module carries the defaults and the timer that enforces them. The timer
//! is re-armed on every observed byte and its timeout shrinks when a
//! connection goes half-closed, allowing a polite drain of the remaining
//! direction.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Timeouts applied across a connection's lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Full-duplex phase: abort when no activity is seen for this long.
    pub connection_idle: Duration,
    /// Half-closed, uplink only: drain window after the downlink finished.
    pub uplink_only: Duration,
    /// Half-closed, downlink only: drain window after the uplink finished.
    pub downlink_only: Duration,
    /// Budget for completing a handshake or a fallback dial.
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(2),
            downlink_only: Duration::from_secs(5),
            handshake: Duration::from_secs(5),
        }
    }
}

/// Policy attached to a user level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    /// Timeout set for this level.
    pub timeouts: Timeouts,
}

/// Supplies a [`Policy`] per user level.
///
/// Levels without an explicit entry get the defaults.
#[derive(Debug, Default)]
pub struct PolicyManager {
    levels: HashMap<u32, Policy>,
}

impl PolicyManager {
    /// Create a manager with default policy for every level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy for a specific user level.
    pub fn set_level(&mut self, level: u32, policy: Policy) {
        self.levels.insert(level, policy);
    }

    /// Policy for the given user level.
    pub fn for_level(&self, level: u32) -> Policy {
        self.levels.get(&level).copied().unwrap_or_default()
    }
}

/// Cancels a connection that shows no activity within its current timeout.
///
/// Both pump directions call [`update`] whenever bytes move; either calls
/// [`set_timeout`] when its side finishes so the other gets a bounded drain
/// window instead of the full idle budget.
///
/// [`update`]: Self::update
/// [`set_timeout`]: Self::set_timeout
pub struct ActivityTimer {
    state: Mutex<TimerState>,
    rearmed: Notify,
}

struct TimerState {
    last_activity: Instant,
    timeout: Duration,
}

impl ActivityTimer {
    /// Create a timer armed with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(TimerState {
                last_activity: Instant::now(),
                timeout,
            }),
            rearmed: Notify::new(),
        }
    }

    /// Record activity, pushing the deadline out.
    pub fn update(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Change the timeout for the next lifecycle phase. Also counts as
    /// activity, so the new window starts now.
    pub fn set_timeout(&self, timeout: Duration) {
        {
            let mut state = self.state.lock();
            state.timeout = timeout;
            state.last_activity = Instant::now();
        }
        // The new window may end before the deadline the watcher sleeps on.
        // notify_one stores a permit, so a watcher between polls still wakes.
        self.rearmed.notify_one();
    }

    fn deadline(&self) -> Instant {
        let state = self.state.lock();
        state.last_activity + state.timeout
    }

    /// Resolves once the idle window elapses without activity.
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.rearmed.notified() => {}
            }
        }
    }
}
