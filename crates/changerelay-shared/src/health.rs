//! Health check utilities

use crate::observability::{HealthCheck, HealthStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Health check that flags work stuck in progress.
///
/// Waiting for work is live; only a unit of work started with [`begin`] and
/// not finished within the timeout counts against health. It turns degraded
/// at half the timeout and unhealthy past it.
///
/// [`begin`]: ActivityHealthCheck::begin
pub struct ActivityHealthCheck {
    name: String,
    timeout: Duration,
    last_activity: RwLock<Instant>,
    in_progress: Mutex<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl ActivityHealthCheck {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            last_activity: RwLock::new(Instant::now()),
            in_progress: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Mark a unit of work as started; it ends when the guard is dropped
    pub fn begin(&self) -> ActivityGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_progress.lock().insert(id, Instant::now());
        ActivityGuard { check: self, id }
    }

    /// Update the last activity timestamp
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since work last finished
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Age of the oldest unit of work still in progress
    pub fn longest_in_progress(&self) -> Option<Duration> {
        self.in_progress
            .lock()
            .values()
            .map(|started| started.elapsed())
            .max()
    }
}

impl HealthCheck for ActivityHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> HealthStatus {
        match self.longest_in_progress() {
            Some(elapsed) if elapsed > self.timeout => HealthStatus::Unhealthy {
                reason: format!("Work in progress for {:?}", elapsed),
            },
            Some(elapsed) if elapsed > self.timeout / 2 => HealthStatus::Degraded {
                reason: format!("Slow work, in progress for {:?}", elapsed),
            },
            _ => HealthStatus::Healthy,
        }
    }
}

/// Ends a unit of work on drop and records activity
pub struct ActivityGuard<'a> {
    check: &'a ActivityHealthCheck,
    id: u64,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.check.in_progress.lock().remove(&self.id);
        self.check.record_activity();
    }
}
