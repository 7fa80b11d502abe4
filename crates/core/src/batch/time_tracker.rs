//! Run time tracking
//!
//! Elapsed time only accumulates while the tracker is running and the host
//! is not suspended. Task time is accumulated separately from the real
//! duration of each agent call.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::model::RunTiming;

#[derive(Debug, Default)]
struct Inner {
    /// Start of the current active period
    active_since: Option<Instant>,
    accumulated: Duration,
    task_time: Duration,
    tracking: bool,
    suspended: bool,
}

impl Inner {
    fn close_period(&mut self) {
        if let Some(since) = self.active_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accumulated
            + self
                .active_since
                .map(|since| since.elapsed())
                .unwrap_or_default()
    }
}

/// Tracks wall-clock time of a run, excluding host suspension
#[derive(Debug, Default)]
pub struct TimeTracker {
    inner: Mutex<Inner>,
}

impl TimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) tracking from zero
    pub fn start(&self) {
        let mut inner = self.lock();
        let suspended = inner.suspended;
        *inner = Inner {
            active_since: (!suspended).then(Instant::now),
            tracking: true,
            suspended,
            ..Inner::default()
        };
    }

    /// Mark the host as suspended or awake
    pub fn set_suspended(&self, suspended: bool) {
        let mut inner = self.lock();
        if inner.suspended == suspended {
            return;
        }
        inner.suspended = suspended;
        if suspended {
            inner.close_period();
        } else if inner.tracking {
            inner.active_since = Some(Instant::now());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed()
    }

    /// Add the duration of one completed task
    pub fn record_task(&self, duration: Duration) {
        self.lock().task_time += duration;
    }

    pub fn cumulative_task_time(&self) -> Duration {
        self.lock().task_time
    }

    pub fn is_tracking(&self) -> bool {
        self.lock().tracking
    }

    pub fn timing(&self) -> RunTiming {
        let inner = self.lock();
        RunTiming {
            accumulated_elapsed_ms: inner.elapsed().as_millis() as u64,
            last_active_at: inner.tracking.then(Utc::now),
            cumulative_task_time_ms: inner.task_time.as_millis() as u64,
        }
    }

    /// Stop tracking and return the final elapsed time
    pub fn stop(&self) -> Duration {
        let mut inner = self.lock();
        inner.close_period();
        inner.tracking = false;
        inner.accumulated
    }
}
