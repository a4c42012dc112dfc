//! Timestamps and flags that decide whether a build or restart is due
//!
//! `LifecycleState` is plain data. It is owned by the
//! [`Coordinator`](crate::coordinator::Coordinator) and only touched while
//! its lock is held.

use crate::error::BuildError;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct LifecycleState {
    /// Most recent "inputs changed" signal; never moves backwards
    last_modified: Instant,
    /// Most recently attempted build, successful or not
    build_time: Option<Instant>,
    /// Most recently completed successful start
    start_time: Option<Instant>,
    /// Failure of the most recent build attempt, with its output
    last_build_error: Option<BuildError>,
}

impl LifecycleState {
    /// Fresh state at `now`: nothing to build, one start pending.
    pub fn new(now: Instant) -> Self {
        Self {
            last_modified: now,
            build_time: Some(now),
            start_time: None,
            last_build_error: None,
        }
    }

    /// Advance `last_modified` to `at` unless it is already later.
    ///
    /// Returns true if the timestamp moved.
    pub fn mark_dirty(&mut self, at: Instant) -> bool {
        if at > self.last_modified {
            self.last_modified = at;
            true
        } else {
            false
        }
    }

    pub fn needs_build(&self) -> bool {
        match self.build_time {
            Some(built) => built < self.last_modified,
            None => true,
        }
    }

    pub fn needs_restart(&self) -> bool {
        self.last_build_error.is_none() && self.start_time < self.build_time
    }

    /// Record a build attempt starting at `at` and forget the previous failure.
    pub fn begin_build(&mut self, at: Instant) {
        self.build_time = Some(at);
        self.last_build_error = None;
    }

    pub fn record_build_failure(&mut self, error: BuildError) {
        self.last_build_error = Some(error);
    }

    pub fn record_start(&mut self, at: Instant) {
        self.start_time = Some(at);
    }

    pub fn last_modified(&self) -> Instant {
        self.last_modified
    }

    pub fn build_time(&self) -> Option<Instant> {
        self.build_time
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn last_build_error(&self) -> Option<&BuildError> {
        self.last_build_error.as_ref()
    }
}
