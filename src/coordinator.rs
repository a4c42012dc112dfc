//! The per-request readiness gate
//!
//! Every proxied request calls [`Coordinator::ensure_ready`] before it is
//! forwarded. The call holds a single lock for its whole duration, including
//! any build and the wait for a restarted backend, so concurrent requests
//! queue behind one build/restart and none of them can reach a stale backend.
//! The locked section runs on its own task, so a build always runs to
//! completion even if every waiting request goes away.

use crate::error::{BuildError, LifecycleError, StartError};
use crate::lifecycle::LifecycleState;
use crate::runner::ProcessRunner;
use crate::waiter::{wait_reachable, Dialer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source of lifecycle timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub struct Coordinator {
    state: Mutex<LifecycleState>,
    runner: Arc<dyn ProcessRunner>,
    dialer: Arc<dyn Dialer>,
    clock: Arc<dyn Clock>,
    backend_addr: String,
    connect_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        backend_addr: impl Into<String>,
        connect_timeout: Duration,
        runner: Arc<dyn ProcessRunner>,
        dialer: Arc<dyn Dialer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = LifecycleState::new(clock.now());
        Self {
            state: Mutex::new(state),
            runner,
            dialer,
            clock,
            backend_addr: backend_addr.into(),
            connect_timeout,
        }
    }

    /// Address requests are forwarded to once ready
    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    /// Record that the build inputs changed.
    pub async fn mark_dirty(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.mark_dirty(now) {
            debug!("Marked dirty");
        }
    }

    /// Build and restart as needed so the backend reflects the latest inputs.
    ///
    /// A failed build is replayed on every call until the next
    /// [`mark_dirty`](Self::mark_dirty). A failed start is retried on the
    /// next call.
    ///
    /// The work runs on its own task. Dropping the returned future (a client
    /// hanging up mid-build) does not interrupt a build or start in progress.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.ensure_ready_locked().await }).await?
    }

    async fn ensure_ready_locked(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;

        if state.needs_build() {
            self.build(&mut state).await?;
        } else if let Some(err) = state.last_build_error() {
            debug!(error = %err, "Replaying last build failure");
            return Err(err.clone().into());
        }

        if state.needs_restart() {
            if let Err(e) = self.start().await {
                warn!(addr = %self.backend_addr, timeout = e.is_timeout(), error = %e, "Backend failed to start");
                return Err(e.into());
            }
            state.record_start(self.clock.now());
            info!(addr = %self.backend_addr, "Backend is ready");
        }

        Ok(())
    }

    async fn build(&self, state: &mut LifecycleState) -> Result<(), BuildError> {
        state.begin_build(self.clock.now());

        match self.runner.build().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, output_bytes = e.output.len(), "Build failed");
                state.record_build_failure(e.clone());
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<(), StartError> {
        self.runner.launch().await?;
        wait_reachable(self.dialer.as_ref(), &self.backend_addr, self.connect_timeout).await?;
        Ok(())
    }

    /// Stop the backend once any in-flight build or start has finished.
    pub async fn shutdown(&self) {
        let _state = self.state.lock().await;
        info!("Stopping backend");
        self.runner.stop().await;
    }
}
