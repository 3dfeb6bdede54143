//! Execution host facade.
//!
//! The host keeps a pointer to the current [`ServiceSlot`]. Callers snapshot
//! it, await the worker, and replace the slot only if it is still the one they
//! saw, so concurrent callers that notice the same dead worker start exactly
//! one replacement. `reset` overwrites the pointer unconditionally.

use std::sync::{Arc, Mutex, PoisonError};

use crate::channel::{DumpSink, RpcClient};
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::slot::ServiceSlot;
use crate::supervisor::{StartupError, Supervisor};

pub struct ExecutionHost {
    supervisor: Arc<Supervisor>,
    current: Mutex<Arc<ServiceSlot>>,
    max_attempts: usize,
}

impl ExecutionHost {
    /// Create a host. No worker is started until the first execution.
    pub fn new(config: HostConfig, sink: Arc<dyn DumpSink>) -> Result<Self> {
        config.validate()?;
        let max_attempts = config.max_attempts;
        let supervisor = Arc::new(Supervisor::new(config, sink)?);
        let current = Mutex::new(Arc::new(ServiceSlot::new(supervisor.clone())));

        Ok(Self {
            supervisor,
            current,
            max_attempts,
        })
    }

    fn current(&self) -> Arc<ServiceSlot> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return a client for a live worker, starting or replacing it as needed.
    pub async fn get_or_create_service(&self) -> Result<RpcClient> {
        let mut slot = self.current();
        let mut last_failure = None;

        for attempt in 1..=self.max_attempts {
            match slot.handle().await {
                Ok(handle) if handle.is_alive() => return Ok(handle.client().clone()),
                Ok(handle) => {
                    tracing::debug!("Worker {} is no longer alive", handle.pid());
                    last_failure = Some(StartupError::ProcessExited(format!(
                        "worker {} is no longer alive",
                        handle.pid()
                    )));
                }
                Err(StartupError::Cancelled) => {
                    tracing::debug!("Slot {} was cancelled", slot.id());
                    last_failure = Some(StartupError::Cancelled);
                }
                Err(e) => {
                    tracing::warn!(
                        "Worker startup failed (attempt {}/{}): {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_failure = Some(e);
                }
            }

            slot = self.replace_if_current(&slot);
        }

        Err(match last_failure {
            Some(StartupError::Cancelled) => Error::Cancelled,
            Some(e) => Error::HostUnavailable(e.to_string()),
            None => Error::HostUnavailable("no startup attempts were made".to_string()),
        })
    }

    /// Swap in a fresh slot if `stale` is still current. Returns the slot to
    /// use next.
    fn replace_if_current(&self, stale: &Arc<ServiceSlot>) -> Arc<ServiceSlot> {
        let fresh = Arc::new(ServiceSlot::new(self.supervisor.clone()));

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.id() == stale.id() {
            let old = std::mem::replace(&mut *current, fresh.clone());
            drop(current);
            tracing::debug!("Replaced slot {} with {}", old.id(), fresh.id());
            old.dispose();
            fresh
        } else {
            let winner = current.clone();
            drop(current);
            fresh.dispose();
            winner
        }
    }

    /// Compile and run `code` in the worker. Output goes to the host's sink
    /// before this returns.
    pub async fn execute(&self, code: &str) -> Result<()> {
        let client = self.get_or_create_service().await?;
        client.execute(code).await
    }

    /// Replace the worker with a fresh one and start it.
    ///
    /// Startup failures are logged; the next `execute` retries.
    pub async fn reset(&self) {
        let fresh = Arc::new(ServiceSlot::new(self.supervisor.clone()));
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, fresh)
        };
        tracing::info!("Resetting worker (slot {})", previous.id());
        previous.dispose();

        if let Err(e) = self.get_or_create_service().await {
            tracing::warn!("Failed to start worker after reset: {}", e);
        }
    }

    /// Pid of the current worker, if one has started.
    pub fn worker_pid(&self) -> Option<u32> {
        self.current().pid()
    }

    /// Kill the current worker. The host stays usable; the next execution
    /// starts a new one.
    pub fn shutdown(&self) {
        self.current().dispose();
    }
}

impl Drop for ExecutionHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}
