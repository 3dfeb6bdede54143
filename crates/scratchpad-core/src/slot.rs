//! Lazily started, cancellable worker slot.
//!
//! A slot owns exactly one startup attempt. The attempt runs as its own task
//! the first time anyone asks for the handle, and every caller awaits the same
//! shared result. Disposing the slot cancels the attempt if it is still
//! running, or disposes the handle if it already finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::supervisor::{ServiceHandle, StartupError, Supervisor};

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a slot's startup attempt.
pub type SlotOutcome = Result<Arc<ServiceHandle>, StartupError>;

type Published = Arc<Mutex<Option<Arc<ServiceHandle>>>>;

pub struct ServiceSlot {
    id: u64,
    supervisor: Arc<Supervisor>,
    cancel: CancellationToken,
    attempt: OnceLock<Shared<BoxFuture<'static, SlotOutcome>>>,
    published: Published,
}

impl ServiceSlot {
    /// Create a slot. Nothing is spawned until [`handle`](Self::handle) is
    /// first awaited.
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            supervisor,
            cancel: CancellationToken::new(),
            attempt: OnceLock::new(),
            published: Arc::new(Mutex::new(None)),
        }
    }

    /// Monotonic identity used for compare-and-swap on the host pointer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start the worker on first call; later calls share the same attempt.
    pub async fn handle(&self) -> SlotOutcome {
        self.attempt.get_or_init(|| self.launch()).clone().await
    }

    /// Pid of the published worker, without waiting for startup.
    pub fn pid(&self) -> Option<u32> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| handle.pid())
    }

    /// Cancel startup or dispose the started worker. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
        let handle = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            tracing::debug!("Slot {} disposing worker {}", self.id, handle.pid());
            handle.dispose();
        }
    }

    fn launch(&self) -> Shared<BoxFuture<'static, SlotOutcome>> {
        tracing::debug!("Slot {} starting worker", self.id);
        let task = tokio::spawn(run_attempt(
            self.id,
            self.supervisor.clone(),
            self.cancel.clone(),
            self.published.clone(),
        ));

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(StartupError::Spawn(format!("startup task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }
}

impl Drop for ServiceSlot {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_attempt(
    id: u64,
    supervisor: Arc<Supervisor>,
    cancel: CancellationToken,
    published: Published,
) -> SlotOutcome {
    let handle = Arc::new(supervisor.start_worker(&cancel).await?);

    // Publishing and disposal take the same lock, so exactly one side
    // disposes a handle that finishes while the slot is being disposed.
    let mut slot = published.lock().unwrap_or_else(PoisonError::into_inner);
    if cancel.is_cancelled() {
        drop(slot);
        tracing::debug!("Slot {} disposed during startup; killing worker {}", id, handle.pid());
        handle.dispose();
        return Err(StartupError::Cancelled);
    }
    *slot = Some(handle.clone());
    Ok(handle)
}
