//! The dedicated script thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;

use crate::batch::DumpContext;
use crate::dump::{DumpEvent, DumpPayload, ErrorRecord};
use crate::error::{Error, Result};
use crate::script::CompiledUnit;

struct Job<U> {
    unit: U,
    ctx: DumpContext,
    done: oneshot::Sender<()>,
}

/// One OS thread that runs every unit of the process, in submission order.
pub struct ScriptThread<U> {
    jobs: mpsc::Sender<Job<U>>,
}

impl<U: CompiledUnit> ScriptThread<U> {
    pub fn spawn() -> Result<Self> {
        let (jobs, rx) = mpsc::channel::<Job<U>>();
        thread::Builder::new()
            .name("script-runner".to_string())
            .spawn(move || {
                for job in rx {
                    run_job(job);
                }
            })
            .map_err(|e| Error::Spawn(format!("Failed to start script thread: {}", e)))?;

        Ok(Self { jobs })
    }

    /// Run `unit` with `ctx` and wait for it. The context is dropped when the
    /// run ends, which closes the dump queue it feeds.
    pub async fn run(&self, unit: U, ctx: DumpContext) -> Result<()> {
        let (done, finished) = oneshot::channel();
        self.jobs
            .send(Job { unit, ctx, done })
            .map_err(|_| Error::Ipc("script thread is gone".to_string()))?;
        finished
            .await
            .map_err(|_| Error::Ipc("script thread stopped mid-run".to_string()))
    }
}

fn run_job<U: CompiledUnit>(job: Job<U>) {
    let Job { unit, ctx, done } = job;

    match panic::catch_unwind(AssertUnwindSafe(|| unit.run(&ctx))) {
        Ok(Ok(Some(value))) => ctx.emit(DumpEvent {
            header: None,
            payload: DumpPayload::Value(value),
        }),
        Ok(Ok(None)) => {}
        Ok(Err(record)) => ctx.emit(DumpEvent::error(record)),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!("Script panicked: {}", message);
            ctx.emit(DumpEvent::error(ErrorRecord {
                kind: "Panic".to_string(),
                message,
                location: None,
            }));
        }
    }

    drop(ctx);
    drop(unit);
    let _ = done.send(());
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
