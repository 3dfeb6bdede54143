//! Worker process supervision.
//!
//! The supervisor launches `scratchpad-worker <endpoint> <handshake>`, waits
//! for the worker to signal readiness through the handshake file, connects
//! the RPC channel and sends the one-time `Initialize`. Every launched pid is
//! tracked globally so the host can kill stragglers on exit.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use fs2::FileExt;
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{DumpSink, RpcClient};
use crate::config::HostConfig;
use crate::error::Result;
use crate::paths;

/// How often the handshake file is checked while waiting.
const HANDSHAKE_POLL: Duration = Duration::from_millis(10);

/// Pids of every worker launched by this process and not yet terminated.
static TRACKED_WORKERS: LazyLock<Mutex<HashSet<u32>>> = LazyLock::new(Default::default);

fn tracked() -> std::sync::MutexGuard<'static, HashSet<u32>> {
    TRACKED_WORKERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Kill every tracked worker. Returns how many were signaled.
///
/// Safe to call from a signal handler task; handles of killed workers notice
/// on their next liveness check.
pub fn kill_tracked_workers() -> usize {
    let pids: Vec<u32> = tracked().drain().collect();
    for pid in &pids {
        #[cfg(unix)]
        {
            // SIGKILL for immediate termination
            unsafe {
                libc::kill(*pid as i32, libc::SIGKILL);
            }
        }
    }
    if !pids.is_empty() {
        tracing::info!("Killed {} tracked worker(s)", pids.len());
    }
    pids.len()
}

/// Number of workers launched and not yet terminated.
pub fn tracked_worker_count() -> usize {
    tracked().len()
}

/// Why a startup attempt produced no service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartupError {
    #[error("startup was cancelled")]
    Cancelled,

    #[error("worker exited during startup: {0}")]
    ProcessExited(String),

    #[error("failed to launch worker: {0}")]
    Spawn(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel setup failed: {0}")]
    Channel(String),
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Mutex<Child>,
    pid: u32,
    /// Whether `pid` is still in the tracked set on our behalf.
    tracked: AtomicBool,
    terminated: AtomicBool,
}

impl WorkerProcess {
    fn new(child: Child) -> std::result::Result<Self, StartupError> {
        let pid = child
            .id()
            .ok_or_else(|| StartupError::ProcessExited("worker exited immediately".to_string()))?;
        tracked().insert(pid);

        Ok(Self {
            child: Mutex::new(child),
            pid,
            tracked: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&self) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => {
                self.untrack();
                false
            }
            Err(_) => false,
        }
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = child.try_wait().ok().flatten();
        if status.is_some() {
            self.untrack();
        }
        status
    }

    /// Drop our pid from the tracked set. Once the child is reaped the pid
    /// may be reused, so this happens at most once.
    fn untrack(&self) {
        if self.tracked.swap(false, Ordering::SeqCst) {
            tracked().remove(&self.pid);
        }
    }

    /// Kill the process if it is still running. Idempotent; failures are
    /// logged, never returned.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.untrack();

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!("Worker {} had already exited ({})", self.pid, status);
            }
            _ => match child.start_kill() {
                Ok(()) => tracing::debug!("Killed worker {}", self.pid),
                Err(e) => tracing::warn!("Failed to kill worker {}: {}", self.pid, e),
            },
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Socket path removed when the handle that owns it goes away.
#[derive(Debug)]
struct Endpoint(PathBuf);

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// A started worker with its connected, initialized client.
#[derive(Debug)]
pub struct ServiceHandle {
    process: WorkerProcess,
    client: RpcClient,
    disposed: AtomicBool,
    _endpoint: Endpoint,
}

impl ServiceHandle {
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Process running and channel open.
    pub fn is_alive(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && !self.client.is_closed() && self.process.is_alive()
    }

    /// Kill the worker. Only the first call has an effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Disposing worker {}", self.pid());
        self.process.terminate();
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Exclusively held handshake file, unlocked and removed on drop.
struct Handshake {
    path: PathBuf,
    file: File,
}

impl Handshake {
    fn acquire(dir: &Path, cancel: &CancellationToken) -> std::result::Result<Self, StartupError> {
        loop {
            if cancel.is_cancelled() {
                return Err(StartupError::Cancelled);
            }

            let path = dir.join(format!("{}.handshake", Uuid::new_v4()));
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!("Handshake name {} taken, retrying", path.display());
                    continue;
                }
                Err(e) => {
                    return Err(StartupError::Handshake(format!(
                        "Failed to create {}: {}",
                        path.display(),
                        e
                    )));
                }
            };

            if let Err(e) = FileExt::try_lock_exclusive(&file) {
                let _ = fs::remove_file(&path);
                return Err(StartupError::Handshake(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    e
                )));
            }

            return Ok(Self { path, file });
        }
    }

    fn is_signaled(&self) -> bool {
        fs::read_to_string(&self.path).is_ok_and(|text| text.starts_with("ready"))
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Launches and connects workers.
pub struct Supervisor {
    config: HostConfig,
    worker_path: PathBuf,
    runtime_dir: PathBuf,
    sink: Arc<dyn DumpSink>,
}

impl Supervisor {
    /// Locate the worker binary and prepare the runtime directory.
    pub fn new(config: HostConfig, sink: Arc<dyn DumpSink>) -> Result<Self> {
        let worker_path = paths::find_worker_binary(config.worker_path.as_deref())?;
        let runtime_dir = paths::runtime_dir(config.runtime_dir.as_deref())?;
        tracing::debug!(
            "Using worker {} with runtime dir {}",
            worker_path.display(),
            runtime_dir.display()
        );

        Ok(Self {
            config,
            worker_path,
            runtime_dir,
            sink,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Start one worker: spawn, handshake, connect, initialize.
    ///
    /// Cancelling `cancel` at any point kills the spawned process.
    pub async fn start_worker(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<ServiceHandle, StartupError> {
        let handshake = Handshake::acquire(&self.runtime_dir, cancel)?;
        let endpoint = Endpoint(self.runtime_dir.join(format!("{}.sock", Uuid::new_v4())));

        let process = self.spawn(&endpoint.0, &handshake.path)?;
        tracing::info!("Started worker {}", process.pid());

        if let Err(e) = self.wait_for_handshake(&handshake, &process, cancel).await {
            process.terminate();
            return Err(e);
        }
        drop(handshake);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                process.terminate();
                return Err(StartupError::Cancelled);
            }
            result = RpcClient::connect(&endpoint.0, self.sink.clone()) => result,
        };
        let client = match connected {
            Ok(client) => client,
            Err(e) => return Err(Self::classify(&process, e)),
        };

        if cancel.is_cancelled() {
            process.terminate();
            return Err(StartupError::Cancelled);
        }

        if let Err(e) = client.initialize(self.config.initialize_params()).await {
            return Err(Self::classify(&process, e));
        }
        tracing::debug!("Worker {} initialized", process.pid());

        Ok(ServiceHandle {
            process,
            client,
            disposed: AtomicBool::new(false),
            _endpoint: endpoint,
        })
    }

    fn spawn(
        &self,
        endpoint: &Path,
        handshake: &Path,
    ) -> std::result::Result<WorkerProcess, StartupError> {
        let mut command = Command::new(&self.worker_path);
        command
            .arg(endpoint)
            .arg(handshake)
            .current_dir(&self.config.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .kill_on_drop(true);

        // Die with the host even if it is killed without running destructors.
        #[cfg(target_os = "linux")]
        {
            // SAFETY: prctl is async-signal-safe and touches no parent state.
            unsafe {
                command.pre_exec(|| {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(|e| {
            StartupError::Spawn(format!(
                "Failed to spawn worker process '{}': {}",
                self.worker_path.display(),
                e
            ))
        })?;

        WorkerProcess::new(child)
    }

    async fn wait_for_handshake(
        &self,
        handshake: &Handshake,
        process: &WorkerProcess,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), StartupError> {
        let timeout = self.config.handshake_timeout();
        let mut deadline = Instant::now() + timeout;

        loop {
            if handshake.is_signaled() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                if !process.is_alive() {
                    let status = process
                        .exit_status()
                        .map_or_else(|| "unknown status".to_string(), |s| s.to_string());
                    return Err(StartupError::ProcessExited(format!(
                        "worker {} exited before signaling readiness ({})",
                        process.pid(),
                        status
                    )));
                }
                tracing::debug!(
                    "Worker {} not ready after {:?}, still waiting",
                    process.pid(),
                    timeout
                );
                deadline = Instant::now() + timeout;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StartupError::Cancelled),
                _ = time::sleep(HANDSHAKE_POLL) => {}
            }
        }
    }

    /// A failed connect or initialize is retryable when the process died.
    fn classify(process: &WorkerProcess, error: crate::error::Error) -> StartupError {
        let classified = if process.is_alive() {
            StartupError::Channel(error.to_string())
        } else {
            StartupError::ProcessExited(format!("worker {} died: {}", process.pid(), error))
        };
        process.terminate();
        classified
    }
}
