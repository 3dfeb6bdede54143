//! Worker process main loop: one host connection, requests served in order.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::batch::BatchSink;
use crate::dump::DumpEvent;
use crate::error::{Error, Result};
use crate::protocol::{Call, Event, Message, Outcome, read_message, write_message};
use crate::script::CompileService;

use super::service::WorkerService;

/// Writes frames to the host. Dump batches and replies share it.
struct ConnectionSink {
    writer: Mutex<OwnedWriteHalf>,
}

impl ConnectionSink {
    async fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await
    }
}

impl BatchSink for ConnectionSink {
    async fn deliver(&self, batch: Vec<DumpEvent>) -> Result<()> {
        self.send(&Message::Event(Event::Dump { batch })).await
    }
}

/// Tell the host we are listening by writing into its handshake file.
fn signal_ready(handshake: &Path) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(handshake).map_err(|e| {
        Error::Ipc(format!(
            "Failed to open handshake {}: {}",
            handshake.display(),
            e
        ))
    })?;
    file.write_all(format!("ready {}\n", std::process::id()).as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Listen on `endpoint`, signal `handshake`, and serve the first host that
/// connects until it disconnects.
pub async fn serve<C: CompileService>(
    endpoint: &Path,
    handshake: &Path,
    service: WorkerService<C>,
) -> Result<()> {
    // A stale socket from a crashed worker would make bind fail.
    let _ = std::fs::remove_file(endpoint);
    let listener = UnixListener::bind(endpoint).map_err(|e| {
        Error::Ipc(format!("Failed to bind {}: {}", endpoint.display(), e))
    })?;
    signal_ready(handshake)?;
    tracing::debug!("Listening on {}", endpoint.display());

    let (stream, _) = listener.accept().await?;
    drop(listener);
    let _ = std::fs::remove_file(endpoint);
    tracing::info!("Host connected");

    let (mut reader, writer) = stream.into_split();
    let sink = ConnectionSink {
        writer: Mutex::new(writer),
    };

    while let Some(message) = read_message(&mut reader).await? {
        let Message::Request { id, call } = message else {
            tracing::warn!("Ignoring unexpected message from host");
            continue;
        };

        let outcome = match call {
            Call::Initialize(params) => {
                service.initialize(params);
                Outcome::Ok
            }
            Call::Execute { code } => match service.execute(&code, &sink).await {
                Ok(stats) => {
                    tracing::debug!(
                        batches = stats.batches,
                        delivered = stats.delivered,
                        "Execution {} finished",
                        id
                    );
                    Outcome::Ok
                }
                Err(e) => {
                    tracing::error!("Execution {} failed: {}", id, e);
                    Outcome::Fault {
                        message: e.to_string(),
                    }
                }
            },
        };

        sink.send(&Message::Response { id, outcome }).await?;
    }

    tracing::info!("Host disconnected");
    Ok(())
}
