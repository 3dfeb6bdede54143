//! Host side of the RPC channel to a worker.
//!
//! One reader task owns the receiving half of the socket. It completes
//! pending calls by correlation id and forwards `Dump` events to the host's
//! [`DumpSink`] in arrival order, so every batch of an execution reaches the
//! sink before that execution's reply.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::dump::DumpEvent;
use crate::error::{Error, Result};
use crate::protocol::{Call, Event, InitializeParams, Message, Outcome, read_message, write_message};

/// Receives output batches on the host.
///
/// Called from the channel's reader task; implementations should not block
/// for long. A panic is caught and the batch is dropped.
pub trait DumpSink: Send + Sync {
    fn on_batch(&self, batch: Vec<DumpEvent>);
}

/// Calls awaiting a response.
#[derive(Default)]
struct Pending {
    calls: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    closed: AtomicBool,
}

impl Pending {
    fn insert(&self, id: u64, tx: oneshot::Sender<Outcome>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Outcome>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Mark the channel closed and fail every outstanding call.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct Inner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Client for calls into one worker. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    /// Connect to a worker listening on `endpoint`.
    pub async fn connect(endpoint: &Path, sink: Arc<dyn DumpSink>) -> Result<Self> {
        let stream = UnixStream::connect(endpoint).await.map_err(|e| {
            Error::Ipc(format!(
                "Failed to connect to worker at {}: {}",
                endpoint.display(),
                e
            ))
        })?;
        Ok(Self::from_stream(stream, sink))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream, sink: Arc<dyn DumpSink>) -> Self {
        let (reader, writer) = stream.into_split();
        let pending = Arc::new(Pending::default());
        let reader = tokio::spawn(read_loop(reader, pending.clone(), sink));

        Self {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(writer),
                pending,
                next_id: AtomicU64::new(1),
                reader,
            }),
        }
    }

    /// Whether the worker side of the channel is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.pending.closed.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self, params: InitializeParams) -> Result<()> {
        self.call(Call::Initialize(params)).await
    }

    /// Run `code` in the worker. Returns once every dump it produced has
    /// been handed to the sink.
    pub async fn execute(&self, code: &str) -> Result<()> {
        self.call(Call::Execute {
            code: code.to_string(),
        })
        .await
    }

    async fn call(&self, call: Call) -> Result<()> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Register before checking `closed`: the reader clears the map after
        // setting the flag, so one of the two always catches a dead channel.
        self.inner.pending.insert(id, tx);
        if self.is_closed() {
            self.inner.pending.take(id);
            return Err(Error::ChannelClosed);
        }

        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = write_message(&mut *writer, &Message::Request { id, call }).await {
                self.inner.pending.take(id);
                return Err(e);
            }
        }

        match rx.await {
            Ok(Outcome::Ok) => Ok(()),
            Ok(Outcome::Fault { message }) => Err(Error::Remote(message)),
            Err(_) => Err(Error::ChannelClosed),
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, pending: Arc<Pending>, sink: Arc<dyn DumpSink>) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(Message::Response { id, outcome })) => match pending.take(id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => tracing::debug!("Dropping response for unknown call {}", id),
            },
            Ok(Some(Message::Event(Event::Dump { batch }))) => deliver(sink.as_ref(), batch),
            Ok(Some(Message::Request { id, .. })) => {
                tracing::warn!("Ignoring unexpected request {} from worker", id);
            }
            Ok(None) => {
                tracing::debug!("Worker closed the channel");
                break;
            }
            Err(e) => {
                tracing::debug!("Channel read failed: {}", e);
                break;
            }
        }
    }

    pending.close();
}

fn deliver(sink: &dyn DumpSink, batch: Vec<DumpEvent>) {
    let len = batch.len();
    if panic::catch_unwind(AssertUnwindSafe(|| sink.on_batch(batch))).is_err() {
        tracing::warn!("Dump sink panicked; dropped {} events", len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DumpEvent>>,
    }

    impl DumpSink for Recorder {
        fn on_batch(&self, batch: Vec<DumpEvent>) {
            self.events.lock().unwrap().extend(batch);
        }
    }

    /// Panics on the first batch, records the rest.
    #[derive(Default)]
    struct Grumpy {
        seen: AtomicUsize,
        events: Mutex<Vec<DumpEvent>>,
    }

    impl DumpSink for Grumpy {
        fn on_batch(&self, batch: Vec<DumpEvent>) {
            if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("sink failure");
            }
            self.events.lock().unwrap().extend(batch);
        }
    }

    async fn expect_request(reader: &mut OwnedReadHalf) -> (u64, Call) {
        match read_message(reader).await.unwrap() {
            Some(Message::Request { id, call }) => (id, call),
            other => panic!("Expected request, got {:?}", other),
        }
    }

    fn dump(text: &str) -> Message {
        Message::Event(Event::Dump {
            batch: vec![DumpEvent::value("int", text)],
        })
    }

    #[tokio::test]
    async fn test_events_arrive_before_reply() {
        let (host, worker) = UnixStream::pair().unwrap();
        let sink = Arc::new(Recorder::default());
        let client = RpcClient::from_stream(host, sink.clone());

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = worker.into_split();
            let (id, call) = expect_request(&mut reader).await;
            assert_eq!(
                call,
                Call::Execute {
                    code: "1".to_string()
                }
            );
            write_message(&mut writer, &dump("1")).await.unwrap();
            write_message(&mut writer, &Message::Response { id, outcome: Outcome::Ok })
                .await
                .unwrap();
        });

        client.execute("1").await.unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_maps_to_remote_error() {
        let (host, worker) = UnixStream::pair().unwrap();
        let client = RpcClient::from_stream(host, Arc::new(Recorder::default()));

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = worker.into_split();
            let (id, _) = expect_request(&mut reader).await;
            let outcome = Outcome::Fault {
                message: "script thread stopped".to_string(),
            };
            write_message(&mut writer, &Message::Response { id, outcome })
                .await
                .unwrap();
        });

        let err = client.execute("1").await.unwrap_err();
        assert!(matches!(err, Error::Remote(ref m) if m == "script thread stopped"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_exit_fails_pending_and_later_calls() {
        let (host, worker) = UnixStream::pair().unwrap();
        let client = RpcClient::from_stream(host, Arc::new(Recorder::default()));

        let server = tokio::spawn(async move {
            let (mut reader, writer) = worker.into_split();
            expect_request(&mut reader).await;
            drop(writer);
            drop(reader);
        });

        let err = client.execute("sleep(1000)").await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
        server.await.unwrap();

        assert!(client.is_closed());
        assert!(client.execute("1").await.is_err());
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_stop_the_reader() {
        let (host, worker) = UnixStream::pair().unwrap();
        let sink = Arc::new(Grumpy::default());
        let client = RpcClient::from_stream(host, sink.clone());

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = worker.into_split();
            let (id, _) = expect_request(&mut reader).await;
            write_message(&mut writer, &dump("1")).await.unwrap();
            write_message(&mut writer, &dump("2")).await.unwrap();
            write_message(&mut writer, &Message::Response { id, outcome: Outcome::Ok })
                .await
                .unwrap();
        });

        client.execute("x").await.unwrap();
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_value().unwrap().text, "2");
        drop(events);
        server.await.unwrap();
    }
}
