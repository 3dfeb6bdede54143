//! Dump batching queue.
//!
//! Scripts may emit values far faster than one IPC round-trip each. Producers
//! push into an unbounded FIFO through a [`DumpContext`]; a single consumer
//! ([`DumpQueue::pump`]) groups what arrives into batches bounded by a time
//! window, a maximum event count and an estimated byte size, and hands each
//! batch to a [`BatchSink`]. Byte-bounded batches always fit in one frame.
//!
//! Completion is signaled by dropping every `DumpContext`. The consumer only
//! observes it once the queue is empty, so buffered events are never dropped.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Instant};

use crate::dump::{DumpEvent, DumpPayload, ErrorRecord};
use crate::error::Result;
use crate::protocol::MAX_FRAME_LEN;

/// Maximum time a batch stays open after its first event.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(500);

/// Maximum number of events in one batch.
pub const DEFAULT_MAX_BATCH: usize = 10_000;

/// Estimated encoded bytes allowed in one batch. Half a frame, so the
/// estimate can be off without the frame being rejected.
pub const DEFAULT_MAX_BATCH_BYTES: usize = MAX_FRAME_LEN / 2;

/// Longest header kept on an event replaced for being too large.
const MAX_KEPT_HEADER: usize = 1024;

/// What to do when a batch cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Log and drop the batch.
    #[default]
    BestEffort,
    /// Try up to `attempts` times in total, then drop.
    Retry { attempts: u32 },
}

/// Batching parameters.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub window: Duration,
    pub max_batch: usize,
    /// A batch closes early once its events' estimated size would pass this.
    pub max_batch_bytes: usize,
    pub delivery: DeliveryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_BATCH_WINDOW,
            max_batch: DEFAULT_MAX_BATCH,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            delivery: DeliveryPolicy::default(),
        }
    }
}

/// Destination of flushed batches.
pub trait BatchSink: Send + Sync {
    fn deliver(&self, batch: Vec<DumpEvent>) -> impl Future<Output = Result<()>> + Send;
}

/// Counters reported when a pump finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub batches: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Producer handle given to a running script.
///
/// Each run owns its context; nothing is written to process-global streams.
#[derive(Debug, Clone)]
pub struct DumpContext {
    tx: UnboundedSender<DumpEvent>,
}

impl DumpContext {
    /// Enqueue an event. Never blocks.
    pub fn emit(&self, event: DumpEvent) {
        // The consumer only goes away once the execution is over.
        let _ = self.tx.send(event);
    }
}

/// Consumer side of the queue.
#[derive(Debug)]
pub struct DumpQueue {
    rx: UnboundedReceiver<DumpEvent>,
}

/// Create a connected producer/consumer pair.
pub fn dump_queue() -> (DumpContext, DumpQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DumpContext { tx }, DumpQueue { rx })
}

impl DumpQueue {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<DumpEvent> {
        self.rx.try_recv().ok()
    }

    /// Flush batches to `sink` until every producer is gone and the queue is
    /// drained.
    pub async fn pump<S: BatchSink>(mut self, sink: &S, config: &BatchConfig) -> PumpStats {
        let max_batch = config.max_batch.max(1);
        let max_bytes = config.max_batch_bytes;
        let mut stats = PumpStats::default();
        // Event that did not fit the previous batch; it opens the next one.
        let mut carried = None;

        loop {
            let first = match carried.take() {
                Some(event) => event,
                None => match time::timeout(config.window, self.rx.recv()).await {
                    Ok(Some(event)) => fit_to_budget(event, max_bytes),
                    Ok(None) => break,
                    // Idle window with producers still alive: keep waiting.
                    Err(_) => continue,
                },
            };

            let opened = Instant::now();
            let mut bytes = first.encoded_size_hint();
            let mut batch = vec![first];
            let mut closed = false;

            while batch.len() < max_batch {
                let remaining = config.window.saturating_sub(opened.elapsed());
                if remaining.is_zero() {
                    break;
                }
                match time::timeout(remaining, self.rx.recv()).await {
                    Ok(Some(event)) => {
                        let event = fit_to_budget(event, max_bytes);
                        let size = event.encoded_size_hint();
                        if bytes + size > max_bytes {
                            carried = Some(event);
                            break;
                        }
                        bytes += size;
                        batch.push(event);
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            flush(sink, batch, config.delivery, &mut stats).await;

            if closed {
                break;
            }
        }

        tracing::debug!(
            batches = stats.batches,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Dump queue drained"
        );
        stats
    }
}

/// Replace an event that cannot fit in any batch with an error saying so.
fn fit_to_budget(event: DumpEvent, max_bytes: usize) -> DumpEvent {
    let size = event.encoded_size_hint();
    if size <= max_bytes {
        return event;
    }

    tracing::warn!("Dump event of ~{} bytes exceeds the {} byte batch limit", size, max_bytes);
    DumpEvent {
        header: event.header.filter(|h| h.len() <= MAX_KEPT_HEADER),
        payload: DumpPayload::Error(ErrorRecord {
            kind: "OutputTooLarge".to_string(),
            message: format!(
                "output of about {} bytes exceeds the {} byte limit and was not sent",
                size, max_bytes
            ),
            location: None,
        }),
    }
}

async fn flush<S: BatchSink>(
    sink: &S,
    mut batch: Vec<DumpEvent>,
    policy: DeliveryPolicy,
    stats: &mut PumpStats,
) {
    let len = batch.len();
    let attempts = match policy {
        DeliveryPolicy::BestEffort => 1,
        DeliveryPolicy::Retry { attempts } => attempts.max(1),
    };

    let mut attempt = 1;
    loop {
        let last = attempt >= attempts;
        let payload = if last {
            std::mem::take(&mut batch)
        } else {
            batch.clone()
        };

        match sink.deliver(payload).await {
            Ok(()) => {
                stats.batches += 1;
                stats.delivered += len;
                return;
            }
            Err(e) if !last => {
                tracing::debug!("Dump delivery attempt {} failed: {}", attempt, e);
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!("Dropping {} dump events after failed delivery: {}", len, e);
                stats.dropped += len;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Collector {
        batches: Mutex<Vec<(Duration, Vec<DumpEvent>)>>,
        started: Instant,
    }

    impl Collector {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                started: Instant::now(),
            }
        }

        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(|(_, b)| b.len()).collect()
        }

        fn texts(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, b)| b.iter())
                .map(|e| e.as_value().unwrap().text.clone())
                .collect()
        }
    }

    impl BatchSink for Collector {
        async fn deliver(&self, batch: Vec<DumpEvent>) -> Result<()> {
            let at = self.started.elapsed();
            self.batches.lock().unwrap().push((at, batch));
            Ok(())
        }
    }

    /// Fails the first `failures` deliveries.
    struct Flaky {
        failures: AtomicUsize,
        inner: Collector,
    }

    impl BatchSink for Flaky {
        async fn deliver(&self, batch: Vec<DumpEvent>) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Ipc("broken pipe".to_string()));
            }
            self.inner.deliver(batch).await
        }
    }

    fn int(i: usize) -> DumpEvent {
        DumpEvent::value("int", i.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_split_at_max_size_and_keep_order() {
        let (ctx, queue) = dump_queue();
        for i in 0..25_000 {
            ctx.emit(int(i));
        }
        drop(ctx);

        let sink = Collector::new();
        let stats = queue.pump(&sink, &BatchConfig::default()).await;

        assert_eq!(sink.sizes(), vec![10_000, 10_000, 5_000]);
        let expected: Vec<String> = (0..25_000).map(|i| i.to_string()).collect();
        assert_eq!(sink.texts(), expected);
        assert_eq!(stats.delivered, 25_000);
        assert_eq!(stats.batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_closes_when_window_elapses() {
        let (ctx, queue) = dump_queue();
        let producer = tokio::spawn(async move {
            ctx.emit(int(0));
            time::sleep(Duration::from_millis(200)).await;
            ctx.emit(int(1));
            time::sleep(Duration::from_millis(400)).await;
            ctx.emit(int(2));
        });

        let sink = Collector::new();
        queue.pump(&sink, &BatchConfig::default()).await;
        producer.await.unwrap();

        assert_eq!(sink.sizes(), vec![2, 1]);
        assert_eq!(sink.texts(), vec!["0", "1", "2"]);
        let first_flush = sink.batches.lock().unwrap()[0].0;
        assert!(first_flush >= DEFAULT_BATCH_WINDOW);
        assert!(first_flush < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_producer_does_not_stop_the_pump() {
        let (ctx, queue) = dump_queue();
        let producer = tokio::spawn(async move {
            time::sleep(Duration::from_millis(1_200)).await;
            ctx.emit(int(42));
        });

        let sink = Collector::new();
        queue.pump(&sink, &BatchConfig::default()).await;
        producer.await.unwrap();

        assert_eq!(sink.texts(), vec!["42"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_drains_remaining_events() {
        let (ctx, queue) = dump_queue();
        let second = ctx.clone();
        ctx.emit(int(1));
        second.emit(int(2));
        drop(ctx);
        second.emit(int(3));
        drop(second);

        let sink = Collector::new();
        let stats = queue.pump(&sink, &BatchConfig::default()).await;

        assert_eq!(sink.texts(), vec!["1", "2", "3"]);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_events_means_no_batches() {
        let (ctx, queue) = dump_queue();
        drop(ctx);

        let sink = Collector::new();
        let stats = queue.pump(&sink, &BatchConfig::default()).await;
        assert!(sink.sizes().is_empty());
        assert_eq!(stats, PumpStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_drops_failed_batch() {
        let (ctx, queue) = dump_queue();
        ctx.emit(int(1));
        drop(ctx);

        let sink = Flaky {
            failures: AtomicUsize::new(1),
            inner: Collector::new(),
        };
        let stats = queue.pump(&sink, &BatchConfig::default()).await;

        assert_eq!(stats.dropped, 1);
        assert!(sink.inner.sizes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_redelivers() {
        let (ctx, queue) = dump_queue();
        ctx.emit(int(1));
        ctx.emit(int(2));
        drop(ctx);

        let sink = Flaky {
            failures: AtomicUsize::new(2),
            inner: Collector::new(),
        };
        let config = BatchConfig {
            delivery: DeliveryPolicy::Retry { attempts: 3 },
            ..BatchConfig::default()
        };
        let stats = queue.pump(&sink, &config).await;

        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(sink.inner.texts(), vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_closes_at_byte_budget() {
        let (ctx, queue) = dump_queue();
        for i in 0..5 {
            ctx.emit(DumpEvent::value("string", i.to_string().repeat(1_000)));
        }
        ctx.emit(int(9));
        drop(ctx);

        let sink = Collector::new();
        let config = BatchConfig {
            max_batch_bytes: 2_500,
            ..BatchConfig::default()
        };
        let stats = queue.pump(&sink, &config).await;

        // Two 1 KB strings per batch; the small final value rides with the last.
        assert_eq!(sink.sizes(), vec![2, 2, 2]);
        assert_eq!(stats.delivered, 6);
        assert_eq!(sink.texts().last().map(String::as_str), Some("9"));
        for (_, batch) in sink.batches.lock().unwrap().iter() {
            let bytes: usize = batch.iter().map(DumpEvent::encoded_size_hint).sum();
            assert!(bytes <= 2_500);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_event_becomes_visible_error() {
        let (ctx, queue) = dump_queue();
        ctx.emit(DumpEvent::value("string", "x".repeat(10_000)).with_header("big"));
        ctx.emit(int(1));
        drop(ctx);

        let sink = Collector::new();
        let config = BatchConfig {
            max_batch_bytes: 1_000,
            ..BatchConfig::default()
        };
        let stats = queue.pump(&sink, &config).await;

        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 0);
        let batches = sink.batches.lock().unwrap();
        let events: Vec<&DumpEvent> = batches.iter().flat_map(|(_, b)| b.iter()).collect();
        assert_eq!(events[0].header.as_deref(), Some("big"));
        match &events[0].payload {
            DumpPayload::Error(e) => assert_eq!(e.kind, "OutputTooLarge"),
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(events[1].as_value().unwrap().text, "1");
    }
}
