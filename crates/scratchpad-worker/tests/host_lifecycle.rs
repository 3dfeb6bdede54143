//! End-to-end tests of the execution host against the real worker binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scratchpad_core::{
    DumpEvent, DumpPayload, DumpSink, Error, ExecutionHost, HostConfig, Severity,
};
use tempfile::TempDir;

const WORKER: &str = env!("CARGO_BIN_EXE_scratchpad-worker");

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<DumpEvent>>>,
}

impl DumpSink for Recorder {
    fn on_batch(&self, batch: Vec<DumpEvent>) {
        self.batches.lock().unwrap().push(batch);
    }
}

impl Recorder {
    /// All events received so far, clearing the record.
    fn take(&self) -> Vec<DumpEvent> {
        std::mem::take(&mut *self.batches.lock().unwrap())
            .into_iter()
            .flatten()
            .collect()
    }

    fn take_batches(&self) -> Vec<Vec<DumpEvent>> {
        std::mem::take(&mut *self.batches.lock().unwrap())
    }
}

fn config(temp: &TempDir) -> HostConfig {
    HostConfig {
        worker_path: Some(PathBuf::from(WORKER)),
        working_directory: temp.path().to_path_buf(),
        runtime_dir: Some(temp.path().join("run")),
        ..HostConfig::default()
    }
}

fn host_with(config: HostConfig) -> (ExecutionHost, Arc<Recorder>) {
    let sink = Arc::new(Recorder::default());
    let host = ExecutionHost::new(config, sink.clone()).unwrap();
    (host, sink)
}

fn values(events: &[DumpEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.as_value())
        .map(|v| v.text.clone())
        .collect()
}

/// A worker wrapper that records each launch before exec'ing the real one.
fn counting_worker(dir: &Path) -> (PathBuf, PathBuf) {
    let counter = dir.join("launches");
    let script = dir.join("counting-worker");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\necho x >> '{}'\nexec '{}' \"$@\"\n",
            counter.display(),
            WORKER
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, counter)
}

fn launches(counter: &Path) -> usize {
    fs::read_to_string(counter).map_or(0, |s| s.lines().count())
}

#[tokio::test]
async fn test_final_value_is_dumped() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("1 + 1").await.unwrap();

    let events = sink.take();
    assert_eq!(events.len(), 1);
    let value = events[0].as_value().unwrap();
    assert_eq!(value.type_name, "int");
    assert_eq!(value.text, "2");
    assert!(events[0].header.is_none());
}

#[tokio::test]
async fn test_dumps_precede_final_value() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("dump(1); dump(\"two\", \"second\"); 3")
        .await
        .unwrap();

    let events = sink.take();
    assert_eq!(values(&events), vec!["1", "two", "3"]);
    assert_eq!(events[1].header.as_deref(), Some("second"));
}

#[tokio::test]
async fn test_compile_error_reports_diagnostic() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("int x = \"bad\";").await.unwrap();
    let pid = host.worker_pid().unwrap();

    let events = sink.take();
    assert_eq!(events.len(), 1);
    match &events[0].payload {
        DumpPayload::Diagnostic(d) => {
            assert_eq!(d.severity, Severity::Error);
            assert!(d.message.contains("`x`"));
            assert!(d.location.is_some());
        }
        other => panic!("Expected diagnostic, got {:?}", other),
    }

    host.execute("1").await.unwrap();
    assert_eq!(host.worker_pid(), Some(pid));
}

#[tokio::test]
async fn test_exception_keeps_worker() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("dump(1); throw \"boom\";").await.unwrap();
    let pid = host.worker_pid().unwrap();

    let events = sink.take();
    assert_eq!(values(&events), vec!["1"]);
    match &events[1].payload {
        DumpPayload::Error(e) => {
            assert_eq!(e.kind, "Thrown");
            assert_eq!(e.message, "boom");
        }
        other => panic!("Expected error, got {:?}", other),
    }

    host.execute("2").await.unwrap();
    assert_eq!(host.worker_pid(), Some(pid));
}

#[tokio::test]
async fn test_sequential_executions_reuse_worker() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("1").await.unwrap();
    let pid = host.worker_pid();
    assert!(pid.is_some());

    for i in 2..5 {
        host.execute(&i.to_string()).await.unwrap();
        assert_eq!(host.worker_pid(), pid);
    }
    assert_eq!(values(&sink.take()), vec!["1", "2", "3", "4"]);
}

#[tokio::test]
async fn test_killed_worker_is_replaced() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("1").await.unwrap();
    let pid = host.worker_pid().unwrap();

    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    host.execute("2").await.unwrap();
    let replacement = host.worker_pid().unwrap();
    assert_ne!(replacement, pid);
    assert_eq!(values(&sink.take()), vec!["1", "2"]);
}

#[tokio::test]
async fn test_abort_fails_then_recovers() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("1").await.unwrap();
    let pid = host.worker_pid().unwrap();

    let err = host.execute("abort()").await.unwrap_err();
    assert!(matches!(err, Error::ChannelClosed), "{:?}", err);

    host.execute("3").await.unwrap();
    assert_ne!(host.worker_pid(), Some(pid));
    assert_eq!(values(&sink.take()), vec!["1", "3"]);
}

#[tokio::test]
async fn test_large_output_is_batched_in_order() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("for i in 0..25000 { dump(i) }").await.unwrap();

    let batches = sink.take_batches();
    assert!(batches.len() >= 3);
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 10_000));

    let events: Vec<DumpEvent> = batches.into_iter().flatten().collect();
    let expected: Vec<String> = (0..25_000).map(|i| i.to_string()).collect();
    assert_eq!(values(&events), expected);
}

#[tokio::test]
async fn test_reset_replaces_worker() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("let x = 1; x").await.unwrap();
    let pid = host.worker_pid().unwrap();

    host.reset().await;
    let fresh = host.worker_pid().unwrap();
    assert_ne!(fresh, pid);

    // State does not survive a reset.
    host.execute("x").await.unwrap();
    let events = sink.take();
    assert!(matches!(events.last().unwrap().payload, DumpPayload::Diagnostic(_)));
    assert_eq!(host.worker_pid(), Some(fresh));
}

#[tokio::test]
async fn test_reset_during_execute() {
    let temp = TempDir::new().unwrap();
    let (host, _sink) = host_with(config(&temp));

    host.execute("1").await.unwrap();
    let pid = host.worker_pid().unwrap();

    let (running, ()) = tokio::join!(host.execute("sleep(500); 1"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.reset().await;
    });
    // The interrupted call fails because its worker was killed.
    assert!(running.is_err());

    let fresh = host.worker_pid().unwrap();
    assert_ne!(fresh, pid);
    host.execute("2").await.unwrap();
    assert_eq!(host.worker_pid(), Some(fresh));
}

#[tokio::test]
async fn test_concurrent_callers_share_one_worker() {
    let temp = TempDir::new().unwrap();
    let (script, counter) = counting_worker(temp.path());
    let (host, sink) = host_with(HostConfig {
        worker_path: Some(script),
        ..config(&temp)
    });

    let (a, b, c) = tokio::join!(host.execute("1"), host.execute("2"), host.execute("3"));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(launches(&counter), 1);
    let mut seen = values(&sink.take());
    seen.sort();
    assert_eq!(seen, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_imports_gate_modules() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(HostConfig {
        imports: vec!["math".to_string()],
        ..config(&temp)
    });

    host.execute("text.upper(\"a\")").await.unwrap();
    let events = sink.take();
    match &events[0].payload {
        DumpPayload::Diagnostic(d) => assert!(d.message.contains("not imported")),
        other => panic!("Expected diagnostic, got {:?}", other),
    }

    host.execute("math.sqrt(16)").await.unwrap();
    assert_eq!(values(&sink.take()), vec!["4.0"]);
}

#[tokio::test]
async fn test_reference_bindings_are_visible() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("consts.pad"), "let answer = 42;").unwrap();
    let (host, sink) = host_with(HostConfig {
        references: vec!["consts.pad".to_string(), "missing.pad".to_string()],
        ..config(&temp)
    });

    host.execute("answer + 1").await.unwrap();
    let events = sink.take();

    assert!(matches!(
        &events[0].payload,
        DumpPayload::Diagnostic(d) if d.severity == Severity::Warning
    ));
    assert_eq!(values(&events), vec!["43"]);
}

#[tokio::test]
async fn test_shutdown_kills_worker_and_host_restarts() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("1").await.unwrap();
    let pid = host.worker_pid().unwrap();

    host.shutdown();
    host.execute("2").await.unwrap();
    assert_ne!(host.worker_pid(), Some(pid));
    assert_eq!(values(&sink.take()), vec!["1", "2"]);
}

#[test]
fn test_missing_worker_binary() {
    let temp = TempDir::new().unwrap();
    let config = HostConfig {
        worker_path: Some(temp.path().join("no-such-worker")),
        ..config(&temp)
    };
    let err = ExecutionHost::new(config, Arc::new(Recorder::default()))
        .err()
        .unwrap();
    assert!(matches!(err, Error::WorkerNotFound(_)));
}

#[tokio::test]
async fn test_deep_nesting_is_a_compile_error() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    host.execute("1").await.unwrap();
    let pid = host.worker_pid().unwrap();
    sink.take();

    let depth = 10_000;
    let code = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
    host.execute(&code).await.unwrap();

    let events = sink.take();
    assert_eq!(events.len(), 1);
    match &events[0].payload {
        DumpPayload::Diagnostic(d) => {
            assert_eq!(d.severity, Severity::Error);
            assert!(d.message.contains("nested too deeply"));
        }
        other => panic!("Expected diagnostic, got {:?}", other),
    }

    host.execute("2").await.unwrap();
    assert_eq!(host.worker_pid(), Some(pid));
    assert_eq!(values(&sink.take()), vec!["2"]);
}

#[tokio::test]
async fn test_output_larger_than_a_frame_is_delivered() {
    let temp = TempDir::new().unwrap();
    let (host, sink) = host_with(config(&temp));

    // Eight 16 MiB strings: far more than one frame holds.
    let code = "let s = \"x\"; \
                for i in 0..24 { s = s + s; } \
                for i in 0..8 { dump(s); } \
                1";
    host.execute(code).await.unwrap();

    let batches = sink.take_batches();
    assert!(batches.len() >= 2);
    let events: Vec<DumpEvent> = batches.into_iter().flatten().collect();
    assert_eq!(events.len(), 9);
    assert!(events[..8].iter().all(|e| e.as_value().unwrap().text.len() == 1 << 24));
    assert_eq!(events[8].as_value().unwrap().text, "1");
}
