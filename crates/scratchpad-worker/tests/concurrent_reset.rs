//! Concurrent resets against the real worker.
//!
//! Kept in its own test binary: it asserts on the process-wide set of
//! tracked workers, which other tests would disturb.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scratchpad_core::{DumpEvent, DumpSink, ExecutionHost, HostConfig, tracked_worker_count};
use tempfile::TempDir;

struct Discard;

impl DumpSink for Discard {
    fn on_batch(&self, _batch: Vec<DumpEvent>) {}
}

/// Wait for cancelled startups to finish killing their processes.
async fn settle_to_one_worker() {
    let deadline = Instant::now() + Duration::from_secs(5);
    while tracked_worker_count() != 1 {
        assert!(
            Instant::now() < deadline,
            "{} workers still tracked",
            tracked_worker_count()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resets_leave_one_fresh_worker() {
    let temp = TempDir::new().unwrap();
    let config = HostConfig {
        worker_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_scratchpad-worker"))),
        working_directory: temp.path().to_path_buf(),
        runtime_dir: Some(temp.path().join("run")),
        ..HostConfig::default()
    };
    let host = Arc::new(ExecutionHost::new(config, Arc::new(Discard)).unwrap());

    host.execute("1").await.unwrap();
    let mut seen = HashSet::new();
    seen.insert(host.worker_pid().unwrap());

    for _ in 0..3 {
        let resets = [host.clone(), host.clone()]
            .map(|host| tokio::spawn(async move { host.reset().await }));
        let getter = {
            let host = host.clone();
            tokio::spawn(async move { host.get_or_create_service().await.map(|_| ()) })
        };
        let executor = {
            let host = host.clone();
            tokio::spawn(async move { host.execute("sleep(20); 1").await })
        };

        for reset in resets {
            reset.await.unwrap();
        }
        // Either may have raced a reset that killed its worker.
        let _ = getter.await.unwrap();
        let _ = executor.await.unwrap();

        settle_to_one_worker().await;
        let pid = host.worker_pid().expect("a worker after reset");
        assert!(seen.insert(pid), "worker {} was reused across resets", pid);

        host.execute("2").await.unwrap();
        assert_eq!(host.worker_pid(), Some(pid));
        assert_eq!(tracked_worker_count(), 1);
    }

    host.shutdown();
    assert_eq!(tracked_worker_count(), 0);
}
