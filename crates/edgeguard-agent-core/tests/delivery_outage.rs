//! E2E tests for the delivery pipeline across a simulated network outage:
//! spill to the persistent buffer while the telemetry endpoint is down,
//! bounded disk usage under sustained failure, and drain on recovery.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;

use edgeguard_agent_core::buffer::PersistentBuffer;
use edgeguard_agent_core::collectors::{CollectorRecord, MemoryStats};
use edgeguard_agent_core::pipeline::DeliveryPipeline;
use edgeguard_agent_core::retry::RetryPolicy;

#[derive(Clone)]
struct Backend {
    up: Arc<AtomicBool>,
    accepted: Arc<AtomicU32>,
}

async fn telemetry_handler(State(state): State<Backend>) -> StatusCode {
    if state.up.load(Ordering::SeqCst) {
        state.accepted.fetch_add(1, Ordering::SeqCst);
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn flaky_backend(initially_up: bool) -> (Backend, String) {
    let backend = Backend {
        up: Arc::new(AtomicBool::new(initially_up)),
        accepted: Arc::new(AtomicU32::new(0)),
    };
    let router = Router::new()
        .route("/api/v1/telemetry", post(telemetry_handler))
        .with_state(backend.clone());
    let (base_url, _task) = common::serve(router).await;
    (backend, base_url)
}

fn record(seq: u64) -> CollectorRecord {
    CollectorRecord::Memory(MemoryStats {
        total_mb: seq,
        available_mb: 0,
        used_mb: 0,
        used_percent: 0.0,
        free_mb: 0,
    })
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(40),
        max_attempts: 2,
        jitter: 0.0,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_outage_spills_then_recovery_drains() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (backend, base_url) = flaky_backend(false).await;

    let max_buffer_bytes = 64 * 1024;
    let buffer = PersistentBuffer::open(&dir.path().join("buffer"), max_buffer_bytes)
        .expect("buffer");
    let cancel = CancellationToken::new();
    let (pipeline, handle) = DeliveryPipeline::new(
        reqwest::Client::new(),
        &base_url,
        "agent-outage",
        4,
        Duration::from_millis(50),
        buffer,
        cancel.clone(),
    );
    let pipeline = pipeline.with_retry_policy(fast_retry());
    let service = tokio::spawn(pipeline.run());

    // Batches generated during the outage must land on disk.
    for seq in 0..8 {
        handle.submit(record(seq));
    }
    let buffer_dir = dir.path().join("buffer");
    wait_for("spilled batches", Duration::from_secs(10), || {
        std::fs::read_dir(&buffer_dir)
            .map(|entries| entries.count() >= 2)
            .unwrap_or(false)
    })
    .await;

    let on_disk: u64 = std::fs::read_dir(&buffer_dir)
        .expect("read_dir")
        .map(|e| e.expect("entry").metadata().expect("meta").len())
        .sum();
    assert!(on_disk <= max_buffer_bytes, "buffer exceeded its budget");

    // Recovery: the next live flush succeeds and drains the backlog.
    backend.up.store(true, Ordering::SeqCst);
    handle.submit(record(100));
    wait_for("drained buffer", Duration::from_secs(10), || {
        std::fs::read_dir(&buffer_dir)
            .map(|entries| entries.count() == 0)
            .unwrap_or(false)
    })
    .await;

    // Live batch plus the two replayed ones, at minimum.
    assert!(backend.accepted.load(Ordering::SeqCst) >= 3);

    cancel.cancel();
    service.await.expect("pipeline task");
}

#[tokio::test]
async fn test_sustained_outage_keeps_buffer_bounded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_backend, base_url) = flaky_backend(false).await;

    // A budget small enough that eviction must kick in.
    let max_buffer_bytes = 1024;
    let buffer_dir = dir.path().join("buffer");
    let buffer = PersistentBuffer::open(&buffer_dir, max_buffer_bytes).expect("buffer");
    let cancel = CancellationToken::new();
    let (pipeline, handle) = DeliveryPipeline::new(
        reqwest::Client::new(),
        &base_url,
        "agent-overflow",
        1,
        Duration::from_millis(30),
        buffer,
        cancel.clone(),
    );
    let pipeline = pipeline.with_retry_policy(fast_retry());
    let service = tokio::spawn(pipeline.run());

    let disk_usage = || -> u64 {
        std::fs::read_dir(&buffer_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    };

    // Produce more than the budget can hold; the cap must hold throughout.
    for seq in 0..40 {
        handle.submit(record(seq));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(
            disk_usage() <= max_buffer_bytes,
            "buffer exceeded its budget mid-outage"
        );
    }

    // The newest record survives eviction; the oldest are gone.
    let mut names: Vec<String> = std::fs::read_dir(&buffer_dir)
        .expect("read_dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert!(!names.is_empty(), "expected surviving batches");
    let newest = std::fs::read_to_string(buffer_dir.join(names.last().expect("newest")))
        .expect("read newest");
    assert!(
        !newest.contains("\"total_mb\":0,"),
        "oldest batch should have been evicted first"
    );

    cancel.cancel();
    service.await.expect("pipeline task");
}

#[tokio::test]
async fn test_cancellation_flushes_pending_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (backend, base_url) = flaky_backend(true).await;

    let buffer = PersistentBuffer::open(&dir.path().join("buffer"), 64 * 1024).expect("buffer");
    let cancel = CancellationToken::new();
    let (pipeline, handle) = DeliveryPipeline::new(
        reqwest::Client::new(),
        &base_url,
        "agent-shutdown",
        100,
        Duration::from_secs(60),
        buffer,
        cancel.clone(),
    );
    let pipeline = pipeline.with_retry_policy(fast_retry());
    let service = tokio::spawn(pipeline.run());

    handle.submit(record(1));
    handle.submit(record(2));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Neither the batch size nor the interval has fired; shutdown must
    // flush best-effort.
    cancel.cancel();
    service.await.expect("pipeline task");
    assert_eq!(backend.accepted.load(Ordering::SeqCst), 1);
}
