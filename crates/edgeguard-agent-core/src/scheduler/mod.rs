//! Collector scheduler - per-collector tickers with jitter and bounded
//! runs.
//!
//! Each collector gets its own task and ticker, so a slow probe never
//! delays the others. The effective interval is the policy's per-collector
//! value (falling back to the config default) plus a jitter factor sampled
//! once at startup, uniform in ±10%, which spreads fleet load instead of
//! synchronizing it. Runs of the same collector are strictly serialized by
//! construction; every run is bounded at 30 seconds.
//!
//! Policy enablement is checked on every tick, so a policy refresh
//! enables or disables collectors without restarting anything.

use crate::collectors::Collector;
use crate::pipeline::PipelineHandle;
use crate::policy::PolicyEngine;

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on a single collection run.
pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on waiting for in-flight collections during stop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    running: bool,
    jobs: HashMap<&'static str, JoinHandle<()>>,
}

/// Drives the collector set. Cheap to share behind an `Arc`.
pub struct CollectorScheduler {
    pipeline: PipelineHandle,
    policy: Arc<PolicyEngine>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl CollectorScheduler {
    pub fn new(
        pipeline: PipelineHandle,
        policy: Arc<PolicyEngine>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            policy,
            cancel: parent_cancel.child_token(),
            inner: Mutex::new(Inner {
                running: false,
                jobs: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts a ticker for every collector. Idempotent.
    pub fn start(&self, collectors: Vec<Arc<dyn Collector>>) {
        let mut inner = self.lock();
        if inner.running {
            return;
        }
        info!("starting scheduler with {} collectors", collectors.len());
        inner.running = true;
        for collector in collectors {
            Self::spawn_job(&mut inner, &self.pipeline, &self.policy, &self.cancel, collector);
        }
    }

    /// Adds a collector. If the scheduler is running its ticker starts
    /// immediately.
    pub fn add_collector(&self, collector: Arc<dyn Collector>) {
        let mut inner = self.lock();
        if inner.running {
            Self::spawn_job(&mut inner, &self.pipeline, &self.policy, &self.cancel, collector);
        }
    }

    /// Removes a collector by name, aborting its ticker.
    pub fn remove_collector(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.remove(name) {
            job.abort();
            info!("removed collector: {name}");
        }
    }

    fn spawn_job(
        inner: &mut Inner,
        pipeline: &PipelineHandle,
        policy: &Arc<PolicyEngine>,
        cancel: &CancellationToken,
        collector: Arc<dyn Collector>,
    ) {
        let name = collector.name();
        if inner.jobs.contains_key(name) {
            warn!("collector '{name}' is already scheduled");
            return;
        }

        let base_interval = policy.collector_interval(name);
        // Jitter sampled once per collector: ±10% of the base interval.
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
        let actual_interval = base_interval.mul_f64(1.0 + jitter);
        info!(
            "starting collector '{name}' with interval {:?} (base {:?})",
            actual_interval, base_interval
        );

        let pipeline = pipeline.clone();
        let policy = Arc::clone(policy);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(actual_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_collector(&*collector, &pipeline, &policy, &cancel).await;
                    }
                    () = cancel.cancelled() => {
                        debug!("stopping collector '{}'", collector.name());
                        return;
                    }
                }
            }
        });
        inner.jobs.insert(name, handle);
    }

    async fn run_collector(
        collector: &dyn Collector,
        pipeline: &PipelineHandle,
        policy: &PolicyEngine,
        cancel: &CancellationToken,
    ) {
        let name = collector.name();
        if !policy.is_collector_enabled(name) {
            debug!("collector '{name}' disabled by policy, skipping");
            return;
        }

        let started = std::time::Instant::now();
        match tokio::time::timeout(COLLECT_TIMEOUT, collector.collect(cancel)).await {
            Ok(Ok(record)) => {
                debug!("collector '{name}' completed in {:?}", started.elapsed());
                pipeline.submit(record);
            }
            // Errors are not retried here; the next tick is the retry.
            Ok(Err(e)) => warn!("collector '{name}' failed: {e}"),
            Err(_) => warn!("collector '{name}' timed out after {COLLECT_TIMEOUT:?}"),
        }
    }

    /// Cancels all tickers and waits up to [`STOP_TIMEOUT`] for in-flight
    /// collections, then returns regardless.
    pub async fn stop(&self) {
        let jobs: Vec<(&'static str, JoinHandle<()>)> = {
            let mut inner = self.lock();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.jobs.drain().collect()
        };

        info!("stopping scheduler");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        for (name, job) in jobs {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("timeout waiting for collector jobs to stop");
                job.abort();
                continue;
            }
            match tokio::time::timeout(remaining, job).await {
                Ok(_) => {}
                Err(_) => warn!("collector '{name}' did not stop in time"),
            }
        }
        info!("all collector jobs stopped");
    }
}
