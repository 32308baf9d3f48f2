//! Health monitor - periodic heartbeat and a local health predicate.
//!
//! The heartbeat carries a resource snapshot (RSS, task count, uptime) to
//! `POST /api/v1/heartbeat`. The local predicate flags the agent as
//! degraded when it exceeds fixed resource ceilings; the thresholds are
//! design defaults, not tuning knobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resident memory above this many megabytes marks the agent unhealthy.
pub const MAX_MEMORY_MB: f64 = 500.0;
/// More concurrent tasks than this marks the agent unhealthy.
pub const MAX_TASKS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("unhealthy: {0}")]
    Unhealthy(String),
}

/// Heartbeat body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub agent_id: String,
    pub version: String,
    /// `healthy` or `degraded`.
    pub status: String,
    pub uptime_seconds: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub memory_usage_mb: f64,
    pub thread_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// Emits heartbeats at a fixed interval until cancelled.
pub struct HealthMonitor {
    client: reqwest::Client,
    heartbeat_url: String,
    agent_id: String,
    interval: Duration,
    cancel: CancellationToken,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(
        client: reqwest::Client,
        api_base_url: &str,
        agent_id: &str,
        interval: Duration,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            client,
            heartbeat_url: format!("{api_base_url}/api/v1/heartbeat"),
            agent_id: agent_id.to_string(),
            interval,
            cancel: parent_cancel.child_token(),
            started: Instant::now(),
        }
    }

    /// Heartbeat loop. The first beat goes out immediately.
    pub async fn run(self) {
        info!("starting health monitor (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.send_heartbeat().await,
                () = self.cancel.cancelled() => {
                    debug!("health monitor stopped");
                    return;
                }
            }
        }
    }

    async fn send_heartbeat(&self) {
        let status = self.snapshot();
        match self
            .client
            .post(&self.heartbeat_url)
            .json(&status)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!("heartbeat sent (status: {})", status.status);
            }
            Ok(response) => {
                warn!("heartbeat failed with status {}", response.status());
            }
            Err(e) => warn!("failed to send heartbeat: {e}"),
        }
    }

    /// Current resource snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthStatus {
        let memory_usage_mb = process_memory_mb();
        let thread_count = alive_tasks();
        let violations = evaluate(memory_usage_mb, thread_count);

        HealthStatus {
            agent_id: self.agent_id.clone(),
            version: crate::AGENT_VERSION.to_string(),
            status: if violations.is_empty() {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            uptime_seconds: self.started.elapsed().as_secs(),
            last_heartbeat: Utc::now(),
            memory_usage_mb,
            thread_count,
            errors: (!violations.is_empty()).then_some(violations),
        }
    }

    /// Local health predicate.
    pub fn check_health(&self) -> Result<(), HealthError> {
        let violations = evaluate(process_memory_mb(), alive_tasks());
        if violations.is_empty() {
            Ok(())
        } else {
            Err(HealthError::Unhealthy(violations.join("; ")))
        }
    }
}

fn evaluate(memory_usage_mb: f64, thread_count: usize) -> Vec<String> {
    let mut violations = Vec::new();
    if memory_usage_mb > MAX_MEMORY_MB {
        violations.push(format!("high memory usage: {memory_usage_mb:.2} MB"));
    }
    if thread_count > MAX_TASKS {
        violations.push(format!("high task count: {thread_count}"));
    }
    violations
}

fn process_memory_mb() -> f64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), false);
    sys.process(pid)
        .map_or(0.0, |p| p.memory() as f64 / 1024.0 / 1024.0)
}

fn alive_tasks() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0)
}
