//! Telemetry collectors.
//!
//! A collector samples one system metric and emits a strongly typed
//! [`CollectorRecord`]. Records carry a `kind` discriminator on the wire,
//! so the delivery pipeline and the control plane never need to interpret
//! the typed bodies.

mod cpu;
mod disk;
mod memory;
mod network;
mod system;

pub use cpu::CpuCollector;
pub use disk::DiskCollector;
pub use memory::MemoryCollector;
pub use network::NetworkCollector;
pub use system::SystemCollector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("probe failed: {0}")]
    Probe(String),

    #[error("collection cancelled")]
    Cancelled,
}

/// One record emitted by a collector, tagged by collector kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectorRecord {
    System(SystemInfo),
    Cpu(CpuStats),
    Memory(MemoryStats),
    Disk(DiskStats),
    Network(NetworkStats),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub platform: Option<String>,
    pub platform_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub uptime_secs: u64,
    pub boot_time_secs: u64,
    pub num_cpus: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage_percent: f32,
    pub cores: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_mhz: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub used_percent: f64,
    pub free_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStats {
    pub partitions: Vec<PartitionUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total_gb: u64,
    pub used_gb: u64,
    pub free_gb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub mtu: u64,
    pub addresses: Vec<String>,
    /// Present only when MAC collection is enabled by policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// A telemetry probe. Implementations must be cheap to call repeatedly;
/// the scheduler bounds each run with a timeout and serializes runs of the
/// same collector.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectorRecord, CollectorError>;
}

/// Hostname reported in bootstrap and heartbeat bodies.
#[must_use]
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// The default collector set. MAC collection starts disabled (privacy
/// default, mirrored by the default policy).
#[must_use]
pub fn default_collectors() -> Vec<Arc<dyn Collector>> {
    vec![
        Arc::new(SystemCollector),
        Arc::new(CpuCollector),
        Arc::new(MemoryCollector),
        Arc::new(DiskCollector),
        Arc::new(NetworkCollector::new(false)),
    ]
}
