//! CPU usage and topology probe.
//!
//! Usage is computed from two refreshes separated by the minimum sampling
//! interval; the wait between them honors cancellation.

use super::{Collector, CollectorError, CollectorRecord, CpuStats};
use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

pub struct CpuCollector;

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectorRecord, CollectorError> {
        let mut sys = System::new();
        sys.refresh_cpu_usage();

        tokio::select! {
            () = cancel.cancelled() => return Err(CollectorError::Cancelled),
            () = tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL) => {}
        }
        sys.refresh_cpu_usage();

        let first = sys.cpus().first();
        Ok(CollectorRecord::Cpu(CpuStats {
            usage_percent: sys.global_cpu_usage(),
            cores: sys.cpus().len(),
            model: first.map(|c| c.brand().to_string()),
            frequency_mhz: first.map(sysinfo::Cpu::frequency),
            vendor: first.map(|c| c.vendor_id().to_string()),
        }))
    }
}
