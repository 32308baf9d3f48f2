//! Host identity and platform probe.

use super::{Collector, CollectorError, CollectorRecord, SystemInfo};
use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

pub struct SystemCollector;

#[async_trait]
impl Collector for SystemCollector {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn collect(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<CollectorRecord, CollectorError> {
        Ok(CollectorRecord::System(SystemInfo {
            hostname: super::hostname(),
            os: std::env::consts::OS.to_string(),
            platform: System::name(),
            platform_version: System::os_version(),
            kernel_version: System::kernel_version(),
            arch: std::env::consts::ARCH.to_string(),
            uptime_secs: System::uptime(),
            boot_time_secs: System::boot_time(),
            num_cpus: num_cpus(),
        }))
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
