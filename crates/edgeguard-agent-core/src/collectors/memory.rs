//! Memory usage probe.

use super::{Collector, CollectorError, CollectorRecord, MemoryStats};
use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

const MB: u64 = 1024 * 1024;

pub struct MemoryCollector;

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn collect(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<CollectorRecord, CollectorError> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();
        let used_percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(CollectorRecord::Memory(MemoryStats {
            total_mb: total / MB,
            available_mb: sys.available_memory() / MB,
            used_mb: used / MB,
            used_percent,
            free_mb: sys.free_memory() / MB,
        }))
    }
}
