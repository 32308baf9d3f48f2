//! Disk partition usage probe.

use super::{Collector, CollectorError, CollectorRecord, DiskStats, PartitionUsage};
use async_trait::async_trait;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;

const GB: u64 = 1024 * 1024 * 1024;

pub struct DiskCollector;

#[async_trait]
impl Collector for DiskCollector {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn collect(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<CollectorRecord, CollectorError> {
        let disks = Disks::new_with_refreshed_list();

        let partitions = disks
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                let free = disk.available_space();
                let used = total.saturating_sub(free);
                PartitionUsage {
                    device: disk.name().to_string_lossy().into_owned(),
                    mountpoint: disk.mount_point().to_string_lossy().into_owned(),
                    fstype: disk.file_system().to_string_lossy().into_owned(),
                    total_gb: total / GB,
                    used_gb: used / GB,
                    free_gb: free / GB,
                    used_percent: if total > 0 {
                        used as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        Ok(CollectorRecord::Disk(DiskStats { partitions }))
    }
}
