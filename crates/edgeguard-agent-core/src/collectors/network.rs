//! Network interface probe.
//!
//! MAC addresses are only included when the collector was constructed with
//! MAC collection enabled; the default policy keeps it off.

use super::{Collector, CollectorError, CollectorRecord, InterfaceInfo, NetworkStats};
use async_trait::async_trait;
use sysinfo::Networks;
use tokio_util::sync::CancellationToken;

pub struct NetworkCollector {
    collect_mac: bool,
}

impl NetworkCollector {
    #[must_use]
    pub fn new(collect_mac: bool) -> Self {
        Self { collect_mac }
    }
}

#[async_trait]
impl Collector for NetworkCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn collect(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<CollectorRecord, CollectorError> {
        let networks = Networks::new_with_refreshed_list();

        let interfaces = networks
            .iter()
            .map(|(name, data)| InterfaceInfo {
                name: name.clone(),
                mtu: data.mtu(),
                addresses: data
                    .ip_networks()
                    .iter()
                    .map(|ip| format!("{}/{}", ip.addr, ip.prefix))
                    .collect(),
                mac: self
                    .collect_mac
                    .then(|| data.mac_address().to_string()),
            })
            .collect();

        Ok(CollectorRecord::Network(NetworkStats { interfaces }))
    }
}
