//! Policy engine - server-driven agent configuration.
//!
//! The engine periodically pulls `/api/v1/policy` over the authenticated
//! transport and swaps its current snapshot atomically. Readers receive a
//! reference-counted snapshot that stays valid across concurrent swaps, so
//! the scheduler and pipeline can query policy on every tick without
//! locking around the network refresh.

use crate::audit::{AuditEvent, AuditJournal};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("policy fetch failed with status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("policy refresh cancelled")]
    Cancelled,
}

/// Per-collector settings issued by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CollectorPolicy {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

/// Auto-update settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePolicy {
    pub enabled: bool,
    /// `stable`, `beta`, or `dev`.
    pub channel: String,
    pub check_interval_secs: u64,
}

/// Data transmission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPolicy {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub compression: bool,
}

/// The agent's runtime policy. Immutable once published; replaced as a
/// whole on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    pub collectors: BTreeMap<String, CollectorPolicy>,
    pub update: UpdatePolicy,
    pub telemetry: TelemetryPolicy,
}

impl Default for Policy {
    /// Safe defaults used before the first successful refresh: the standard
    /// collector set enabled, MAC collection off, stable update channel.
    fn default() -> Self {
        let mut collectors = BTreeMap::new();
        collectors.insert("system".to_string(), CollectorPolicy {
            enabled: true,
            ..Default::default()
        });
        collectors.insert("cpu".to_string(), CollectorPolicy {
            enabled: true,
            interval_secs: Some(60),
            ..Default::default()
        });
        collectors.insert("memory".to_string(), CollectorPolicy {
            enabled: true,
            interval_secs: Some(60),
            ..Default::default()
        });
        collectors.insert("disk".to_string(), CollectorPolicy {
            enabled: true,
            interval_secs: Some(300),
            ..Default::default()
        });
        let mut network_options = BTreeMap::new();
        network_options.insert("collect_mac".to_string(), Value::Bool(false));
        collectors.insert("network".to_string(), CollectorPolicy {
            enabled: true,
            interval_secs: Some(60),
            options: network_options,
        });

        Self {
            version: "1.0.0".to_string(),
            updated_at: Utc::now(),
            collectors,
            update: UpdatePolicy {
                enabled: true,
                channel: "stable".to_string(),
                check_interval_secs: 60 * 60,
            },
            telemetry: TelemetryPolicy {
                batch_size: 100,
                flush_interval_secs: 5 * 60,
                compression: true,
            },
        }
    }
}

/// Holds the current policy snapshot and refreshes it from the server.
pub struct PolicyEngine {
    client: reqwest::Client,
    policy_url: String,
    default_collection_interval: Duration,
    current: RwLock<Arc<Policy>>,
    journal: Arc<AuditJournal>,
}

impl PolicyEngine {
    /// `default_collection_interval` and `default_update_check_interval`
    /// come from the config; they govern until the server's policy arrives
    /// (and keep governing collectors the policy does not mention).
    pub fn new(
        client: reqwest::Client,
        api_base_url: &str,
        default_collection_interval: Duration,
        default_update_check_interval: Duration,
        journal: Arc<AuditJournal>,
    ) -> Self {
        let mut initial = Policy::default();
        initial.update.check_interval_secs = default_update_check_interval.as_secs();

        Self {
            client,
            policy_url: format!("{api_base_url}/api/v1/policy"),
            default_collection_interval,
            current: RwLock::new(Arc::new(initial)),
            journal,
        }
    }

    /// Installs a policy received out of band (the bootstrap response may
    /// carry the initial one).
    pub fn install(&self, policy: Policy) {
        self.swap(policy);
    }

    /// Fetches the latest policy and swaps the snapshot on success.
    ///
    /// A single attempt per call - the supervisor's periodic tick is the
    /// retry loop.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<(), PolicyError> {
        debug!("refreshing policy from {}", self.policy_url);

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(PolicyError::Cancelled),
            resp = self.client.get(&self.policy_url).send() => resp?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A rejection of the client certificate is security-relevant.
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                let _ = self
                    .journal
                    .emit(AuditEvent::auth_failure(&self.policy_url, &body));
            }
            return Err(PolicyError::Status { status, body });
        }

        let new_policy: Policy = response.json().await?;
        self.swap(new_policy);
        Ok(())
    }

    fn swap(&self, new_policy: Policy) {
        let new_version = new_policy.version.clone();
        let old_version = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            let old_version = current.version.clone();
            *current = Arc::new(new_policy);
            old_version
        };
        if old_version != new_version {
            info!("policy updated: {} -> {}", old_version, new_version);
            let _ = self
                .journal
                .emit(AuditEvent::policy_change(&old_version, &new_version));
        }
    }

    /// Returns the current snapshot. The returned `Arc` stays valid even if
    /// a swap happens concurrently.
    pub fn snapshot(&self) -> Arc<Policy> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn version(&self) -> String {
        self.snapshot().version.clone()
    }

    /// Whether a collector is enabled. Collectors absent from the policy
    /// are disabled.
    pub fn is_collector_enabled(&self, name: &str) -> bool {
        self.snapshot()
            .collectors
            .get(name)
            .is_some_and(|c| c.enabled)
    }

    /// Collection interval for a collector: policy per-collector value
    /// first, then the config's global default.
    pub fn collector_interval(&self, name: &str) -> Duration {
        self.snapshot()
            .collectors
            .get(name)
            .and_then(|c| c.interval_secs)
            .map_or(self.default_collection_interval, Duration::from_secs)
    }
}
