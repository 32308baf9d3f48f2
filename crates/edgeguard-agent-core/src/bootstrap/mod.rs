//! Bootstrap client - one-shot exchange of an install token for an agent
//! identity.
//!
//! This is the only unauthenticated call in the system: it runs over plain
//! TLS because the agent has no certificate yet. The client is a pure
//! function from credentials and transport to a [`BootstrapResponse`]; it
//! persists nothing itself - the identity manager writes the triple and
//! the config store records the outcome.

use crate::collectors;
use crate::config::Config;
use crate::identity::IdentityTriple;
use crate::policy::Policy;
use crate::retry::{self, RetryError, RetryPolicy};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Compile-time default bootstrap endpoint; `BOOTSTRAP_URL` overrides it.
pub const DEFAULT_BOOTSTRAP_URL: &str = "https://api.edgeguard.io/api/v1/agents/bootstrap";

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The server refused the credentials. Not retried; 401/403 here is a
    /// fatal configuration error.
    #[error("bootstrap rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("bootstrap cancelled")]
    Cancelled,

    #[error("bootstrap failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("failed to build bootstrap client: {0}")]
    Client(reqwest::Error),
}

/// Registration request sent to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapRequest {
    pub org_id: String,
    pub install_token: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
}

impl BootstrapRequest {
    #[must_use]
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            org_id: cfg.org_id.clone(),
            install_token: cfg.install_token.clone(),
            hostname: collectors::hostname(),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            agent_version: crate::AGENT_VERSION.to_string(),
        }
    }
}

/// Identity and endpoints returned by a successful registration.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapResponse {
    pub agent_id: String,
    #[serde(default)]
    pub api_base_url: String,
    pub certificate: String,
    pub private_key: String,
    pub ca_cert: String,
    #[serde(default)]
    pub policy: Option<Policy>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BootstrapResponse {
    #[must_use]
    pub fn triple(&self) -> IdentityTriple {
        IdentityTriple {
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone(),
            ca_cert: self.ca_cert.clone(),
        }
    }
}

/// Resolves the bootstrap endpoint: `BOOTSTRAP_URL` env var, then the
/// compile-time default.
#[must_use]
pub fn bootstrap_url() -> String {
    env::var("BOOTSTRAP_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_BOOTSTRAP_URL.to_string())
}

// One failed attempt, classified for the retry loop.
enum AttemptError {
    Status { status: StatusCode, body: String },
    Network(reqwest::Error),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Status { status, body } => {
                write!(f, "server returned status {status}: {body}")
            }
            AttemptError::Network(e) => write!(f, "request failed: {e}"),
        }
    }
}

fn is_transient(err: &AttemptError) -> bool {
    match err {
        AttemptError::Network(_) => true,
        AttemptError::Status { status, .. } => {
            status.is_server_error()
                || *status == StatusCode::REQUEST_TIMEOUT
                || *status == StatusCode::TOO_MANY_REQUESTS
        }
    }
}

/// Runs the bootstrap flow with the standard control-plane retry policy
/// over a fresh plain-TLS client.
pub async fn bootstrap(
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<BootstrapResponse, BootstrapError> {
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .map_err(BootstrapError::Client)?;

    let request = BootstrapRequest::from_config(cfg);
    bootstrap_with_client(&client, &bootstrap_url(), &request, cancel).await
}

/// Runs the bootstrap flow over a caller-supplied client.
///
/// Re-bootstrap passes the current mTLS transport here, so a still-valid
/// client certificate authenticates the renewal request.
pub async fn bootstrap_with_client(
    client: &reqwest::Client,
    url: &str,
    request: &BootstrapRequest,
    cancel: &CancellationToken,
) -> Result<BootstrapResponse, BootstrapError> {
    info!("bootstrapping agent for org {} via {url}", request.org_id);

    let policy = RetryPolicy::control_plane();
    let response = retry::retry_with_backoff(&policy, cancel, is_transient, || async {
        attempt(client, url, request).await
    })
    .await
    .map_err(|e| match e {
        RetryError::Cancelled => BootstrapError::Cancelled,
        RetryError::Permanent(AttemptError::Status { status, body }) => {
            BootstrapError::Rejected { status, body }
        }
        RetryError::Permanent(err) => BootstrapError::Exhausted {
            attempts: 1,
            last: err.to_string(),
        },
        RetryError::Exhausted { attempts, last } => BootstrapError::Exhausted {
            attempts,
            last: last.to_string(),
        },
    })?;

    info!(
        "bootstrap successful: agent_id={}, api={}",
        response.agent_id, response.api_base_url
    );
    Ok(response)
}

async fn attempt(
    client: &reqwest::Client,
    url: &str,
    request: &BootstrapRequest,
) -> Result<BootstrapResponse, AttemptError> {
    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(AttemptError::Network)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AttemptError::Status { status, body });
    }

    let mut parsed: BootstrapResponse = response
        .json()
        .await
        .map_err(AttemptError::Network)?;

    // Servers that omit the API base get the bootstrap endpoint's origin.
    if parsed.api_base_url.is_empty() {
        parsed.api_base_url = base_of(url);
    }
    Ok(parsed)
}

fn base_of(bootstrap_url: &str) -> String {
    bootstrap_url
        .strip_suffix("/api/v1/agents/bootstrap")
        .unwrap_or(bootstrap_url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let status = |code: u16| AttemptError::Status {
            status: StatusCode::from_u16(code).expect("status"),
            body: String::new(),
        };

        for retryable in [408, 429, 500, 502, 503] {
            assert!(is_transient(&status(retryable)), "{retryable}");
        }
        for permanent in [400, 401, 403, 404, 409] {
            assert!(!is_transient(&status(permanent)), "{permanent}");
        }
    }

    #[test]
    fn test_api_base_derived_from_bootstrap_url() {
        assert_eq!(
            base_of("https://cp.example.com/api/v1/agents/bootstrap"),
            "https://cp.example.com"
        );
        // Unrecognized shapes pass through untouched.
        assert_eq!(
            base_of("https://cp.example.com/custom"),
            "https://cp.example.com/custom"
        );
    }

    #[test]
    fn test_response_decodes_without_optional_fields() {
        let json = serde_json::json!({
            "agent_id": "a-1",
            "certificate": "CERT",
            "private_key": "KEY",
            "ca_cert": "CA",
        });
        let resp: BootstrapResponse = serde_json::from_value(json).expect("decode");
        assert_eq!(resp.agent_id, "a-1");
        assert!(resp.api_base_url.is_empty());
        assert!(resp.policy.is_none());
        assert!(resp.expires_at.is_none());

        let triple = resp.triple();
        assert_eq!(triple.certificate, "CERT");
        assert_eq!(triple.private_key, "KEY");
        assert_eq!(triple.ca_cert, "CA");
    }
}
