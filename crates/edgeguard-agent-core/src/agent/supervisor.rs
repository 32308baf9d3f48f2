//! Supervisor implementation.
//!
//! The supervisor drives the top-level state machine:
//!
//! ```text
//! INIT --load-> (NotFound) --bootstrap-> SAVE ---> VERIFY
//!               (Found) ---------------------> VERIFY
//!                                                 |
//!                                        (expired)+--rebootstrap-> SAVE
//!                                                 |
//!                                                 v
//!                                              RUN_LOOP --cancel-> SHUTDOWN
//! ```
//!
//! Every long-lived component receives a child of the supervisor's
//! cancellation token; cancelling it aborts in-flight retries before their
//! next delay elapses and drives a bounded, audited teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditError, AuditEvent, AuditJournal};
use crate::bootstrap::{self, BootstrapError, BootstrapRequest};
use crate::buffer::{BufferError, PersistentBuffer};
use crate::collectors;
use crate::config::{Config, ConfigError};
use crate::health::HealthMonitor;
use crate::identity::{IdentityError, IdentityManager};
use crate::pipeline::DeliveryPipeline;
use crate::policy::{Policy, PolicyEngine, UpdatePolicy};
use crate::scheduler::CollectorScheduler;
use crate::updater::{PlatformVerifier, UpdateOutcome, Updater};

/// Period of the supervisor's maintenance tick (policy refresh, update
/// check gating).
const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Bound on waiting for component tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that end the agent. The binary prints them to stderr and exits
/// nonzero.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("audit journal error: {0}")]
    Audit(#[from] AuditError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// Handle to a running supervisor, used for external shutdown control.
#[derive(Clone)]
pub struct SupervisorHandle {
    shutdown_token: CancellationToken,
}

impl SupervisorHandle {
    /// Requests a graceful shutdown of the agent.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

/// Top-level coordinator owning the shared cancellation token and the
/// overall state machine. Service-manager adapters only ever see
/// [`Supervisor::run`] and [`SupervisorHandle::shutdown`].
pub struct Supervisor {
    config: Config,
    config_path: PathBuf,
    shutdown_token: CancellationToken,
    journal: Arc<AuditJournal>,
    initial_policy: Option<Policy>,
    tick_interval: Duration,
}

impl Supervisor {
    /// Creates the supervisor and opens the audit journal.
    ///
    /// `config` is either a loaded runtime config or a bootstrap config
    /// built from the environment; `run` finishes whichever state machine
    /// path applies.
    pub fn new(config: Config, config_path: PathBuf) -> Result<Self, AgentError> {
        let audit_path = config
            .log_file
            .parent()
            .map_or_else(|| PathBuf::from("audit.log"), |dir| dir.join("audit.log"));
        let journal = Arc::new(AuditJournal::open(&audit_path, &config.agent_id)?);

        Ok(Self {
            config,
            config_path,
            shutdown_token: CancellationToken::new(),
            journal,
            initial_policy: None,
            tick_interval: TICK_INTERVAL,
        })
    }

    /// Overrides the maintenance tick period (the default is 5 minutes).
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    /// Runs the agent to completion. Returns `Ok(())` on clean shutdown
    /// (including cancellation during startup).
    pub async fn run(&mut self) -> Result<(), AgentError> {
        crate::log_build_info();
        let _ = self.journal.emit(AuditEvent::service_start(crate::AGENT_VERSION));

        match self.run_inner().await {
            Ok(()) => {
                let _ = self.journal.emit(AuditEvent::service_stop("shutdown"));
                self.journal.close();
                Ok(())
            }
            // Cancellation is a clean shutdown signal, not a failure.
            Err(AgentError::Bootstrap(BootstrapError::Cancelled)) => {
                let _ = self.journal.emit(AuditEvent::service_stop("cancelled"));
                self.journal.close();
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .journal
                    .emit(AuditEvent::service_stop(&format!("error: {e}")));
                self.journal.close();
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<(), AgentError> {
        // INIT: a config that never bootstrapped runs the first exchange.
        if !self.config.bootstrapped {
            info!("no bootstrapped configuration, starting bootstrap process");
            self.config.validate_bootstrap()?;
            self.bootstrap_and_persist(false).await?;
        }

        // VERIFY: parse the triple; rotate when invalid or near expiry.
        let mut identity = IdentityManager::new(&self.config.tls)?;
        if identity.needs_rebootstrap() {
            info!("certificate expired or invalid, re-bootstrapping");
            self.config.bootstrapped = false;
            self.bootstrap_and_persist(true).await?;
            identity = IdentityManager::new(&self.config.tls)?;
        }

        let verified = identity.verify()?;
        info!("identity verified: agent ID = {}", verified.agent_id);

        self.config.validate_runtime()?;
        self.journal.set_agent_id(&self.config.agent_id);

        self.run_loop(&identity).await
    }

    /// RUN_LOOP: start every component, then tick until cancelled.
    async fn run_loop(&mut self, identity: &IdentityManager) -> Result<(), AgentError> {
        let client = identity.transport()?;
        let base_url = self.config.api_base_url.clone();

        let policy = Arc::new(PolicyEngine::new(
            client.clone(),
            &base_url,
            self.config.collection_interval(),
            self.config.update_check_interval(),
            Arc::clone(&self.journal),
        ));
        if let Some(initial) = self.initial_policy.take() {
            policy.install(initial);
        }
        if let Err(e) = policy.refresh(&self.shutdown_token).await {
            warn!("failed to fetch initial policy, using defaults: {e}");
        }

        let buffer = PersistentBuffer::open(&self.config.buffer_dir, self.config.max_buffer_bytes)?;
        let flush_interval =
            Duration::from_secs(policy.snapshot().telemetry.flush_interval_secs);
        let (pipeline, pipeline_handle) = DeliveryPipeline::new(
            client.clone(),
            &base_url,
            &self.config.agent_id,
            self.config.batch_size,
            flush_interval,
            buffer,
            self.shutdown_token.child_token(),
        );
        let pipeline_task = tokio::spawn(pipeline.run());

        let scheduler = CollectorScheduler::new(
            pipeline_handle,
            Arc::clone(&policy),
            &self.shutdown_token,
        );
        scheduler.start(collectors::default_collectors());

        let monitor = HealthMonitor::new(
            client.clone(),
            &base_url,
            &self.config.agent_id,
            self.config.heartbeat_interval(),
            &self.shutdown_token,
        );
        let health_task = tokio::spawn(monitor.run());

        let updater = Updater::new(
            client,
            &base_url,
            crate::AGENT_VERSION,
            Box::new(PlatformVerifier),
            Arc::clone(&self.journal),
        );

        info!("agent running");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.tick().await; // discard first tick, which is instantaneous
        let mut last_update_check = tokio::time::Instant::now();

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = policy.refresh(&self.shutdown_token).await {
                        warn!("failed to refresh policy: {e}");
                    }

                    let snapshot = policy.snapshot();
                    if update_check_due(
                        self.config.update_enabled,
                        &snapshot.update,
                        last_update_check.elapsed(),
                    ) {
                        last_update_check = tokio::time::Instant::now();
                        match updater
                            .perform_update(&snapshot.update.channel, &self.shutdown_token)
                            .await
                        {
                            Ok(UpdateOutcome::Installed { version }) => {
                                info!("updated to {version}; restart required to take effect");
                            }
                            Ok(UpdateOutcome::UpToDate) => {}
                            Err(e) => warn!("update pass failed: {e}"),
                        }
                    }
                }
            }
        }

        // SHUTDOWN: bounded, in reverse dependency order. The pipeline's
        // cancel branch performs its own final flush.
        info!("shutting down agent");
        scheduler.stop().await;
        self.await_tasks(vec![("pipeline", pipeline_task), ("health", health_task)])
            .await;
        info!("agent shutdown complete");
        Ok(())
    }

    async fn await_tasks(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("shutdown timeout exceeded, aborting {name} task");
                task.abort();
                continue;
            }
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(())) => debug!("{name} task completed"),
                Ok(Err(e)) => warn!("{name} task failed: {e}"),
                Err(_) => warn!("{name} task timed out, aborting"),
            }
        }
    }

    /// Runs the bootstrap exchange, persists the triple and the updated
    /// config, and audits the outcome. `rotation` marks a re-bootstrap of
    /// an existing identity (audited as a certificate rotation).
    async fn bootstrap_and_persist(&mut self, rotation: bool) -> Result<(), AgentError> {
        let url = bootstrap::bootstrap_url();
        let request = BootstrapRequest::from_config(&self.config);

        // A re-bootstrap with a still-loadable triple authenticates with
        // the current client certificate; otherwise the plain bootstrap
        // channel is all there is.
        let transport = if rotation {
            IdentityManager::new(&self.config.tls)
                .ok()
                .filter(|identity| identity.verify().is_ok())
                .and_then(|identity| identity.transport().ok())
        } else {
            None
        };

        let result = match transport {
            Some(client) => {
                bootstrap::bootstrap_with_client(&client, &url, &request, &self.shutdown_token)
                    .await
            }
            None => bootstrap::bootstrap(&self.config, &self.shutdown_token).await,
        };

        match result {
            Ok(response) => {
                let identity = IdentityManager::new(&self.config.tls)?;
                identity.store(&response.triple())?;

                self.config
                    .mark_bootstrapped(&response.agent_id, &response.api_base_url);
                self.config.save(&self.config_path)?;

                self.journal.set_agent_id(&response.agent_id);
                let _ = self
                    .journal
                    .emit(AuditEvent::bootstrap(&self.config.org_id, Ok(())));
                if rotation {
                    let _ = self
                        .journal
                        .emit(AuditEvent::cert_rotation(response.expires_at, Ok(())));
                }

                self.initial_policy = response.policy;
                info!("bootstrap successful, configuration saved");
                Ok(())
            }
            Err(BootstrapError::Cancelled) => Err(BootstrapError::Cancelled.into()),
            Err(e) => {
                let reason = e.to_string();
                let _ = self
                    .journal
                    .emit(AuditEvent::bootstrap(&self.config.org_id, Err(&reason)));
                if rotation {
                    let _ = self
                        .journal
                        .emit(AuditEvent::cert_rotation(None, Err(&reason)));
                }
                Err(e.into())
            }
        }
    }
}

/// Whether this tick runs an update pass: updates must be enabled by both
/// the local config and the server policy, and the policy's check interval
/// must have elapsed since the last pass.
fn update_check_due(
    config_enabled: bool,
    policy: &UpdatePolicy,
    since_last_check: Duration,
) -> bool {
    config_enabled
        && policy.enabled
        && since_last_check >= Duration::from_secs(policy.check_interval_secs)
}
