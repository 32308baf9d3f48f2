//! # EdgeGuard Agent Core
//!
//! This crate provides the core subsystems of the EdgeGuard endpoint agent,
//! a long-running background process that establishes a cryptographic
//! identity with a central control plane, collects system telemetry, and
//! delivers it reliably over authenticated channels even across network
//! outages.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - [`agent`]: Supervisor state machine and lifecycle coordination
//! - [`identity`]: Certificate triple ownership and the mTLS transport factory
//! - [`bootstrap`]: One-shot token-for-certificate exchange
//! - [`pipeline`]: Batch, transmit, spill-to-disk, and drain of telemetry
//! - [`buffer`]: Byte-budgeted on-disk FIFO for offline batches
//! - [`policy`]: Server-driven configuration with atomic snapshot swaps
//! - [`scheduler`]: Jittered per-collector tickers with bounded runs
//! - [`updater`]: Check, download, verify, and atomically swap the binary
//!
//! ## Supervision
//!
//! Every long-lived task subscribes to a single
//! [`CancellationToken`](tokio_util::sync::CancellationToken) owned by the
//! supervisor; cancelling it drives a graceful, bounded shutdown of the
//! whole agent.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]

/// Supervisor state machine and lifecycle coordination
pub mod agent;

/// Security audit journal - append-only, fsynced JSON lines
pub mod audit;

/// Bootstrap client - exchanges an install token for an identity
pub mod bootstrap;

/// Persistent buffer - disk-backed FIFO of serialized batches
pub mod buffer;

/// Collectors - typed probes for system, CPU, memory, disk, and network
pub mod collectors;

/// Configuration management - two-phase validation, env overlay, defaults
pub mod config;

/// Health monitor - periodic heartbeat and local health predicate
pub mod health;

/// Identity manager - certificate triple and mTLS transport factory
pub mod identity;

/// Logging infrastructure - tracing setup with size-based file rotation
pub mod logging;

/// Delivery pipeline - batching, retry, spill, and drain of telemetry
pub mod pipeline;

/// Policy engine - server-issued configuration snapshots
pub mod policy;

/// Retry primitive - exponential backoff with jitter and cancellation
pub mod retry;

/// Collector scheduler - per-collector tickers with jitter and timeouts
pub mod scheduler;

/// Auto-updater - check, download, verify, install, rollback
pub mod updater;

/// Agent version reported to the control plane during bootstrap, heartbeat,
/// and update checks.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs build information at INFO level.
///
/// Called during agent initialization so the running version is recorded at
/// the top of every log file.
pub fn log_build_info() {
    tracing::info!("edgeguard-agent version: {}", AGENT_VERSION);
}
