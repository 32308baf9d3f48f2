//! Supervisor Module
//!
//! This module provides the [`Supervisor`] which owns the agent's state
//! machine and the lifecycle of every long-lived component:
//!
//! - Identity Manager / Bootstrap Client
//! - Delivery Pipeline
//! - Collector Scheduler
//! - Policy Engine
//! - Health Monitor
//! - Updater
//! - Audit Journal
//!
//! ## Architecture
//!
//! Startup runs a staged state machine: load (or bootstrap) the config,
//! verify the identity (re-bootstrapping near expiry), then enter the run
//! loop where all services operate concurrently under one shared
//! cancellation token. Shutdown cancels the token and tears components
//! down with bounded waits.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use edgeguard_agent_core::agent::Supervisor;
//! use edgeguard_agent_core::config::Config;
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_environment();
//! let mut supervisor = Supervisor::new(config, PathBuf::from("/tmp/config.json"))?;
//!
//! // Wire the handle to a signal handler, then run to completion.
//! let handle = supervisor.handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! });
//! supervisor.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod supervisor;

pub use supervisor::{AgentError, Supervisor, SupervisorHandle};
