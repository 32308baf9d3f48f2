//! Security audit journal.
//!
//! Append-only log of security-relevant events: one JSON object per line,
//! written with `O_APPEND` and fsynced before `emit` returns, so every
//! record is durable by the time the caller proceeds. A single mutex
//! serializes writers, which makes the journal totally ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit journal is closed")]
    Closed,

    #[error("failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome attached to every audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
}

/// A single security-relevant event. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    fn new(event_type: &str, action: &str, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            severity: match result {
                AuditResult::Success => "INFO".to_string(),
                AuditResult::Failure => "ERROR".to_string(),
            },
            agent_id: String::new(),
            action: action.to_string(),
            resource: None,
            result,
            details: BTreeMap::new(),
            error: None,
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Agent registration outcome. `resource` carries the organization.
    pub fn bootstrap(org_id: &str, result: Result<(), &str>) -> Self {
        let mut event = Self::new(
            "bootstrap",
            "agent_registration",
            match result {
                Ok(()) => AuditResult::Success,
                Err(_) => AuditResult::Failure,
            },
        );
        event.resource = Some(org_id.to_string());
        if let Err(reason) = result {
            event.error = Some(reason.to_string());
        }
        event
    }

    pub fn policy_change(old_version: &str, new_version: &str) -> Self {
        Self::new("policy_change", "policy_update", AuditResult::Success)
            .with_detail("old_version", old_version)
            .with_detail("new_version", new_version)
    }

    pub fn update(old_version: &str, new_version: &str, result: Result<(), &str>) -> Self {
        let mut event = Self::new(
            "agent_update",
            "binary_update",
            match result {
                Ok(()) => AuditResult::Success,
                Err(_) => AuditResult::Failure,
            },
        )
        .with_detail("old_version", old_version)
        .with_detail("new_version", new_version);
        if let Err(reason) = result {
            event.error = Some(reason.to_string());
        }
        event
    }

    pub fn auth_failure(endpoint: &str, reason: &str) -> Self {
        let mut event = Self::new("auth_failure", "authentication", AuditResult::Failure);
        event.severity = "WARNING".to_string();
        event.resource = Some(endpoint.to_string());
        event.error = Some(reason.to_string());
        event
    }

    pub fn cert_rotation(new_expiry: Option<DateTime<Utc>>, result: Result<(), &str>) -> Self {
        let mut event = Self::new(
            "cert_rotation",
            "certificate_renewal",
            match result {
                Ok(()) => AuditResult::Success,
                Err(_) => AuditResult::Failure,
            },
        );
        if let Some(expiry) = new_expiry {
            event = event.with_detail("new_expiry", expiry.to_rfc3339());
        }
        if let Err(reason) = result {
            event.error = Some(reason.to_string());
        }
        event
    }

    pub fn service_start(version: &str) -> Self {
        Self::new("service_lifecycle", "service_start", AuditResult::Success)
            .with_detail("version", version)
    }

    pub fn service_stop(reason: &str) -> Self {
        Self::new("service_lifecycle", "service_stop", AuditResult::Success)
            .with_detail("reason", reason)
    }
}

struct Inner {
    file: Option<File>,
    agent_id: String,
}

/// Append-only journal over a single file handle.
pub struct AuditJournal {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl AuditJournal {
    /// Opens (creating if needed) the journal at `path`.
    ///
    /// The parent directory is created on open; the file itself is created
    /// with owner-only permissions and opened in append mode.
    pub fn open(path: &Path, agent_id: &str) -> Result<Self, AuditError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file: Some(file),
                agent_id: agent_id.to_string(),
            }),
        })
    }

    /// Records the agent identity used for subsequent events that do not
    /// carry one explicitly (it is only known after bootstrap).
    pub fn set_agent_id(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.agent_id = agent_id.to_string();
    }

    /// Appends one event and fsyncs before returning.
    pub fn emit(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if event.agent_id.is_empty() {
            event.agent_id = inner.agent_id.clone();
        }

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let file = inner.file.as_mut().ok_or(AuditError::Closed)?;
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    /// Closes the underlying file. Further `emit` calls fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.file = None;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn read_lines(path: &Path) -> Vec<AuditEvent> {
        let file = File::open(path).expect("open journal");
        std::io::BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.expect("line")).expect("event json"))
            .collect()
    }

    #[test]
    fn test_emit_appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let journal = AuditJournal::open(&path, "agent-1").expect("open");

        journal
            .emit(AuditEvent::bootstrap("org-1", Ok(())))
            .expect("emit");
        journal
            .emit(AuditEvent::policy_change("1.0.0", "1.1.0"))
            .expect("emit");

        let events = read_lines(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "bootstrap");
        assert_eq!(events[0].result, AuditResult::Success);
        assert_eq!(events[0].agent_id, "agent-1");
        assert_eq!(events[1].event_type, "policy_change");
        assert_eq!(
            events[1].details.get("new_version"),
            Some(&Value::from("1.1.0"))
        );
    }

    #[test]
    fn test_failure_events_carry_reason_and_severity() {
        let event = AuditEvent::bootstrap("org-1", Err("server returned 401"));
        assert_eq!(event.result, AuditResult::Failure);
        assert_eq!(event.severity, "ERROR");
        assert_eq!(event.error.as_deref(), Some("server returned 401"));

        let event = AuditEvent::auth_failure("/api/v1/telemetry", "certificate rejected");
        assert_eq!(event.severity, "WARNING");
        assert_eq!(event.resource.as_deref(), Some("/api/v1/telemetry"));
    }

    #[test]
    fn test_agent_id_fills_after_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let journal = AuditJournal::open(&path, "").expect("open");

        journal
            .emit(AuditEvent::service_start("1.0.0"))
            .expect("emit");
        journal.set_agent_id("agent-9");
        journal
            .emit(AuditEvent::service_stop("shutdown"))
            .expect("emit");

        let events = read_lines(&path);
        assert_eq!(events[0].agent_id, "");
        assert_eq!(events[1].agent_id, "agent-9");
    }

    #[test]
    fn test_emit_after_close_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = AuditJournal::open(&dir.path().join("audit.log"), "a").expect("open");
        journal.close();
        assert!(matches!(
            journal.emit(AuditEvent::service_stop("bye")),
            Err(AuditError::Closed)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_journal_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let _journal = AuditJournal::open(&path, "a").expect("open");

        let mode = fs::metadata(&path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
