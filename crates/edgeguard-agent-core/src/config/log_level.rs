//! Log level configuration for the agent.
//!
//! Five levels, ordered from most to least verbose:
//! DEBUG < INFO < WARNING < ERROR < FATAL. Messages strictly below the
//! configured level are dropped by the subscriber before any formatting
//! cost is paid. FATAL is reserved for errors that terminate the process;
//! it filters like ERROR.
//!
//! Parsing is case-insensitive and deserialization is lenient: an invalid
//! value logs an error and falls back to the INFO default so the agent can
//! still start with a partially bad config file.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// Agent log level controlling verbosity of the application log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Detailed diagnostic information.
    Debug,
    /// Normal operational messages. This is the default.
    #[default]
    Info,
    /// Potentially problematic conditions.
    Warning,
    /// Failures of an individual operation.
    Error,
    /// Errors that terminate the process with a nonzero status.
    Fatal,
}

impl LogLevel {
    /// Converts this level to a `tracing` filter.
    ///
    /// FATAL has no `tracing` counterpart; it admits the same events as
    /// ERROR.
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: debug, info, warning, error, fatal",
            )),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        if let Value::String(s) = value {
            match LogLevel::from_str(&s) {
                Ok(level) => Ok(level),
                Err(e) => {
                    error!("{}", e);
                    Ok(LogLevel::Info)
                }
            }
        } else {
            error!("Expected a string for log level, got {:?}", value);
            Ok(LogLevel::Info)
        }
    }
}
