//! Application logging setup.
//!
//! Installs a `tracing` subscriber that renders timestamped, level-tagged
//! single-line records to two sinks: standard output and a size-rotating
//! log file. Level filtering happens in the subscriber, so events below
//! the configured level never reach the formatter.
//!
//! # Format
//!
//! ```text
//! 2024-01-15 10:30:00.123 [INFO] edgeguard_agent_core::agent: agent running agent_id=a-1
//! ```

mod rotate;

use crate::config::LogLevel;
use rotate::RotatingFileWriter;

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, MakeWriter,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install logger: {0}")]
    Init(String),
}

/// Logger configuration, taken from the agent config.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub path: PathBuf,
    pub level: LogLevel,
    pub max_size_mb: u64,
    pub max_backups: usize,
}

/// Single-line log formatter: timestamp, level, target, message, fields.
#[derive(Debug, Clone, Copy)]
struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        write!(
            &mut writer,
            "{now} [{}] {}: ",
            metadata.level(),
            metadata.target()
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Writer handed to the subscriber: tees every record to stdout and the
/// rotating file. Rotation happens under the same lock as the write.
#[derive(Clone)]
struct TeeMakeWriter {
    file: Arc<Mutex<RotatingFileWriter>>,
}

struct TeeWriter {
    file: Arc<Mutex<RotatingFileWriter>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Stdout is best-effort; the file is the sink of record.
        let _ = io::stdout().write_all(buf);
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.flush()
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Handle to the installed logger; keeps the file sink reachable for a
/// final flush at shutdown.
pub struct LogHandle {
    file: Arc<Mutex<RotatingFileWriter>>,
}

impl LogHandle {
    pub fn flush(&self) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = file.flush();
    }
}

/// Installs the global `tracing` subscriber.
///
/// Noise from HTTP internals is filtered out regardless of the configured
/// level, matching what the agent actually wants in its log file.
pub fn init(cfg: &LogConfig) -> Result<LogHandle, LogError> {
    let writer = RotatingFileWriter::open(&cfg.path, cfg.max_size_mb * 1024 * 1024, cfg.max_backups)?;
    let file = Arc::new(Mutex::new(writer));

    let filter = format!(
        "h2=off,hyper=off,rustls=off,{}",
        cfg.level.as_level_filter()
    );
    let env_filter = EnvFilter::try_new(filter).map_err(|e| LogError::Init(e.to_string()))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(Formatter)
        .with_writer(TeeMakeWriter {
            file: Arc::clone(&file),
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LogError::Init(e.to_string()))?;

    Ok(LogHandle { file })
}

/// Logs a fatal error and terminates the process with a nonzero status.
pub fn fatal(message: impl fmt::Display) -> ! {
    tracing::error!("FATAL: {message}");
    eprintln!("FATAL: {message}");
    std::process::exit(1);
}
