//! Persistent buffer - disk-backed FIFO of serialized telemetry batches.
//!
//! Batches land as individual `batch_<nanos>.json` files under a hard byte
//! budget. Writes that would exceed the budget fail with
//! [`BufferError::Full`]; the caller decides whether to prune oldest
//! entries and retry. Enumeration order is arbitrary - callers that need
//! chronological replay sort by the timestamp embedded in the filename.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer full (current: {current}, record: {record}, max: {max})")]
    Full {
        current: u64,
        record: u64,
        max: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One buffered batch as read back from disk.
#[derive(Debug, Clone)]
pub struct BufferedBatch {
    /// File name of the entry (`batch_<nanos>.json`).
    pub name: String,
    pub data: Vec<u8>,
}

impl BufferedBatch {
    /// Timestamp embedded in the entry's filename, used to order replays.
    #[must_use]
    pub fn timestamp_nanos(&self) -> Option<u128> {
        self.name
            .strip_prefix("batch_")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }
}

struct State {
    current_size: u64,
    // Tiebreak for writes landing in the same nanosecond.
    last_nanos: u128,
}

/// Directory-backed FIFO with a byte budget and oldest-first eviction.
pub struct PersistentBuffer {
    dir: PathBuf,
    max_bytes: u64,
    state: Mutex<State>,
}

impl PersistentBuffer {
    /// Opens the buffer, creating the directory (owner-only) if needed and
    /// recounting the size of whatever survived a previous run.
    pub fn open(dir: &Path, max_bytes: u64) -> Result<Self, BufferError> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }

        let buffer = Self {
            dir: dir.to_path_buf(),
            max_bytes,
            state: Mutex::new(State {
                current_size: 0,
                last_nanos: 0,
            }),
        };

        let size = buffer.scan_size()?;
        buffer.lock().current_size = size;
        Ok(buffer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends one serialized batch.
    ///
    /// Refuses with [`BufferError::Full`] when the record would push the
    /// directory over the budget; nothing is partially written.
    pub fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        let mut state = self.lock();

        let record = data.len() as u64;
        if state.current_size + record > self.max_bytes {
            return Err(BufferError::Full {
                current: state.current_size,
                record,
                max: self.max_bytes,
            });
        }

        let mut nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        if nanos <= state.last_nanos {
            nanos = state.last_nanos + 1;
        }
        state.last_nanos = nanos;

        let path = self.dir.join(format!("batch_{nanos}.json"));
        fs::write(&path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        state.current_size += record;
        debug!(
            "buffered {} bytes (total: {}/{})",
            record, state.current_size, self.max_bytes
        );
        Ok(())
    }

    /// Reads every buffered batch. Order is arbitrary.
    pub fn read_all(&self) -> Result<Vec<BufferedBatch>, BufferError> {
        let _state = self.lock();

        let mut batches = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match fs::read(entry.path()) {
                Ok(data) => batches.push(BufferedBatch {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    data,
                }),
                Err(e) => warn!("failed to read buffer file {:?}: {}", entry.file_name(), e),
            }
        }
        Ok(batches)
    }

    /// Removes every buffered batch.
    pub fn clear(&self) -> Result<(), BufferError> {
        let mut state = self.lock();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("failed to remove buffer file {:?}: {}", entry.file_name(), e);
                }
            }
        }

        state.current_size = 0;
        Ok(())
    }

    /// Evicts oldest entries (by modification time) until the directory is
    /// back under the budget. Eviction is unconditional: old telemetry is
    /// dropped rather than blocking producers.
    pub fn prune(&self) -> Result<(), BufferError> {
        self.prune_to(self.max_bytes)
    }

    /// Evicts oldest entries until `size <= target_bytes`. Used by the
    /// delivery pipeline to make room for an incoming batch.
    pub fn prune_to(&self, target_bytes: u64) -> Result<(), BufferError> {
        let mut state = self.lock();
        if state.current_size <= target_bytes {
            return Ok(());
        }

        warn!(
            "buffer size ({}) exceeds target ({}), pruning",
            state.current_size, target_bytes
        );

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let meta = entry.metadata()?;
            files.push((entry.path(), meta.modified()?, meta.len()));
        }
        // Filename nanos break ties when the filesystem's mtime
        // granularity is coarser than the write rate.
        files.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));

        for (path, _, size) in files {
            if state.current_size <= target_bytes {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    state.current_size = state.current_size.saturating_sub(size);
                    debug!("pruned {} ({} bytes)", path.display(), size);
                }
                Err(e) => warn!("failed to prune {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    /// Current total size in bytes.
    pub fn size(&self) -> u64 {
        self.lock().current_size
    }

    /// The configured byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn scan_size(&self) -> Result<u64, BufferError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}
