//! Size-based log rotation.
//!
//! The writer tracks the accumulated byte count of the current file. When
//! it reaches the limit, backups shift `path.N -> path.(N+1)` for
//! `N = max_backups-1 ... 1`, the current file becomes `path.1`, and a
//! fresh file is opened. Backups beyond `max_backups` are overwritten.
//! Rotation is best-effort: on a rename failure the writer reports to
//! stderr and keeps appending to the handle it already holds.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    file: File,
    current_size: u64,
}

impl RotatingFileWriter {
    pub(crate) fn open(path: &Path, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            max_backups,
            file,
            current_size,
        })
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) {
        if self.max_backups == 0 {
            // No backups kept: truncate in place.
            match OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
            {
                Ok(file) => {
                    self.file = file;
                    self.current_size = 0;
                }
                Err(e) => eprintln!("log rotation failed: {e}"),
            }
            return;
        }

        // Shift existing backups, oldest first. The highest-numbered backup
        // is overwritten by the rename below it.
        for n in (1..self.max_backups).rev() {
            let _ = fs::rename(self.backup_path(n), self.backup_path(n + 1));
        }

        if let Err(e) = fs::rename(&self.path, self.backup_path(1)) {
            // Keep writing to the existing file rather than losing records.
            eprintln!("log rotation failed: {e}");
            return;
        }

        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => {
                self.file = file;
                self.current_size = 0;
            }
            Err(e) => {
                // The old handle now points at `.1`; records still land on
                // disk until a later rotation succeeds.
                eprintln!("log rotation failed to reopen {}: {e}", self.path.display());
            }
        }
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.current_size += buf.len() as u64;
        if self.current_size >= self.max_bytes {
            self.rotate();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
