//! Size-bounded rotating output file.
//!
//! Layout for an output path `web.log` with `backup_count = 3`:
//!
//! ```text
//! web.log      live file, appended to
//! web.log.1    newest backup
//! web.log.2
//! web.log.3    oldest backup, deleted on the next rotation
//! ```
//!
//! Rotation happens right after the append that brings the live file to
//! `max_bytes` or more, so the next line always lands in a fresh file.
//! Writes are small synchronous appends; the sink is owned by exactly one
//! worker and nothing else touches these files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use logredirect_core::error::SinkError;
use logredirect_core::types::SourceSpec;

/// What one successful append did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Bytes written including the newline
    pub bytes: u64,
    pub rotation: Rotation,
}

/// Rotation step that follows a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The live file is still below `max_bytes`
    NotDue,
    Rotated,
    /// The line is on disk but the live file could not be rotated. The next
    /// append retries the rotation before writing.
    Failed(SinkError),
}

/// Append-only writer that rotates its file by size.
#[derive(Debug)]
pub struct RotatingSink {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: Option<File>,
    size: u64,
    rotations: u64,
}

impl RotatingSink {
    /// The file is not touched until the first append.
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backup_count: u32) -> Self {
        Self {
            path: path.into(),
            max_bytes: max_bytes.max(1),
            backup_count,
            file: None,
            size: 0,
            rotations: 0,
        }
    }

    pub fn from_spec(spec: &SourceSpec) -> Self {
        Self::new(spec.output_path.clone(), spec.max_bytes, spec.backup_count)
    }

    /// Appends `line` and a newline, rotating afterwards if the live file
    /// reached `max_bytes`.
    ///
    /// `Err` means the line was not written. A failed rotation after a good
    /// write is reported in [`AppendOutcome::rotation`]. Either way the file
    /// handle is dropped and reopened by the next call.
    pub fn append(&mut self, line: &str) -> Result<AppendOutcome, SinkError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        if let Err(e) = self.write(&buf) {
            self.file = None;
            return Err(e);
        }

        let rotation = if self.size < self.max_bytes {
            Rotation::NotDue
        } else {
            match self.rotate() {
                Ok(()) => Rotation::Rotated,
                Err(e) => {
                    self.file = None;
                    Rotation::Failed(e)
                }
            }
        };

        Ok(AppendOutcome {
            bytes: buf.len() as u64,
            rotation,
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        let file = self.open()?;
        file.write_all(buf).map_err(|e| self.classify(&e))?;
        self.size += buf.len() as u64;
        Ok(())
    }

    /// Opens the live file in append mode, creating parent directories.
    /// A file already at or above the threshold is rotated first.
    fn open(&mut self) -> Result<&mut File, SinkError> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).map_err(|e| self.classify(&e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| self.classify(&e))?;
            self.size = file.metadata().map_err(|e| self.classify(&e))?.len();
            self.file = Some(file);

            if self.size >= self.max_bytes {
                self.rotate()?;
            }
        }

        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(SinkError::Io {
                path: self.path.display().to_string(),
                reason: "file handle unavailable after open".to_owned(),
            }),
        }
    }

    /// Shifts backups up by one and starts an empty live file.
    fn rotate(&mut self) -> Result<(), SinkError> {
        self.file = None;

        if self.backup_count == 0 {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|e| self.classify(&e))?;
            drop(file);
        } else {
            let oldest = backup_path(&self.path, self.backup_count);
            remove_if_exists(&oldest).map_err(|e| self.classify(&e))?;

            for n in (1..self.backup_count).rev() {
                let src = backup_path(&self.path, n);
                if src.exists() {
                    fs::rename(&src, backup_path(&self.path, n + 1))
                        .map_err(|e| self.classify(&e))?;
                }
            }

            fs::rename(&self.path, backup_path(&self.path, 1)).map_err(|e| self.classify(&e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.classify(&e))?;
        self.file = Some(file);
        self.size = 0;
        self.rotations += 1;
        Ok(())
    }

    fn classify(&self, err: &io::Error) -> SinkError {
        let path = self.path.display().to_string();
        match err.kind() {
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
                SinkError::PermissionDenied { path }
            }
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => SinkError::DiskFull { path },
            ErrorKind::NotFound
            | ErrorKind::InvalidInput
            | ErrorKind::NotADirectory
            | ErrorKind::IsADirectory => SinkError::PathInvalid {
                path,
                reason: err.to_string(),
            },
            _ => SinkError::Io {
                path,
                reason: err.to_string(),
            },
        }
    }

    /// Closes the live file. The next append reopens it.
    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the live file.
    #[cfg(test)]
    fn size(&self) -> u64 {
        self.size
    }

    /// Rotations performed by this sink.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}

/// Path of the `n`-th backup of `base` (`web.log` -> `web.log.2`).
pub fn backup_path(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
