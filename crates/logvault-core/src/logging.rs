//! Structured logging for the daemon.
//!
//! Console-encoded `tracing` output with local-time timestamps, sunk either
//! to stdout or to a size-rolling file. Records emitted through the `log`
//! facade by libraries are captured by the subscriber's log bridge.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

use crate::error::{CoreError, CoreResult};

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

/// Rolled files default to 100 MiB when `rollSize` is unset.
const DEFAULT_ROLL_SIZE_MIB: u64 = 100;

/// Logger configuration from the root config's `log` block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Logging {
    /// Minimum level: `trace`..`error`; empty means `info`.
    pub level: String,
    /// Log file path; empty logs to stdout.
    pub path: String,
    /// Roll threshold in MiB.
    pub roll_size: u64,
    /// Number of rolled backups kept.
    pub roll_keep: usize,
}

impl Logging {
    /// Build and install the global subscriber.
    ///
    /// A second installation (tests, embedding) keeps the subscriber that is
    /// already in place.
    pub fn provision(&self) -> CoreResult<()> {
        let level: LevelFilter = if self.level.is_empty() {
            LevelFilter::INFO
        } else {
            self.level
                .parse()
                .map_err(|_| CoreError::InvalidConfig(format!("unknown log level: {}", self.level)))?
        };

        let sink = if self.path.is_empty() {
            LogSink::Stdout(io::stdout())
        } else {
            let roll_size = if self.roll_size == 0 {
                DEFAULT_ROLL_SIZE_MIB
            } else {
                self.roll_size
            };
            LogSink::File(RollingFileWriter::open(
                PathBuf::from(&self.path),
                roll_size * (1 << 20),
                self.roll_keep,
            )?)
        };

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
            .with_ansi(false)
            .with_writer(Mutex::new(sink))
            .try_init();
        Ok(())
    }
}

enum LogSink {
    Stdout(io::Stdout),
    File(RollingFileWriter),
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogSink::Stdout(out) => out.write(buf),
            LogSink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogSink::Stdout(out) => out.flush(),
            LogSink::File(file) => file.flush(),
        }
    }
}

/// Size-rolling file writer.
///
/// When a write would push the active file past `max_bytes`, the file is
/// renamed to `<path>.1` (existing backups shift to `.2`, `.3`, …, the
/// oldest beyond `keep` is deleted) and a fresh file is opened.
pub struct RollingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl RollingFileWriter {
    pub fn open(path: PathBuf, max_bytes: u64, keep: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            keep,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.keep == 0 {
            std::fs::remove_file(&self.path)?;
        } else {
            let _ = std::fs::remove_file(self.backup_path(self.keep));
            for i in (1..self.keep).rev() {
                let from = self.backup_path(i);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(i + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
