use chrono::{DateTime, Local};
use log::warn;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// One line of engine or supervisor output.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

impl LogRecord {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            text: text.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.text
        )
    }
}

/// Maps a `log_rotation` setting to an appender rotation. Unknown values
/// fall back to daily.
pub fn parse_rotation(value: &str) -> Rotation {
    match value.trim().to_ascii_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" | "" => Rotation::DAILY,
        "never" => Rotation::NEVER,
        other => {
            warn!("Unknown log rotation {:?}, using daily", other);
            Rotation::DAILY
        }
    }
}

fn appender(
    dir: &Path,
    file_name: &str,
    rotation: Rotation,
    keep: usize,
) -> io::Result<RollingFileAppender> {
    let name = Path::new(file_name);
    let prefix = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .max_log_files(keep.max(1));
    if let Some(ext) = name.extension() {
        builder = builder.filename_suffix(ext.to_string_lossy().into_owned());
    }
    std::fs::create_dir_all(dir)?;
    builder.build(dir).map_err(io::Error::other)
}

/// Rolling file that receives every engine output line, written through as
/// each line arrives.
pub struct LogBook {
    dir: PathBuf,
    writer: Mutex<RollingFileAppender>,
}

impl LogBook {
    pub fn open(
        dir: impl Into<PathBuf>,
        file_name: &str,
        rotation: Rotation,
        keep: usize,
    ) -> io::Result<Self> {
        let dir = dir.into();
        let writer = appender(&dir, file_name, rotation, keep)?;
        Ok(Self {
            dir,
            writer: Mutex::new(writer),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn writer(&self) -> MutexGuard<'_, RollingFileAppender> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, record: &LogRecord) {
        let mut writer = self.writer();
        // engines die without warning, so no buffering here
        if let Err(e) = writeln!(writer, "{}", record.render()).and_then(|_| writer.flush()) {
            eprintln!("Failed to write engine log in {:?}: {}", self.dir, e);
        }
    }
}

/// Installs the process-wide subscriber writing to a rolling file in `dir`.
/// `RUST_LOG` overrides `level`. `log` records are bridged into it.
///
/// Lines are written by a background worker; keep the returned guard alive
/// until the program exits so the tail gets flushed.
pub fn init(
    dir: &Path,
    file_name: &str,
    rotation: Rotation,
    keep: usize,
    level: &str,
) -> io::Result<WorkerGuard> {
    let file_appender = appender(dir, file_name, rotation, keep)?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .compact()
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
    Ok(guard)
}
