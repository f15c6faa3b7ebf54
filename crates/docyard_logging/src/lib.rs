//! Tracing setup shared by docyard processes and tests.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "docyard_db=info";
const DEFAULT_MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;

/// Logging configuration for a docyard process.
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Directory for the log file. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Mirror the file filter on stderr instead of warnings only.
    pub verbose: bool,
}

impl<'a> LogConfig<'a> {
    /// Stderr plus a file under [`logs_dir`].
    pub fn with_default_dir(app_name: &'a str) -> Self {
        Self {
            app_name,
            log_dir: Some(logs_dir()),
            verbose: false,
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter. Fails if a global subscriber is
/// already installed.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose || config.log_dir.is_none() {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    let file_layer = match &config.log_dir {
        Some(dir) => {
            let writer = SharedLogFile::open(dir, config.app_name, DEFAULT_MAX_FILE_BYTES)
                .with_context(|| format!("Failed to open log file in {}", dir.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Route tracing output through the test harness. Safe to call from every test.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("docyard_db=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Home directory for docyard state: `$DOCYARD_HOME` or `~/.docyard`.
pub fn docyard_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("DOCYARD_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".docyard"))
        .unwrap_or_else(|| PathBuf::from(".docyard"))
}

pub fn logs_dir() -> PathBuf {
    docyard_home().join("logs")
}

/// Append-only log file that moves itself to `<name>.log.1` once it grows
/// past `max_bytes`. Only one backup is kept.
struct CappedLogFile {
    path: PathBuf,
    backup: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl CappedLogFile {
    fn open(dir: &Path, app_name: &str, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stem = file_stem(app_name);
        let path = dir.join(format!("{}.log", stem));
        let backup = dir.join(format!("{}.log.1", stem));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            backup,
            max_bytes,
            file,
            written,
        })
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, &self.backup)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for CappedLogFile {
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

#[derive(Clone)]
struct SharedLogFile {
    inner: Arc<Mutex<CappedLogFile>>,
}

impl SharedLogFile {
    fn open(dir: &Path, app_name: &str, max_bytes: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(CappedLogFile::open(dir, app_name, max_bytes)?)),
        })
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut CappedLogFile) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        op(&mut guard)
    }
}

impl Write for SharedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogFile {
    type Writer = SharedLogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if stem.is_empty() {
        "docyard".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_stem_replaces_separators() {
        assert_eq!(file_stem("store/worker 1"), "store_worker_1");
        assert_eq!(file_stem(""), "docyard");
    }

    #[test]
    fn test_capped_file_rolls_into_backup() {
        let tmp = TempDir::new().unwrap();
        let mut file = CappedLogFile::open(tmp.path(), "store", 16).unwrap();
        file.write_all(b"first line 0123\n").unwrap();
        file.write_all(b"second line\n").unwrap();
        file.flush().unwrap();

        let current = fs::read_to_string(tmp.path().join("store.log")).unwrap();
        let backup = fs::read_to_string(tmp.path().join("store.log.1")).unwrap();
        assert_eq!(current, "second line\n");
        assert_eq!(backup, "first line 0123\n");
    }

    #[test]
    fn test_oversized_single_write_is_kept() {
        let tmp = TempDir::new().unwrap();
        let mut file = CappedLogFile::open(tmp.path(), "store", 4).unwrap();
        file.write_all(b"longer than the cap\n").unwrap();
        file.flush().unwrap();
        assert!(!tmp.path().join("store.log.1").exists());
    }

    #[test]
    fn test_home_override_drives_default_log_dir() {
        let tmp = TempDir::new().unwrap();
        std::env::set_var("DOCYARD_HOME", tmp.path());

        assert_eq!(docyard_home(), tmp.path());
        assert_eq!(logs_dir(), tmp.path().join("logs"));
        let config = LogConfig::with_default_dir("store");
        assert_eq!(config.log_dir, Some(tmp.path().join("logs")));
        assert!(!config.verbose);

        std::env::remove_var("DOCYARD_HOME");
        assert!(docyard_home().ends_with(".docyard"));
    }

    #[test]
    fn test_init_logging_opens_file_once() {
        let tmp = TempDir::new().unwrap();
        let config = LogConfig {
            app_name: "docyard worker",
            log_dir: Some(tmp.path().to_path_buf()),
            verbose: true,
        };
        init_logging(config.clone()).unwrap();
        assert!(tmp.path().join("docyard_worker.log").exists());

        // The global subscriber is already installed
        assert!(init_logging(config).is_err());
    }
}
