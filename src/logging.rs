//! Logging
//!
//! Two sinks, both optional via config: a console sink (human-readable or
//! JSON) and a size-rotating file sink with N backups. Both are standard
//! `tracing-subscriber` fmt layers; only the rotation policy is local, as a
//! small `io::Write` the file layer writes through.
//!
//! [`ContextLogger`] carries a structured context map that is merged into
//! every record it emits; `with_context` returns an augmented copy.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Install the global subscriber from config. Safe to call more than once;
/// later calls leave the installed subscriber in place.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if cfg.console.enabled {
        let filter = env_filter(&cfg.level);
        if cfg.console.json {
            layers.push(fmt::layer().json().with_filter(filter).boxed());
        } else {
            layers.push(fmt::layer().with_filter(filter).boxed());
        }
    }

    if cfg.file.enabled {
        let writer = RotatingWriter::open(&cfg.file.path, cfg.file.max_bytes, cfg.file.backups)?;
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .with_filter(env_filter(&cfg.level))
                .boxed(),
        );
    }

    if tracing_subscriber::registry().with(layers).try_init().is_err() {
        debug!("tracing subscriber already installed, keeping existing sinks");
    }
    Ok(())
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

// ============ Rotating file writer ============

struct WriterState {
    file: File,
    written: u64,
}

struct WriterInner {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    state: Mutex<WriterState>,
}

/// Size-bounded log file with numbered backups: `app.log` rotates to
/// `app.log.1`, shifting older backups up and dropping the oldest.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<WriterInner>,
}

impl RotatingWriter {
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(WriterInner {
                path: path.to_path_buf(),
                max_bytes,
                backups,
                state: Mutex::new(WriterState { file, written }),
            }),
        })
    }

    fn rotate(&self, state: &mut WriterState) -> io::Result<()> {
        state.file.flush()?;

        let path = &self.inner.path;
        if self.inner.backups == 0 {
            std::fs::remove_file(path).ok();
        } else {
            for i in (1..=self.inner.backups).rev() {
                let from = if i == 1 {
                    path.clone()
                } else {
                    backup_path(path, i - 1)
                };
                if from.exists() {
                    std::fs::rename(&from, backup_path(path, i)).ok();
                }
            }
        }

        state.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        state.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{index}"));
    PathBuf::from(os)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock();
        if state.written > 0 && state.written + buf.len() as u64 > self.inner.max_bytes {
            self.rotate(&mut state)?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.state.lock().file.flush()
    }
}

// ============ Context logger ============

/// A named logger that merges a carried context map into every record.
#[derive(Clone)]
pub struct ContextLogger {
    name: String,
    context: Map<String, Value>,
}

impl ContextLogger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            context: Map::new(),
        }
    }

    /// A copy of this logger with one more context entry.
    pub fn with_field(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.context.insert(key.to_string(), value.into());
        next
    }

    /// A copy of this logger with the given entries merged in.
    pub fn with_context(&self, entries: Map<String, Value>) -> Self {
        let mut next = self.clone();
        next.context.extend(entries);
        next
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    fn context_json(&self) -> String {
        serde_json::to_string(&self.context).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn debug(&self, msg: &str) {
        debug!(logger = %self.name, context = %self.context_json(), "{msg}");
    }

    pub fn info(&self, msg: &str) {
        info!(logger = %self.name, context = %self.context_json(), "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        warn!(logger = %self.name, context = %self.context_json(), "{msg}");
    }

    pub fn error(&self, msg: &str) {
        error!(logger = %self.name, context = %self.context_json(), "{msg}");
    }

    /// Error record carrying the failure's message and chain.
    pub fn error_with(&self, msg: &str, err: &anyhow::Error) {
        error!(
            logger = %self.name,
            context = %self.context_json(),
            exception.message = %err,
            exception.chain = ?err,
            "{msg}"
        );
    }
}
