//! Error Subsystem
//!
//! Taxonomy of stable error codes grouped into categories, a bounded
//! in-memory error log mirrored to disk, and a handler registry dispatched
//! on code, category, level, and a catch-all key.
//!
//! Errors are data here: subsystems build an [`ErrorRecord`] (or hand in a
//! plain string / `anyhow::Error`) and pass it to [`ErrorHandler::handle`].
//! Registered handlers run in registration order; a failing handler is
//! logged and never propagated.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Stable error codes. Codes are strings on the wire; these constants are
/// the ones the core itself emits.
pub mod codes {
    pub const RESOURCE_NOT_FOUND: &str = "RESOURCE_NOT_FOUND";
    pub const RESOURCE_UNAVAILABLE: &str = "RESOURCE_UNAVAILABLE";
    pub const COMMUNICATION_FAILURE: &str = "COMMUNICATION_FAILURE";
    pub const SERIALIZATION_FAILURE: &str = "SERIALIZATION_FAILURE";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const HANDLER_FAILURE: &str = "HANDLER_FAILURE";
    pub const PERSISTENCE_FAILURE: &str = "PERSISTENCE_FAILURE";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// Severity, mirroring the standard log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Coarse grouping of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Configuration,
    Communication,
    Validation,
    BusinessLogic,
    Persistence,
    Resource,
    Security,
    Unknown,
}

impl ErrorCategory {
    /// Default category for a known code.
    pub fn for_code(code: &str) -> Self {
        match code {
            codes::INVALID_CONFIG => ErrorCategory::Configuration,
            codes::COMMUNICATION_FAILURE | codes::SERIALIZATION_FAILURE => {
                ErrorCategory::Communication
            }
            codes::INVALID_MESSAGE => ErrorCategory::Validation,
            codes::PERSISTENCE_FAILURE => ErrorCategory::Persistence,
            codes::RESOURCE_NOT_FOUND | codes::RESOURCE_UNAVAILABLE => ErrorCategory::Resource,
            _ => ErrorCategory::Unknown,
        }
    }
}

/// A single recorded error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub level: ErrorLevel,
    pub category: ErrorCategory,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Debug representation of the originating error chain, when ingested
    /// from an `anyhow::Error`.
    pub stack: Option<String>,
}

impl ErrorRecord {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            level: ErrorLevel::Error,
            category: ErrorCategory::for_code(code),
            details: Map::new(),
            source: None,
            timestamp: Utc::now(),
            stack: None,
        }
    }

    pub fn with_level(mut self, level: ErrorLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

impl From<&str> for ErrorRecord {
    fn from(message: &str) -> Self {
        ErrorRecord::new(codes::UNKNOWN_ERROR, message)
    }
}

impl From<String> for ErrorRecord {
    fn from(message: String) -> Self {
        ErrorRecord::new(codes::UNKNOWN_ERROR, &message)
    }
}

impl From<anyhow::Error> for ErrorRecord {
    fn from(err: anyhow::Error) -> Self {
        let mut record = ErrorRecord::new(codes::UNKNOWN_ERROR, &err.to_string());
        record.stack = Some(format!("{:?}", err));
        record
    }
}

/// Handler registration key: one of the four dispatch dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Code(String),
    Category(ErrorCategory),
    Level(ErrorLevel),
    All,
}

impl HandlerKey {
    fn matches(&self, record: &ErrorRecord) -> bool {
        match self {
            HandlerKey::Code(code) => record.code == *code,
            HandlerKey::Category(cat) => record.category == *cat,
            HandlerKey::Level(level) => record.level == *level,
            HandlerKey::All => true,
        }
    }
}

/// Callback invoked for matching errors. A returned `Err` is logged, never
/// propagated to the code that reported the error.
pub type ErrorCallback = Arc<dyn Fn(&ErrorRecord) -> anyhow::Result<()> + Send + Sync>;

/// Filter for querying the bounded error log.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub code: Option<String>,
    pub level: Option<ErrorLevel>,
    pub category: Option<ErrorCategory>,
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ErrorFilter {
    fn matches(&self, record: &ErrorRecord) -> bool {
        if let Some(ref code) = self.code {
            if record.code != *code {
                return false;
            }
        }
        if let Some(level) = self.level {
            if record.level != level {
                return false;
            }
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if record.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts for the hub status view.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_level: HashMap<String, usize>,
    pub by_category: HashMap<String, usize>,
}

struct LogState {
    records: VecDeque<ErrorRecord>,
    since_persist: usize,
}

/// Bounded error log with handler dispatch and a JSON file mirror.
pub struct ErrorHandler {
    max_errors: usize,
    persist_path: Option<PathBuf>,
    persist_every: usize,
    log: Mutex<LogState>,
    handlers: RwLock<Vec<(HandlerKey, ErrorCallback)>>,
}

impl ErrorHandler {
    pub fn new(max_errors: usize, persist_path: Option<PathBuf>) -> Self {
        Self {
            max_errors,
            persist_path,
            persist_every: 10,
            log: Mutex::new(LogState {
                records: VecDeque::new(),
                since_persist: 0,
            }),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler under one of the four dispatch keys. Handlers run
    /// in registration order across all matching keys.
    pub fn register_handler(&self, key: HandlerKey, callback: ErrorCallback) {
        self.handlers.write().push((key, callback));
    }

    /// Record an error, append it to the bounded log, and dispatch matching
    /// handlers. Accepts anything convertible into an [`ErrorRecord`].
    pub fn handle(&self, error: impl Into<ErrorRecord>) -> ErrorRecord {
        let record = error.into();

        match record.level {
            ErrorLevel::Critical | ErrorLevel::Error => {
                warn!(code = %record.code, source = ?record.source, "{}", record.message)
            }
            _ => debug!(code = %record.code, "{}", record.message),
        }

        {
            let mut log = self.log.lock();
            log.records.push_back(record.clone());
            while log.records.len() > self.max_errors {
                log.records.pop_front();
            }
            log.since_persist += 1;
            if log.since_persist >= self.persist_every {
                log.since_persist = 0;
                self.persist_locked(&log.records);
            }
        }

        let handlers: Vec<ErrorCallback> = self
            .handlers
            .read()
            .iter()
            .filter(|(key, _)| key.matches(&record))
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for handler in handlers {
            if let Err(e) = handler(&record) {
                warn!(code = %record.code, "error handler failed: {e:#}");
            }
        }

        record
    }

    /// Query the log, newest last, bounded by `filter.limit`.
    pub fn query(&self, filter: &ErrorFilter) -> Vec<ErrorRecord> {
        let log = self.log.lock();
        let mut out: Vec<ErrorRecord> = log
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = out.len().saturating_sub(limit);
            out.drain(..skip);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> ErrorSummary {
        let log = self.log.lock();
        let mut by_level: HashMap<String, usize> = HashMap::new();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        for record in &log.records {
            *by_level
                .entry(format!("{:?}", record.level).to_uppercase())
                .or_default() += 1;
            *by_category
                .entry(format!("{:?}", record.category).to_uppercase())
                .or_default() += 1;
        }
        ErrorSummary {
            total: log.records.len(),
            by_level,
            by_category,
        }
    }

    /// Flush the log mirror to disk. Called on shutdown.
    pub fn close(&self) {
        let mut log = self.log.lock();
        log.since_persist = 0;
        self.persist_locked(&log.records);
    }

    fn persist_locked(&self, records: &VecDeque<ErrorRecord>) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        if let Err(e) = write_json_atomic(path, &serde_json::json!({
            "saved_at": Utc::now(),
            "errors": records,
        })) {
            warn!("failed to persist error log to {}: {e:#}", path.display());
        }
    }
}

/// Write a JSON document via a temp file and atomic rename.
pub(crate) fn write_json_atomic(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_log_is_bounded() {
        let handler = ErrorHandler::new(5, None);
        for i in 0..20 {
            handler.handle(ErrorRecord::new(codes::UNKNOWN_ERROR, &format!("e{i}")));
        }
        assert_eq!(handler.len(), 5);

        // Oldest entries were discarded first.
        let remaining = handler.query(&ErrorFilter::default());
        assert_eq!(remaining[0].message, "e15");
        assert_eq!(remaining[4].message, "e19");
    }

    #[test]
    fn test_handler_dispatch_keys() {
        let handler = ErrorHandler::new(100, None);
        let by_code = Arc::new(AtomicUsize::new(0));
        let by_category = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&by_code);
        handler.register_handler(
            HandlerKey::Code(codes::COMMUNICATION_FAILURE.to_string()),
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let c = Arc::clone(&by_category);
        handler.register_handler(
            HandlerKey::Category(ErrorCategory::Communication),
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let c = Arc::clone(&all);
        handler.register_handler(
            HandlerKey::All,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        handler.handle(ErrorRecord::new(codes::COMMUNICATION_FAILURE, "publish failed"));
        handler.handle(ErrorRecord::new(codes::RESOURCE_NOT_FOUND, "no agent"));

        assert_eq!(by_code.load(Ordering::SeqCst), 1);
        assert_eq!(by_category.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_handler_does_not_propagate() {
        let handler = ErrorHandler::new(10, None);
        let after = Arc::new(AtomicUsize::new(0));

        handler.register_handler(
            HandlerKey::All,
            Arc::new(|_| anyhow::bail!("handler exploded")),
        );
        let c = Arc::clone(&after);
        handler.register_handler(
            HandlerKey::All,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        handler.handle("boom");
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_filters() {
        let handler = ErrorHandler::new(100, None);
        handler.handle(
            ErrorRecord::new(codes::RESOURCE_NOT_FOUND, "a").with_source("hub"),
        );
        handler.handle(
            ErrorRecord::new(codes::COMMUNICATION_FAILURE, "b").with_level(ErrorLevel::Critical),
        );
        handler.handle(ErrorRecord::new(codes::RESOURCE_NOT_FOUND, "c"));

        let by_code = handler.query(&ErrorFilter {
            code: Some(codes::RESOURCE_NOT_FOUND.to_string()),
            ..Default::default()
        });
        assert_eq!(by_code.len(), 2);

        let by_level = handler.query(&ErrorFilter {
            level: Some(ErrorLevel::Critical),
            ..Default::default()
        });
        assert_eq!(by_level.len(), 1);
        assert_eq!(by_level[0].message, "b");

        let by_source = handler.query(&ErrorFilter {
            source: Some("hub".to_string()),
            ..Default::default()
        });
        assert_eq!(by_source.len(), 1);

        let limited = handler.query(&ErrorFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].message, "c");
    }

    #[test]
    fn test_anyhow_ingestion_captures_chain() {
        let handler = ErrorHandler::new(10, None);
        let err = anyhow::anyhow!("root cause").context("outer context");
        let record = handler.handle(err);

        assert_eq!(record.code, codes::UNKNOWN_ERROR);
        assert_eq!(record.message, "outer context");
        assert!(record.stack.as_deref().unwrap().contains("root cause"));
    }

    #[test]
    fn test_persistence_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.json");
        let handler = ErrorHandler::new(100, Some(path.clone()));

        handler.handle("one");
        handler.close();

        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["errors"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_category_for_code() {
        assert_eq!(
            ErrorCategory::for_code(codes::COMMUNICATION_FAILURE),
            ErrorCategory::Communication
        );
        assert_eq!(
            ErrorCategory::for_code(codes::RESOURCE_UNAVAILABLE),
            ErrorCategory::Resource
        );
        assert_eq!(ErrorCategory::for_code("SOMETHING_ELSE"), ErrorCategory::Unknown);
    }
}
