//! Log sanitization, tracing setup and the job journal.
//!
//! The journal keeps a bounded in-memory view of recent job events and
//! mirrors every entry to `<config>/logs/jobs.log` as JSON lines.

use crate::commands::CommandStatus;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum entries to keep in memory ring buffer
const MAX_RING_BUFFER_LINES: usize = 10_000;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Maximum journal file size before rotation (5 MB)
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "sshjob=info,warn";

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH Private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        r"(?s)-----BEGIN[^-]*KEY-----.*?-----END[^-]*KEY-----",
        // sshpass-style inline passwords
        r"sshpass\s+-p\s*\S+",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|api[_-]?key|private[_-]?key|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 blobs
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }

    result
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over [`DEFAULT_FILTER`]. Calling this twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Pipeline stage a journal entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Setup,
    Transfer,
    Launch,
    Monitor,
    Finish,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::Setup => write!(f, "setup"),
            JobStage::Transfer => write!(f, "transfer"),
            JobStage::Launch => write!(f, "launch"),
            JobStage::Monitor => write!(f, "monitor"),
            JobStage::Finish => write!(f, "finish"),
        }
    }
}

/// A single journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub command_id: i64,
    pub stage: JobStage,
    pub status: CommandStatus,
    pub message: String,
}

impl JournalEntry {
    pub fn new(
        command_id: i64,
        stage: JobStage,
        status: CommandStatus,
        message: impl Into<String>,
    ) -> Self {
        let level = if status.is_failure() {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            command_id,
            stage,
            status,
            message: sanitize(&message.into()),
        }
    }
}

/// Filter for querying the journal
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalFilter {
    #[serde(default)]
    pub command_id: Option<i64>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub stage: Option<JobStage>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub since: Option<i64>,
}

impl JournalFilter {
    fn matches(&self, entry: &JournalEntry) -> bool {
        if let Some(id) = self.command_id {
            if entry.command_id != id {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(stage) = self.stage {
            if entry.stage != stage {
                return false;
            }
        }
        if let Some(ref search) = self.search {
            if !entry.message.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Job journal with ring buffer and file persistence
pub struct JobJournal {
    ring_buffer: RwLock<VecDeque<JournalEntry>>,
    log_file_path: PathBuf,
}

impl JobJournal {
    pub fn new(config_dir: &Path) -> std::io::Result<Arc<Self>> {
        let logs_dir = crate::config::get_logs_dir(config_dir);
        fs::create_dir_all(&logs_dir)?;

        let journal = Arc::new(Self {
            ring_buffer: RwLock::new(VecDeque::with_capacity(1024)),
            log_file_path: logs_dir.join("jobs.log"),
        });

        journal.load_existing();

        Ok(journal)
    }

    /// Load existing entries from the journal file into the ring buffer
    fn load_existing(&self) {
        let Ok(file) = File::open(&self.log_file_path) else {
            return;
        };
        let reader = BufReader::new(file);
        let mut buffer = self.ring_buffer.write();

        for line in reader.lines().map_while(Result::ok) {
            if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
                if buffer.len() >= MAX_RING_BUFFER_LINES {
                    buffer.pop_front();
                }
                buffer.push_back(entry);
            }
        }
    }

    /// Record an entry
    pub fn record(&self, entry: JournalEntry) {
        {
            let mut buffer = self.ring_buffer.write();
            if buffer.len() >= MAX_RING_BUFFER_LINES {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        self.write_to_file(&entry);
    }

    fn write_to_file(&self, entry: &JournalEntry) {
        if let Ok(metadata) = fs::metadata(&self.log_file_path) {
            if metadata.len() > MAX_LOG_FILE_SIZE {
                self.rotate();
            }
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
        {
            Ok(mut file) => {
                if let Ok(json) = serde_json::to_string(entry) {
                    if let Err(e) = writeln!(file, "{}", json) {
                        tracing::warn!("Failed to append to job journal: {}", e);
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to open job journal: {}", e),
        }
    }

    fn rotate(&self) {
        let rotated_path = self.log_file_path.with_extension("log.1");
        let _ = fs::remove_file(&rotated_path);
        let _ = fs::rename(&self.log_file_path, &rotated_path);
    }

    /// Recent entries, oldest first, optionally filtered
    pub fn recent(&self, max_entries: usize, filter: Option<&JournalFilter>) -> Vec<JournalEntry> {
        let buffer = self.ring_buffer.read();
        let mut entries: Vec<JournalEntry> = buffer
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .cloned()
            .collect();

        if entries.len() > max_entries {
            entries = entries.split_off(entries.len() - max_entries);
        }
        entries
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }
}
