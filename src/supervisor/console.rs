//! Console history of the managed server.

use std::collections::VecDeque;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lines kept when `log_buffer_size` is absent from the config file.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;

/// `GET /api/console` without `since` or `count`
const DEFAULT_TAIL: usize = 100;

/// One entry of the console history. Ids grow by one per entry and are
/// never reused, so `since=<id>` polling stays valid after eviction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// 런처가 직접 남긴 줄 (기동, 종료 사유 등)
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Bounded console history. The oldest entry is evicted once `capacity`
/// entries are stored.
pub struct LogBuffer {
    history: VecDeque<LogLine>,
    last_id: u64,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_BUFFER)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity.min(1024)),
            last_id: 0,
            capacity,
        }
    }

    /// Stamp and store `content`; the stored entry is handed back for the
    /// event bus.
    pub fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        self.last_id += 1;
        let line = LogLine {
            id: self.last_id,
            timestamp: Utc::now(),
            source,
            content,
            level,
        };
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(line.clone());
        line
    }

    /// With `since`, entries newer than that id (at most `count` of them,
    /// oldest first). Without it, the newest `count` entries.
    pub fn read(&self, since: Option<u64>, count: Option<usize>) -> Vec<LogLine> {
        match since {
            Some(id) => self
                .history
                .iter()
                .filter(|l| l.id > id)
                .take(count.unwrap_or(usize::MAX))
                .cloned()
                .collect(),
            None => {
                let count = count.unwrap_or(DEFAULT_TAIL);
                let skip = self.history.len().saturating_sub(count);
                self.history.iter().skip(skip).cloned().collect()
            }
        }
    }
}

/// CasparCG 로그 형식: `[2024-01-01 12:00:00.000] [warning] ...`
fn level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\[(?P<level>trace|debug|info|warning|warn|error|fatal)\]")
            .expect("static log level pattern is valid")
    })
}

/// Parse the log level from a server log line. Lines without a level tag
/// default to Info.
pub fn parse_log_level(line: &str) -> LogLevel {
    if let Some(caps) = level_pattern().captures(line) {
        if let Some(level_match) = caps.name("level") {
            return match level_match.as_str().to_ascii_lowercase().as_str() {
                "error" | "fatal" => LogLevel::Error,
                "warn" | "warning" => LogLevel::Warn,
                "debug" | "trace" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
        }
    }
    LogLevel::Info
}
