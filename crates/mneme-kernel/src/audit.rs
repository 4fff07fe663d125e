//! [`AuditLog`] – bounded record of security-relevant events.
//!
//! Entries are kept in an in-memory ring (oldest dropped first) and, when a
//! sink path is configured, appended to a JSON-lines file. Every entry is
//! also mirrored to `tracing` at the matching level. A failing sink never
//! fails the caller; the write error is logged and the entry stays in memory.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::KernelError;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
    Critical,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authorization,
    DataAccess,
    DataModification,
    SystemChange,
    SecurityEvent,
    UserAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub category: AuditCategory,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Counts over the entries currently held in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub total_events: usize,
    pub security_events: usize,
    pub by_level: BTreeMap<AuditLevel, usize>,
    /// Up to ten most recent `Security` / `Critical` entries, newest last.
    pub recent_security: Vec<AuditEntry>,
}

pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AuditLog {
    /// In-memory log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            sink: None,
        }
    }

    /// Also append every entry to the JSON-lines file at `path`.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.sink = Some((path.to_path_buf(), Mutex::new(file)));
        Ok(self)
    }

    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(p, _)| p.as_path())
    }

    pub fn record(
        &self,
        level: AuditLevel,
        category: AuditCategory,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            level,
            category,
            message: message.into(),
            metadata,
        };

        match level {
            AuditLevel::Info => info!(category = ?category, "{}", entry.message),
            AuditLevel::Warning => warn!(category = ?category, "{}", entry.message),
            AuditLevel::Error | AuditLevel::Critical | AuditLevel::Security => {
                error!(category = ?category, level = ?level, "{}", entry.message)
            }
        }

        if let Some((path, file)) = &self.sink {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::from)
                .and_then(|line| {
                    let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                    writeln!(file, "{line}")
                });
            if let Err(e) = written {
                warn!(path = %path.display(), error = %e, "audit sink write failed");
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Shorthand for a `Security`-level `SecurityEvent`.
    pub fn security(
        &self,
        event_type: &str,
        description: impl Into<String>,
        mut metadata: Map<String, Value>,
    ) {
        metadata.insert("event_type".into(), Value::String(event_type.to_string()));
        self.record(
            AuditLevel::Security,
            AuditCategory::SecurityEvent,
            format!("security event: {event_type} - {}", description.into()),
            metadata,
        );
    }

    /// Matching entries, oldest first, at most the `limit` most recent.
    pub fn entries(
        &self,
        level: Option<AuditLevel>,
        category: Option<AuditCategory>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&AuditEntry> = entries
            .iter()
            .filter(|e| level.is_none_or(|l| e.level == l))
            .filter(|e| category.is_none_or(|c| e.category == c))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn security_summary(&self) -> SecuritySummary {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut by_level = BTreeMap::new();
        for e in entries.iter() {
            *by_level.entry(e.level).or_insert(0) += 1;
        }
        let serious: Vec<&AuditEntry> = entries
            .iter()
            .filter(|e| matches!(e.level, AuditLevel::Security | AuditLevel::Critical))
            .collect();
        let recent_security = serious[serious.len().saturating_sub(10)..]
            .iter()
            .map(|e| (*e).clone())
            .collect();
        SecuritySummary {
            total_events: entries.len(),
            security_events: serious.len(),
            by_level,
            recent_security,
        }
    }
}

/// Build entry metadata from string pairs.
pub fn meta<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest_entries() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(
                AuditLevel::Info,
                AuditCategory::UserAction,
                format!("event {i}"),
                Map::new(),
            );
        }
        let entries = log.entries(None, None, 100);
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
    }

    #[test]
    fn entries_filter_and_limit() {
        let log = AuditLog::default();
        log.record(AuditLevel::Info, AuditCategory::UserAction, "a", Map::new());
        log.security("validation_failed", "b", Map::new());
        log.security("validation_failed", "c", Map::new());
        log.record(AuditLevel::Warning, AuditCategory::Authorization, "d", Map::new());

        assert_eq!(log.entries(Some(AuditLevel::Security), None, 100).len(), 2);
        assert_eq!(log.entries(None, Some(AuditCategory::Authorization), 100).len(), 1);
        let last = log.entries(Some(AuditLevel::Security), None, 1);
        assert_eq!(last.len(), 1);
        assert!(last[0].message.ends_with("- c"));
        assert_eq!(last[0].metadata["event_type"], json!("validation_failed"));
    }

    #[test]
    fn summary_counts_levels() {
        let log = AuditLog::default();
        log.record(AuditLevel::Info, AuditCategory::UserAction, "ok", Map::new());
        for i in 0..12 {
            log.security("rate_limited", format!("#{i}"), Map::new());
        }
        let summary = log.security_summary();
        assert_eq!(summary.total_events, 13);
        assert_eq!(summary.security_events, 12);
        assert_eq!(summary.by_level[&AuditLevel::Info], 1);
        assert_eq!(summary.recent_security.len(), 10);
        assert!(summary.recent_security[9].message.ends_with("#11"));
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let log = AuditLog::default().with_file(&path).unwrap();
        log.record(
            AuditLevel::Warning,
            AuditCategory::DataModification,
            "patched",
            meta([("id", json!("obs_1"))]),
        );
        log.security("xss", "blocked", Map::new());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].metadata["id"], json!("obs_1"));
        assert_eq!(lines[1].level, AuditLevel::Security);
        assert_eq!(log.sink_path(), Some(path.as_path()));
    }
}
