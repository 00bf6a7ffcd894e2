// src/store.rs
// Narrow synchronous persistence seams. Deliberately not a
// repository/ORM layer: two traits, one JSONL-backed reference
// implementation each.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::errors::Result;
use crate::extractor::{CodeBlock, ExtractionEvent};

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_lines: u64,
    pub total_extractions: u64,
    pub total_feedback: u64,
}

pub trait SessionStore: Send + Sync {
    fn session_start(&self, session_id: &str, agent: &str, environment: &str) -> Result<()>;
    fn session_state_change(&self, session_id: &str, state: &str) -> Result<()>;
    fn session_complete(&self, session_id: &str, stats: &SessionStats) -> Result<()>;
}

pub trait ExtractionStore: Send + Sync {
    fn append_batch(&self, events: &[ExtractionEvent]) -> Result<()>;
    fn upsert_code_block(&self, session_id: &str, block: &CodeBlock) -> Result<()>;
}

fn append_line(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(value)?)?;
    Ok(())
}

/// Reference `SessionStore`: appends one JSON line per lifecycle event to
/// `<data_root>/sessions.jsonl`.
pub struct FileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(data_root: &Path) -> Self {
        FileSessionStore {
            path: data_root.join("sessions.jsonl"),
            lock: Mutex::new(()),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn session_start(&self, session_id: &str, agent: &str, environment: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        append_line(
            &self.path,
            &json!({
                "kind": "session_start",
                "session_id": session_id,
                "agent": agent,
                "environment": environment,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }

    fn session_state_change(&self, session_id: &str, state: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        append_line(
            &self.path,
            &json!({
                "kind": "session_state_change",
                "session_id": session_id,
                "state": state,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }

    fn session_complete(&self, session_id: &str, stats: &SessionStats) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        append_line(
            &self.path,
            &json!({
                "kind": "session_complete",
                "session_id": session_id,
                "stats": stats,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }
}

/// Reference `ExtractionStore`: appends extraction batches FIFO to
/// `<data_root>/extractions.jsonl` and code blocks (deduplicated by digest
/// within a run) to `<data_root>/code_blocks.jsonl`.
pub struct FileExtractionStore {
    extractions_path: PathBuf,
    code_blocks_path: PathBuf,
    lock: Mutex<std::collections::HashSet<String>>,
}

impl FileExtractionStore {
    pub fn new(data_root: &Path) -> Self {
        FileExtractionStore {
            extractions_path: data_root.join("extractions.jsonl"),
            code_blocks_path: data_root.join("code_blocks.jsonl"),
            lock: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

impl ExtractionStore for FileExtractionStore {
    fn append_batch(&self, events: &[ExtractionEvent]) -> Result<()> {
        if let Some(parent) = self.extractions_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.extractions_path)?;
        for event in events {
            writeln!(file, "{}", serde_json::to_string(event)?)?;
        }
        Ok(())
    }

    fn upsert_code_block(&self, session_id: &str, block: &CodeBlock) -> Result<()> {
        let mut seen = self.lock.lock().unwrap();
        if !seen.insert(block.digest.clone()) {
            return Ok(());
        }
        append_line(
            &self.code_blocks_path,
            &json!({
                "session_id": session_id,
                "digest": block.digest,
                "language": block.language,
                "line_start": block.line_start,
                "line_end": block.line_end,
                "content": block.content,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn code_block_upsert_deduplicates_by_digest() {
        let dir = tempdir().unwrap();
        let store = FileExtractionStore::new(dir.path());
        let block = CodeBlock {
            content: "x = 1".to_string(),
            digest: "abc123".to_string(),
            language: Some("python".to_string()),
            line_start: 1,
            line_end: 1,
        };
        store.upsert_code_block("sess-1", &block).unwrap();
        store.upsert_code_block("sess-1", &block).unwrap();

        let contents = fs::read_to_string(dir.path().join("code_blocks.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn session_events_append_fifo() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.session_start("s1", "agent", "dev").unwrap();
        store.session_state_change("s1", "paused").unwrap();
        store
            .session_complete(
                "s1",
                &SessionStats {
                    total_lines: 10,
                    total_extractions: 2,
                    total_feedback: 0,
                },
            )
            .unwrap();

        let contents = fs::read_to_string(dir.path().join("sessions.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("session_start"));
        assert!(lines[1].contains("session_state_change"));
        assert!(lines[2].contains("session_complete"));
    }
}
