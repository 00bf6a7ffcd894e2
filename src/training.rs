// src/training.rs
// Training/Session Loggers: structured JSONL records of tool use and
// decisions for a single supervised session.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::errors::Result;

#[derive(Debug, Clone, Serialize)]
struct ToolUse {
    tool: String,
    detail: String,
    timestamp: DateTime<Utc>,
}

struct ToolSequence {
    id: String,
    goal: String,
    started_at: DateTime<Utc>,
    tool_uses: Vec<ToolUse>,
}

pub struct TrainingLogger {
    agent: String,
    session_id: String,
    events_file: File,
    sequences_file: File,
    decisions_file: File,
    event_counter: u64,
    seq_counter: u64,
    dec_counter: u64,
    active_sequence: Option<ToolSequence>,
    closed: bool,
}

impl TrainingLogger {
    pub fn new(agent: &str, session_id: &str, out: &Path) -> Result<Self> {
        let dir = out.join("training_data").join(agent);
        fs::create_dir_all(&dir)?;
        let ts = Utc::now().format("%Y-%m-%d-%H-%M-%S");

        let open = |name: &str| -> Result<File> {
            Ok(OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{ts}-{name}.jsonl")))?)
        };

        Ok(TrainingLogger {
            agent: agent.to_string(),
            session_id: session_id.to_string(),
            events_file: open("events")?,
            sequences_file: open("sequences")?,
            decisions_file: open("decisions")?,
            event_counter: 0,
            seq_counter: 0,
            dec_counter: 0,
            active_sequence: None,
            closed: false,
        })
    }

    pub fn log_event(&mut self, kind: &str, event_type: &str, detail: &str) -> Result<()> {
        self.event_counter += 1;
        let record = json!({
            "id": format!("{}-{}", self.session_id, self.event_counter),
            "agent": self.agent,
            "kind": kind,
            "event_type": event_type,
            "detail": detail,
            "timestamp": Utc::now().to_rfc3339(),
        });
        writeln!(self.events_file, "{record}")?;
        Ok(())
    }

    pub fn start_tool_sequence(&mut self, goal: &str) {
        self.seq_counter += 1;
        self.active_sequence = Some(ToolSequence {
            id: format!("{}-seq-{}", self.session_id, self.seq_counter),
            goal: goal.to_string(),
            started_at: Utc::now(),
            tool_uses: Vec::new(),
        });
    }

    pub fn log_tool_use(&mut self, tool: &str, detail: &str) {
        if self.active_sequence.is_none() {
            self.start_tool_sequence("unspecified");
        }
        if let Some(seq) = &mut self.active_sequence {
            seq.tool_uses.push(ToolUse {
                tool: tool.to_string(),
                detail: detail.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    pub fn end_tool_sequence(&mut self, success: bool) -> Result<()> {
        if let Some(seq) = self.active_sequence.take() {
            let record = json!({
                "id": seq.id,
                "agent": self.agent,
                "goal": seq.goal,
                "started_at": seq.started_at.to_rfc3339(),
                "ended_at": Utc::now().to_rfc3339(),
                "success": success,
                "tool_uses": seq.tool_uses,
            });
            writeln!(self.sequences_file, "{record}")?;
        }
        Ok(())
    }

    pub fn log_decision(&mut self, decision: &str, rationale: &str) -> Result<()> {
        self.dec_counter += 1;
        let record = json!({
            "id": format!("{}-dec-{}", self.session_id, self.dec_counter),
            "agent": self.agent,
            "decision": decision,
            "rationale": rationale,
            "timestamp": Utc::now().to_rfc3339(),
        });
        writeln!(self.decisions_file, "{record}")?;
        self.log_event("decision", decision, rationale)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.active_sequence.is_some() {
            self.end_tool_sequence(false)?;
        }
        self.events_file.flush()?;
        self.sequences_file.flush()?;
        self.decisions_file.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for TrainingLogger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn logs_events_decisions_and_sequences() {
        let dir = tempdir().unwrap();
        let mut logger = TrainingLogger::new("agent-a", "agent-a-sess", dir.path()).unwrap();

        logger.log_event("tool_use", "read_file", "src/main.rs").unwrap();
        logger.start_tool_sequence("fix bug");
        logger.log_tool_use("read_file", "src/lib.rs");
        logger.log_tool_use("edit_file", "src/lib.rs");
        logger.end_tool_sequence(true).unwrap();
        logger.log_decision("use regex", "simplest fit").unwrap();
        logger.close().unwrap();

        let training_dir = dir.path().join("training_data").join("agent-a");
        let mut found_events = false;
        let mut found_sequences = false;
        let mut found_decisions = false;
        for entry in fs::read_dir(&training_dir).unwrap() {
            let name = entry.unwrap().file_name().into_string().unwrap();
            if name.ends_with("-events.jsonl") {
                found_events = true;
            }
            if name.ends_with("-sequences.jsonl") {
                found_sequences = true;
            }
            if name.ends_with("-decisions.jsonl") {
                found_decisions = true;
            }
        }
        assert!(found_events && found_sequences && found_decisions);
    }

    #[test]
    fn close_finalizes_open_sequence() {
        let dir = tempdir().unwrap();
        let mut logger = TrainingLogger::new("agent-b", "agent-b-sess", dir.path()).unwrap();
        logger.start_tool_sequence("explore");
        logger.log_tool_use("ls", ".");
        logger.close().unwrap();
        assert!(logger.active_sequence.is_none());
    }
}
