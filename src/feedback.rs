// src/feedback.rs
// Feedback Tracker: append-only JSONL outcome log plus in-memory stats.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub id: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub agent_name: String,
    pub environment: String,
    pub task_type: String,
    pub action: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error_msg: Option<String>,
    pub context: Option<String>,
    pub pattern: Option<String>,
    pub risk_level: Option<String>,
    pub was_blocked: bool,
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternStat {
    pub count: u64,
    pub mean_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub total: u64,
    pub success_rate: f64,
    pub by_task_type: HashMap<String, u64>,
    pub by_environment: HashMap<String, u64>,
    pub top_errors: HashMap<String, u64>,
    pub top_success_patterns: HashMap<String, PatternStat>,
    pub blocked: Vec<FeedbackOutcome>,
}

pub struct FeedbackTracker {
    agent_name: String,
    environment: String,
    file: File,
    counter: u64,
    outcomes: Vec<FeedbackOutcome>,
}

impl FeedbackTracker {
    pub fn new(data_path: &Path, agent_name: &str, environment: &str) -> Result<Self> {
        std::fs::create_dir_all(data_path)?;
        let path = data_path.join(format!(
            "{}-{}-feedback-{}.jsonl",
            agent_name,
            environment,
            Utc::now().format("%Y-%m-%d-%H-%M-%S")
        ));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(FeedbackTracker {
            agent_name: agent_name.to_string(),
            environment: environment.to_string(),
            file,
            counter: 0,
            outcomes: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_outcome(
        &mut self,
        task_type: &str,
        action: &str,
        success: bool,
        duration_ms: u64,
        error_msg: Option<String>,
        context: Option<String>,
        pattern: Option<String>,
        risk_level: Option<String>,
        was_blocked: bool,
        block_reason: Option<String>,
    ) -> Result<FeedbackOutcome> {
        self.counter += 1;
        let outcome = FeedbackOutcome {
            id: format!("{}-{}", self.agent_name, self.counter),
            timestamp: Utc::now(),
            agent_name: self.agent_name.clone(),
            environment: self.environment.clone(),
            task_type: task_type.to_string(),
            action: action.to_string(),
            success,
            duration_ms,
            error_msg,
            context,
            pattern,
            risk_level,
            was_blocked,
            block_reason,
        };

        writeln!(self.file, "{}", serde_json::to_string(&outcome)?)?;
        self.outcomes.push(outcome.clone());
        Ok(outcome)
    }

    pub fn record_success(
        &mut self,
        task_type: &str,
        action: &str,
        pattern: Option<&str>,
        duration_ms: u64,
        context: Option<&str>,
    ) -> Result<FeedbackOutcome> {
        self.record_outcome(
            task_type,
            action,
            true,
            duration_ms,
            None,
            context.map(String::from),
            pattern.map(String::from),
            None,
            false,
            None,
        )
    }

    pub fn record_failure(
        &mut self,
        task_type: &str,
        action: &str,
        error_msg: &str,
        duration_ms: u64,
        context: Option<&str>,
    ) -> Result<FeedbackOutcome> {
        self.record_outcome(
            task_type,
            action,
            false,
            duration_ms,
            Some(error_msg.to_string()),
            context.map(String::from),
            None,
            None,
            false,
            None,
        )
    }

    pub fn record_blocked(
        &mut self,
        action: &str,
        reason: &str,
        risk_level: &str,
    ) -> Result<FeedbackOutcome> {
        self.record_outcome(
            "constraint_check",
            action,
            false,
            0,
            None,
            None,
            None,
            Some(risk_level.to_string()),
            true,
            Some(reason.to_string()),
        )
    }

    pub fn get_stats(&self) -> FeedbackStats {
        let total = self.outcomes.len() as u64;
        let successes = self.outcomes.iter().filter(|o| o.success).count() as u64;
        let success_rate = if total == 0 {
            0.0
        } else {
            (successes as f64 / total as f64) * 100.0
        };

        let mut by_task_type = HashMap::new();
        let mut by_environment = HashMap::new();
        let mut top_errors = HashMap::new();
        let mut pattern_totals: HashMap<String, (u64, u64)> = HashMap::new();
        let mut blocked = Vec::new();

        for o in &self.outcomes {
            *by_task_type.entry(o.task_type.clone()).or_insert(0) += 1;
            *by_environment.entry(o.environment.clone()).or_insert(0) += 1;

            if let Some(err) = &o.error_msg {
                *top_errors.entry(err.clone()).or_insert(0) += 1;
            }
            if o.success {
                if let Some(pattern) = &o.pattern {
                    let entry = pattern_totals.entry(pattern.clone()).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 += o.duration_ms;
                }
            }
            if o.was_blocked {
                blocked.push(o.clone());
            }
        }

        let top_success_patterns = pattern_totals
            .into_iter()
            .map(|(k, (count, total_duration))| {
                (
                    k,
                    PatternStat {
                        count,
                        mean_duration_ms: total_duration as f64 / count as f64,
                    },
                )
            })
            .collect();

        FeedbackStats {
            total,
            success_rate,
            by_task_type,
            by_environment,
            top_errors,
            top_success_patterns,
            blocked,
        }
    }

    pub fn generate_report(&self) -> String {
        let stats = self.get_stats();
        let mut report = String::new();
        report.push_str(&format!(
            "Feedback report for {} ({})\n",
            self.agent_name, self.environment
        ));
        report.push_str(&format!(
            "  total: {}  success_rate: {:.1}%\n",
            stats.total, stats.success_rate
        ));
        report.push_str(&format!("  blocked: {}\n", stats.blocked.len()));

        let mut task_types: Vec<_> = stats.by_task_type.iter().collect();
        task_types.sort_by_key(|(k, _)| (*k).clone());
        for (task_type, count) in task_types {
            report.push_str(&format!("  task_type[{task_type}]: {count}\n"));
        }

        let mut errors: Vec<_> = stats.top_errors.iter().collect();
        errors.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (err, count) in errors.into_iter().take(5) {
            report.push_str(&format!("  error[{err}]: {count}\n"));
        }

        report
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_and_persists_outcomes() {
        let dir = tempdir().unwrap();
        let mut tracker = FeedbackTracker::new(dir.path(), "agent-a", "dev").unwrap();
        tracker
            .record_success("build", "compile", Some("cargo_build"), 1200, None)
            .unwrap();
        tracker
            .record_failure("build", "compile", "linker error", 900, None)
            .unwrap();
        tracker.record_blocked("write", "read-only path", "high").unwrap();

        let stats = tracker.get_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.blocked.len(), 1);
        assert!(stats.success_rate > 0.0 && stats.success_rate < 100.0);
    }

    #[test]
    fn generate_report_is_deterministic_for_same_outcomes() {
        let dir = tempdir().unwrap();
        let mut tracker = FeedbackTracker::new(dir.path(), "agent-a", "dev").unwrap();
        tracker
            .record_success("build", "compile", Some("p"), 100, None)
            .unwrap();
        let a = tracker.generate_report();
        let b = tracker.generate_report();
        assert_eq!(a, b);
    }
}
