// src/patterns.rs
// Pattern Set: built-in compiled patterns plus a JSON-loaded, priority-ordered
// catalog of configurable patterns.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{Result, SupervisorError};

pub const CODE_BLOCK_LANGUAGES: &[&str] = &[
    "python",
    "javascript",
    "go",
    "bash",
    "sql",
    "java",
    "rust",
    "typescript",
    "html",
    "css",
    "json",
    "yaml",
    "xml",
];

/// A single match produced by the built-in pattern set against one line.
#[derive(Debug, Clone)]
pub struct BuiltinMatch {
    pub event_type: &'static str,
    pub pattern_name: String,
    pub value: String,
    pub metadata: Map<String, Value>,
}

struct BuiltinPatterns {
    fence_tagged: Regex,
    fence_bare: Regex,
    error_severity: Regex,
    error_stack_frame: Regex,
    metric_tokens: Regex,
    metric_time: Regex,
    metric_memory: Regex,
    session_field: Regex,
    state_change: Regex,
    file_operation: Regex,
    interaction_marker: Regex,
}

fn builtins() -> &'static BuiltinPatterns {
    static CELL: OnceLock<BuiltinPatterns> = OnceLock::new();
    CELL.get_or_init(|| {
        let langs = CODE_BLOCK_LANGUAGES.join("|");
        BuiltinPatterns {
            fence_tagged: Regex::new(&format!(r"^```({langs})\s*$")).unwrap(),
            fence_bare: Regex::new(r"^```\s*$").unwrap(),
            error_severity: Regex::new(
                r"(?i)^\s*\[?(critical|error|warning)\]?[:\s]+(.*)$",
            )
            .unwrap(),
            error_stack_frame: Regex::new(r"^\s+at\s+\S+.*:\d+(:\d+)?\)?\s*$").unwrap(),
            metric_tokens: Regex::new(r"(?i)tokens\s+used[:\s]+([\d,]+)").unwrap(),
            metric_time: Regex::new(r"(?i)time\s+elapsed[:\s]+([\d.]+)\s*(ms|s)\b").unwrap(),
            metric_memory: Regex::new(
                r"(?i)memory[:\s]+([\d.]+)\s*(kb|mb|gb|bytes)\b",
            )
            .unwrap(),
            session_field: Regex::new(
                r"(?i)^(session id|workdir|model|provider|approval|sandbox|reasoning effort)[:\s]+(.+)$",
            )
            .unwrap(),
            state_change: Regex::new(r"(?i)^task\s+(started|completed|failed)\b").unwrap(),
            file_operation: Regex::new(
                r"(?i)^(created|modified|deleted|read)[:\s]+(.+)$",
            )
            .unwrap(),
            interaction_marker: Regex::new(r"(?i)^(user|codex|mcp startup)\b[:\s]*(.*)$")
                .unwrap(),
        }
    })
}

pub fn matches_tagged_fence(line: &str) -> Option<String> {
    builtins()
        .fence_tagged
        .captures(line)
        .map(|c| c[1].to_string())
}

pub fn matches_bare_fence(line: &str) -> bool {
    builtins().fence_bare.is_match(line)
}

/// Apply built-in patterns to a single line, outside code-block mode, in
/// priority order: error > metric > session > state_change > file_operation
/// > prompt/response (interaction markers).
pub fn match_line(line: &str) -> Option<BuiltinMatch> {
    let b = builtins();

    if let Some(c) = b.error_severity.captures(line) {
        let severity = c[1].to_lowercase();
        let mut metadata = Map::new();
        metadata.insert("severity".to_string(), Value::String(severity));
        return Some(BuiltinMatch {
            event_type: "error",
            pattern_name: "error_severity".to_string(),
            value: c[2].trim().to_string(),
            metadata,
        });
    }
    if b.error_stack_frame.is_match(line) {
        let mut metadata = Map::new();
        metadata.insert("severity".to_string(), Value::String("error".to_string()));
        return Some(BuiltinMatch {
            event_type: "error",
            pattern_name: "stack_frame".to_string(),
            value: line.trim().to_string(),
            metadata,
        });
    }

    if let Some(c) = b.metric_tokens.captures(line) {
        let mut metadata = Map::new();
        metadata.insert("unit".to_string(), Value::String("tokens".to_string()));
        return Some(BuiltinMatch {
            event_type: "metric",
            pattern_name: "tokens_used".to_string(),
            value: c[1].replace(',', ""),
            metadata,
        });
    }
    if let Some(c) = b.metric_time.captures(line) {
        let mut metadata = Map::new();
        metadata.insert("unit".to_string(), Value::String(c[2].to_lowercase()));
        return Some(BuiltinMatch {
            event_type: "metric",
            pattern_name: "time_elapsed".to_string(),
            value: c[1].to_string(),
            metadata,
        });
    }
    if let Some(c) = b.metric_memory.captures(line) {
        let mut metadata = Map::new();
        metadata.insert(
            "unit".to_string(),
            Value::String(c[2].to_uppercase()),
        );
        return Some(BuiltinMatch {
            event_type: "metric",
            pattern_name: "memory".to_string(),
            value: c[1].to_string(),
            metadata,
        });
    }

    if let Some(c) = b.session_field.captures(line) {
        let field = c[1].to_lowercase().replace(' ', "_");
        let mut metadata = Map::new();
        metadata.insert("field".to_string(), Value::String(field.clone()));
        return Some(BuiltinMatch {
            event_type: "session",
            pattern_name: field,
            value: c[2].trim().to_string(),
            metadata,
        });
    }

    if let Some(c) = b.state_change.captures(line) {
        let state = c[1].to_lowercase();
        let mut metadata = Map::new();
        metadata.insert("state".to_string(), Value::String(state.clone()));
        return Some(BuiltinMatch {
            event_type: "state_change",
            pattern_name: format!("task_{state}"),
            value: state,
            metadata,
        });
    }

    if let Some(c) = b.file_operation.captures(line) {
        let op = c[1].to_lowercase();
        let mut metadata = Map::new();
        metadata.insert("operation".to_string(), Value::String(op.clone()));
        return Some(BuiltinMatch {
            event_type: "file_operation",
            pattern_name: op,
            value: c[2].trim().to_string(),
            metadata,
        });
    }

    if let Some(c) = b.interaction_marker.captures(line) {
        let marker = c[1].to_lowercase();
        let event_type = if marker == "user" { "prompt" } else { "response" };
        return Some(BuiltinMatch {
            event_type,
            pattern_name: marker,
            value: c[2].trim().to_string(),
            metadata: Map::new(),
        });
    }

    None
}

/// On-disk shape of one configurable pattern, before regex compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    pub event_type: String,
    pub regex: String,
    pub field_map: HashMap<String, usize>,
    pub priority: i32,
    #[serde(default)]
    pub auto_confirm: bool,
    pub risk_level: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default)]
    pub enable_training: bool,
    #[serde(default)]
    pub training_data_path: String,
}

fn default_buffer_size() -> usize {
    4096
}

fn default_event_buffer_size() -> usize {
    1000
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    settings: CatalogSettings,
    patterns: Vec<PatternSpec>,
}

/// A compiled configurable pattern, ready for matching.
pub struct ConfigurablePattern {
    pub name: String,
    pub event_type: String,
    pub regex: Regex,
    pub field_map: HashMap<String, usize>,
    pub priority: i32,
    pub auto_confirm: bool,
    pub risk_level: String,
    pub metadata: Map<String, Value>,
}

/// Ordered (descending priority) set of configurable patterns, loaded from
/// and saved back to a JSON document.
pub struct PatternCatalog {
    pub settings: CatalogSettings,
    patterns: Vec<ConfigurablePattern>,
}

impl PatternCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&raw)?;

        let mut patterns = Vec::with_capacity(file.patterns.len());
        for spec in file.patterns {
            patterns.push(Self::compile(spec)?);
        }
        patterns.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self::check_unique_names(&patterns)?;

        Ok(PatternCatalog {
            settings: file.settings,
            patterns,
        })
    }

    fn compile(spec: PatternSpec) -> Result<ConfigurablePattern> {
        let regex = Regex::new(&spec.regex)?;
        Ok(ConfigurablePattern {
            name: spec.name,
            event_type: spec.event_type,
            regex,
            field_map: spec.field_map,
            priority: spec.priority,
            auto_confirm: spec.auto_confirm,
            risk_level: spec.risk_level,
            metadata: spec.metadata,
        })
    }

    fn check_unique_names(patterns: &[ConfigurablePattern]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for p in patterns {
            if !seen.insert(&p.name) {
                return Err(SupervisorError::ConfigError(format!(
                    "duplicate pattern name: {}",
                    p.name
                )));
            }
        }
        Ok(())
    }

    pub fn patterns(&self) -> &[ConfigurablePattern] {
        &self.patterns
    }

    pub fn add_pattern(&mut self, spec: PatternSpec) -> Result<()> {
        if self.patterns.iter().any(|p| p.name == spec.name) {
            return Err(SupervisorError::ConfigError(format!(
                "pattern '{}' already exists",
                spec.name
            )));
        }
        let compiled = Self::compile(spec)?;
        let insert_at = self
            .patterns
            .iter()
            .position(|p| p.priority < compiled.priority)
            .unwrap_or(self.patterns.len());
        self.patterns.insert(insert_at, compiled);
        Ok(())
    }

    pub fn remove_pattern(&mut self, name: &str) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p.name != name);
        self.patterns.len() != before
    }

    /// Write the catalog atomically: write to `<path>.backup`, rename the
    /// original away, write the new file, remove the backup on success; on
    /// failure restore the backup.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = CatalogFile {
            version: 1,
            settings: self.settings.clone(),
            patterns: self
                .patterns
                .iter()
                .map(|p| PatternSpec {
                    name: p.name.clone(),
                    event_type: p.event_type.clone(),
                    regex: p.regex.as_str().to_string(),
                    field_map: p.field_map.clone(),
                    priority: p.priority,
                    auto_confirm: p.auto_confirm,
                    risk_level: p.risk_level.clone(),
                    metadata: p.metadata.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let backup = path.with_extension("json.backup");
        let had_original = path.exists();
        if had_original {
            fs::rename(path, &backup)?;
        }

        match fs::write(path, json) {
            Ok(()) => {
                if had_original {
                    let _ = fs::remove_file(&backup);
                }
                Ok(())
            }
            Err(e) => {
                if had_original {
                    let _ = fs::rename(&backup, path);
                }
                Err(SupervisorError::IoError(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tokens_used_metric_s2() {
        let m = match_line("tokens used 1,377").unwrap();
        assert_eq!(m.event_type, "metric");
        assert_eq!(m.pattern_name, "tokens_used");
        assert_eq!(m.value, "1377");
        assert_eq!(m.metadata["unit"], "tokens");
    }

    #[test]
    fn error_severity_prefix() {
        let m = match_line("ERROR: disk full").unwrap();
        assert_eq!(m.event_type, "error");
        assert_eq!(m.value, "disk full");
    }

    #[test]
    fn tagged_fence_detects_language() {
        assert_eq!(matches_tagged_fence("```python"), Some("python".to_string()));
        assert_eq!(matches_tagged_fence("```nope"), None);
        assert!(matches_bare_fence("```"));
    }

    #[test]
    fn priority_sorted_descending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let doc = serde_json::json!({
            "version": 1,
            "settings": {"buffer_size": 4096, "event_buffer_size": 1000, "enable_training": false, "training_data_path": ""},
            "patterns": [
                {"name": "low", "event_type": "custom", "regex": "X", "field_map": {}, "priority": 10, "auto_confirm": false, "risk_level": "low"},
                {"name": "high", "event_type": "custom", "regex": "X", "field_map": {}, "priority": 100, "auto_confirm": false, "risk_level": "low"}
            ]
        });
        fs::write(&path, doc.to_string()).unwrap();

        let catalog = PatternCatalog::load(&path).unwrap();
        assert_eq!(catalog.patterns()[0].name, "high");
        assert_eq!(catalog.patterns()[1].name, "low");
    }

    #[test]
    fn duplicate_names_rejected_on_add() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let doc = serde_json::json!({
            "version": 1,
            "settings": {"buffer_size": 4096, "event_buffer_size": 1000, "enable_training": false, "training_data_path": ""},
            "patterns": []
        });
        fs::write(&path, doc.to_string()).unwrap();
        let mut catalog = PatternCatalog::load(&path).unwrap();

        let spec = PatternSpec {
            name: "dup".to_string(),
            event_type: "custom".to_string(),
            regex: "X".to_string(),
            field_map: HashMap::new(),
            priority: 1,
            auto_confirm: false,
            risk_level: "low".to_string(),
            metadata: Map::new(),
        };
        catalog.add_pattern(spec.clone()).unwrap();
        assert!(catalog.add_pattern(spec).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let doc = serde_json::json!({
            "version": 1,
            "settings": {"buffer_size": 4096, "event_buffer_size": 1000, "enable_training": false, "training_data_path": ""},
            "patterns": []
        });
        fs::write(&path, doc.to_string()).unwrap();
        let mut catalog = PatternCatalog::load(&path).unwrap();
        catalog
            .add_pattern(PatternSpec {
                name: "p1".to_string(),
                event_type: "custom".to_string(),
                regex: "abc".to_string(),
                field_map: HashMap::new(),
                priority: 5,
                auto_confirm: true,
                risk_level: "medium".to_string(),
                metadata: Map::new(),
            })
            .unwrap();
        catalog.save(&path).unwrap();

        let reloaded = PatternCatalog::load(&path).unwrap();
        assert_eq!(reloaded.patterns().len(), 1);
        assert_eq!(reloaded.patterns()[0].name, "p1");
    }
}
