// src/extractor.rs
// Extractor: serial, per-process line-at-a-time pattern matching, batched
// persistence, and a data-driven configurable variant.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::broadcaster::Broadcaster;
use crate::errors::Result;
use crate::patterns::{self, PatternCatalog};
use crate::store::ExtractionStore;
use crate::training::TrainingLogger;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMatch {
    pub event_type: String,
    pub pattern_name: String,
    pub value: String,
    pub original_line: String,
    pub line_number: u64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionEvent {
    #[serde(flatten)]
    pub matched: ExtractedMatch,
    pub agent_name: String,
    pub session_id: String,
    pub risk_level: String,
    pub auto_confirmable: bool,
    pub language: Option<String>,
    pub content_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    pub content: String,
    pub digest: String,
    pub language: Option<String>,
    pub line_start: u64,
    pub line_end: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn derive_risk(m: &ExtractedMatch) -> String {
    if m.event_type == "error" {
        match m.metadata.get("severity").and_then(|v| v.as_str()) {
            Some("critical") | Some("error") => "high",
            Some("warning") => "medium",
            _ => "low",
        }
    } else {
        "low"
    }
    .to_string()
}

fn is_auto_confirmable(event_type: &str) -> bool {
    matches!(event_type, "metric" | "response")
}

pub struct Extractor {
    agent_name: String,
    session_id: String,
    line_counter: u64,
    in_code_block: bool,
    code_block_language: Option<String>,
    code_block_buffer: Vec<String>,
    match_history: Vec<ExtractedMatch>,
    batch: Vec<ExtractionEvent>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
    store: Option<Arc<dyn ExtractionStore>>,
    broadcaster: Option<Arc<Broadcaster>>,
}

impl Extractor {
    pub fn new(
        agent_name: &str,
        session_id: &str,
        broadcaster: Option<Arc<Broadcaster>>,
        store: Option<Arc<dyn ExtractionStore>>,
    ) -> Self {
        Extractor {
            agent_name: agent_name.to_string(),
            session_id: session_id.to_string(),
            line_counter: 0,
            in_code_block: false,
            code_block_language: None,
            code_block_buffer: Vec::new(),
            match_history: Vec::new(),
            batch: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            last_flush: Instant::now(),
            store,
            broadcaster,
        }
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_flush_interval(mut self, d: Duration) -> Self {
        self.flush_interval = d;
        self
    }

    pub fn line_count(&self) -> u64 {
        self.line_counter
    }

    pub fn match_count(&self) -> usize {
        self.match_history.len()
    }

    /// Process one line, returning the matches it produced.
    pub fn extract(&mut self, line: &str) -> Vec<ExtractedMatch> {
        self.line_counter += 1;
        if line.trim().is_empty() {
            return Vec::new();
        }

        let produced = if self.in_code_block {
            self.handle_inside_code_block(line)
        } else if let Some(lang) = patterns::matches_tagged_fence(line) {
            self.open_code_block(Some(lang))
        } else if patterns::matches_bare_fence(line) {
            self.open_code_block(None)
        } else {
            patterns::match_line(line)
                .map(|bm| {
                    vec![ExtractedMatch {
                        event_type: bm.event_type.to_string(),
                        pattern_name: bm.pattern_name,
                        value: bm.value,
                        original_line: line.to_string(),
                        line_number: self.line_counter,
                        timestamp: Utc::now(),
                        metadata: bm.metadata,
                    }]
                })
                .unwrap_or_default()
        };

        for m in &produced {
            self.match_history.push(m.clone());
            if let Some(b) = &self.broadcaster {
                b.emit_extraction(
                    &m.event_type,
                    &m.pattern_name,
                    &m.value,
                    &m.original_line,
                    m.line_number,
                    m.metadata.clone(),
                );
            }

            if m.pattern_name == "code_block_end" {
                if let Some(store) = &self.store {
                    let block = self.to_code_block(m);
                    if let Err(e) = store.upsert_code_block(&self.session_id, &block) {
                        tracing::warn!("code block persistence failed: {e}");
                    }
                }
            }

            let event = self.to_extraction_event(m);
            self.batch.push(event);
        }

        self.maybe_flush();
        produced
    }

    fn open_code_block(&mut self, language: Option<String>) -> Vec<ExtractedMatch> {
        self.in_code_block = true;
        self.code_block_language = language.clone();
        self.code_block_buffer.clear();

        let mut metadata = Map::new();
        if let Some(lang) = &language {
            metadata.insert("language".to_string(), Value::String(lang.clone()));
        }
        vec![ExtractedMatch {
            event_type: "code_block".to_string(),
            pattern_name: "code_block_start".to_string(),
            value: language.unwrap_or_default(),
            original_line: String::new(),
            line_number: self.line_counter,
            timestamp: Utc::now(),
            metadata,
        }]
    }

    fn handle_inside_code_block(&mut self, line: &str) -> Vec<ExtractedMatch> {
        if !patterns::matches_bare_fence(line) {
            self.code_block_buffer.push(line.to_string());
            return Vec::new();
        }

        let n = self.code_block_buffer.len() as u64;
        // The end-fence's own line number, reused as "line_start" — a
        // literal carry-over of the original's naming, not the real start.
        let line_start = self.line_counter;
        let line_end = line_start + n.saturating_sub(1);
        let value = self.code_block_buffer.join("\n");

        let mut metadata = Map::new();
        if let Some(lang) = &self.code_block_language {
            metadata.insert("language".to_string(), Value::String(lang.clone()));
        }
        metadata.insert("line_count".to_string(), Value::from(n));
        metadata.insert("line_start".to_string(), Value::from(line_start));
        metadata.insert("line_end".to_string(), Value::from(line_end));

        let m = ExtractedMatch {
            event_type: "code_block".to_string(),
            pattern_name: "code_block_end".to_string(),
            value,
            original_line: line.to_string(),
            line_number: self.line_counter,
            timestamp: Utc::now(),
            metadata,
        };

        self.in_code_block = false;
        self.code_block_language = None;
        self.code_block_buffer.clear();
        vec![m]
    }

    fn to_code_block(&self, m: &ExtractedMatch) -> CodeBlock {
        let language = m
            .metadata
            .get("language")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let line_start = m.metadata.get("line_start").and_then(|v| v.as_u64()).unwrap_or(0);
        let line_end = m.metadata.get("line_end").and_then(|v| v.as_u64()).unwrap_or(0);
        CodeBlock {
            content: m.value.clone(),
            digest: sha256_hex(m.value.as_bytes()),
            language,
            line_start,
            line_end,
        }
    }

    fn to_extraction_event(&self, m: &ExtractedMatch) -> ExtractionEvent {
        let risk_level = derive_risk(m);
        let auto_confirmable = is_auto_confirmable(&m.event_type);
        let (language, content_digest) = if m.pattern_name == "code_block_end" {
            let lang = m
                .metadata
                .get("language")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            (lang, Some(sha256_hex(m.value.as_bytes())))
        } else {
            (None, None)
        };

        ExtractionEvent {
            matched: m.clone(),
            agent_name: self.agent_name.clone(),
            session_id: self.session_id.clone(),
            risk_level,
            auto_confirmable,
            language,
            content_digest,
        }
    }

    fn maybe_flush(&mut self) {
        let due = self.batch.len() >= self.batch_size || self.last_flush.elapsed() >= self.flush_interval;
        if due {
            self.flush_batch();
        }
    }

    /// Explicit, atomic flush of the pending batch. A store failure is
    /// logged and the batch is discarded so streaming keeps going.
    pub fn flush_batch(&mut self) {
        if !self.batch.is_empty() {
            if let Some(store) = &self.store {
                if let Err(e) = store.append_batch(&self.batch) {
                    tracing::warn!("extraction batch flush failed, discarding batch: {e}");
                }
            }
            self.batch.clear();
        }
        self.last_flush = Instant::now();
    }

    /// Flush pending batches (errors are fatal here), then reset all state.
    pub fn clear(&mut self) -> Result<()> {
        if !self.batch.is_empty() {
            if let Some(store) = &self.store {
                store.append_batch(&self.batch)?;
            }
            self.batch.clear();
        }
        self.line_counter = 0;
        self.in_code_block = false;
        self.code_block_language = None;
        self.code_block_buffer.clear();
        self.match_history.clear();
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// A single data-driven extraction event produced by `ConfigurableExtractor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub event_type: String,
    pub pattern: String,
    pub matched: String,
    pub fields: HashMap<String, String>,
    pub metadata: Map<String, Value>,
}

/// Entirely data-driven extractor: patterns come from a `PatternCatalog`,
/// matches land in a bounded ring buffer, and (optionally) a training JSONL
/// stream and a structured training logger.
pub struct ConfigurableExtractor {
    agent_name: String,
    catalog: PatternCatalog,
    ring: VecDeque<ExtractedEvent>,
    ring_capacity: usize,
    event_counter: u64,
    training_file: Option<std::fs::File>,
    training_logger: Option<Arc<Mutex<TrainingLogger>>>,
}

impl ConfigurableExtractor {
    pub fn new(agent_name: &str, catalog: PatternCatalog) -> Result<Self> {
        let ring_capacity = catalog.settings.event_buffer_size;
        let training_file = if catalog.settings.enable_training
            && !catalog.settings.training_data_path.is_empty()
        {
            let dir = PathBuf::from(&catalog.settings.training_data_path);
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(format!(
                "{}-events-{}.jsonl",
                agent_name,
                Utc::now().format("%Y-%m-%d-%H-%M-%S")
            ));
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            )
        } else {
            None
        };

        Ok(ConfigurableExtractor {
            agent_name: agent_name.to_string(),
            catalog,
            ring: VecDeque::new(),
            ring_capacity,
            event_counter: 0,
            training_file,
            training_logger: None,
        })
    }

    pub fn attach_training_logger(&mut self, logger: Arc<Mutex<TrainingLogger>>) {
        self.training_logger = Some(logger);
    }

    pub fn reload_config(&mut self, catalog: PatternCatalog) {
        self.ring_capacity = catalog.settings.event_buffer_size;
        self.catalog = catalog;
    }

    pub fn ring(&self) -> &VecDeque<ExtractedEvent> {
        &self.ring
    }

    pub fn extract(&mut self, line: &str) -> Result<Vec<ExtractedEvent>> {
        let mut produced = Vec::new();

        for pattern in self.catalog.patterns() {
            let Some(caps) = pattern.regex.captures(line) else {
                continue;
            };

            let mut fields = HashMap::new();
            for (name, idx) in &pattern.field_map {
                if let Some(m) = caps.get(*idx) {
                    fields.insert(name.clone(), m.as_str().to_string());
                }
            }

            self.event_counter += 1;
            let mut metadata = pattern.metadata.clone();
            metadata.insert("pattern".to_string(), Value::String(pattern.name.clone()));
            metadata.insert("auto_confirm".to_string(), Value::Bool(pattern.auto_confirm));
            metadata.insert(
                "risk_level".to_string(),
                Value::String(pattern.risk_level.clone()),
            );

            let event = ExtractedEvent {
                id: format!("{}-event-{}", self.agent_name, self.event_counter),
                timestamp: Utc::now(),
                agent_name: self.agent_name.clone(),
                event_type: pattern.event_type.clone(),
                pattern: pattern.name.clone(),
                matched: line.to_string(),
                fields,
                metadata,
            };

            if self.ring.len() >= self.ring_capacity && self.ring_capacity > 0 {
                self.ring.pop_front();
            }
            self.ring.push_back(event.clone());

            if let Some(file) = &mut self.training_file {
                if let Ok(json) = serde_json::to_string(&event) {
                    let _ = writeln!(file, "{json}");
                }
            }
            if let Some(logger) = &self.training_logger {
                if let Ok(mut logger) = logger.lock() {
                    let _ = logger.log_event("tool_use", &event.event_type, &event.matched);
                }
            }

            produced.push(event);
        }

        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_code_block_scenario() {
        let mut ex = Extractor::new("agent-a", "agent-a-20260101-000000", None, None);
        let m1 = ex.extract("```python");
        assert_eq!(m1.len(), 1);
        assert_eq!(m1[0].pattern_name, "code_block_start");
        assert_eq!(m1[0].metadata["language"], "python");

        let m2 = ex.extract("def f(): return 1");
        assert!(m2.is_empty());

        let m3 = ex.extract("```");
        assert_eq!(m3.len(), 1);
        assert_eq!(m3[0].pattern_name, "code_block_end");
        assert_eq!(m3[0].value, "def f(): return 1");
        assert_eq!(m3[0].metadata["language"], "python");
        assert_eq!(m3[0].metadata["line_count"], 1);
    }

    #[test]
    fn s2_tokens_metric_scenario() {
        let mut ex = Extractor::new("agent-a", "sess", None, None);
        let matches = ex.extract("tokens used 1,377");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].event_type, "metric");
        assert_eq!(matches[0].pattern_name, "tokens_used");
        assert_eq!(matches[0].value, "1377");
    }

    #[test]
    fn empty_lines_produce_no_matches_but_advance_counter() {
        let mut ex = Extractor::new("agent-a", "sess", None, None);
        assert!(ex.extract("   ").is_empty());
        assert_eq!(ex.line_count(), 1);
    }

    #[test]
    fn error_risk_is_high() {
        let mut ex = Extractor::new("agent-a", "sess", None, None);
        let matches = ex.extract("ERROR: disk full");
        assert_eq!(matches.len(), 1);
        let event = ex.to_extraction_event(&matches[0]);
        assert_eq!(event.risk_level, "high");
        assert!(!event.auto_confirmable);
    }

    #[test]
    fn clear_resets_counters() {
        let mut ex = Extractor::new("agent-a", "sess", None, None);
        ex.extract("tokens used 5");
        ex.clear().unwrap();
        assert_eq!(ex.line_count(), 0);
        assert_eq!(ex.match_count(), 0);
    }
}
