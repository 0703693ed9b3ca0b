//! Context entries: persisted, scored units of experience

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of experience an entry captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEntryType {
    /// A workflow strategy that worked
    Strategy,
    /// Domain knowledge
    Knowledge,
    /// A workflow pattern that failed
    ErrorPattern,
    /// Tool best practice or prompt optimisation
    ToolUsage,
}

/// Where an entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Distilled automatically from a trace
    #[default]
    Auto,
    /// Promoted from user-marked memory
    UserMemory,
    /// Extracted from negative quality feedback
    QualityFeedback,
}

/// Scoring and provenance metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Creation timestamp (RFC3339)
    pub created_at: String,
    /// Last retrieval or reuse timestamp
    pub last_used: String,
    /// Times the entry was marked useful
    #[serde(default)]
    pub useful_count: i64,
    /// Times the entry was marked harmful
    #[serde(default)]
    pub harmful_count: i64,
    /// `useful_count - harmful_count`, kept persisted for retrieval sorting
    #[serde(default)]
    pub score: i64,
    /// Tools this entry is about
    #[serde(default)]
    pub related_tools: Vec<String>,
    /// Task classes this entry applies to
    #[serde(default)]
    pub related_tasks: Vec<String>,
    /// Provenance
    #[serde(default)]
    pub source: EntrySource,
    /// Optimised prompt a quality-feedback entry carries for injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_prompt: Option<String>,
}

impl EntryMetadata {
    fn now(source: EntrySource) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            created_at: now.clone(),
            last_used: now,
            useful_count: 0,
            harmful_count: 0,
            score: 0,
            related_tools: Vec::new(),
            related_tasks: Vec::new(),
            source,
            optimized_prompt: None,
        }
    }
}

/// One concrete example backing an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryExample {
    /// The task that produced the example
    pub task: String,
    /// Outcome: success, failure, quality_issue
    pub result: String,
    /// Why it went that way
    pub reasoning: String,
    /// When it happened
    pub timestamp: String,
}

/// A reusable unit of experience tied to a task class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Unique id
    pub entry_id: String,
    /// Entry kind
    #[serde(rename = "type")]
    pub entry_type: ContextEntryType,
    /// Free-form structured content
    pub content: String,
    /// Scoring and provenance
    pub metadata: EntryMetadata,
    /// Concrete examples
    #[serde(default)]
    pub examples: Vec<EntryExample>,
}

impl ContextEntry {
    /// Create an entry with fresh metadata
    #[must_use]
    pub fn new(entry_type: ContextEntryType, content: impl Into<String>) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            entry_type,
            content: content.into(),
            metadata: EntryMetadata::now(EntrySource::Auto),
            examples: Vec::new(),
        }
    }

    /// Set the provenance
    #[must_use]
    pub fn with_source(mut self, source: EntrySource) -> Self {
        self.metadata.source = source;
        self
    }

    /// Seed the counters; failures start at -1, successes at +1
    #[must_use]
    pub fn with_initial_counts(mut self, useful: i64, harmful: i64) -> Self {
        self.metadata.useful_count = useful;
        self.metadata.harmful_count = harmful;
        self.metadata.score = useful - harmful;
        self
    }

    /// Attach a related tool
    #[must_use]
    pub fn with_related_tool(mut self, tool: impl Into<String>) -> Self {
        let tool = tool.into();
        if !self.metadata.related_tools.contains(&tool) {
            self.metadata.related_tools.push(tool);
        }
        self
    }

    /// Attach a related task class
    #[must_use]
    pub fn with_related_task(mut self, task_class: impl Into<String>) -> Self {
        let task_class = task_class.into();
        if !self.metadata.related_tasks.contains(&task_class) {
            self.metadata.related_tasks.push(task_class);
        }
        self
    }

    /// Carry an optimised prompt for injection at plan time
    #[must_use]
    pub fn with_optimized_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.metadata.optimized_prompt = Some(prompt.into());
        self
    }

    /// Record a feedback mark and recompute the score
    pub fn mark(&mut self, useful: bool) {
        if useful {
            self.metadata.useful_count += 1;
        } else {
            self.metadata.harmful_count += 1;
        }
        self.recompute_score();
    }

    /// Recompute `score` from the counters
    pub fn recompute_score(&mut self) -> i64 {
        self.metadata.score = self.metadata.useful_count - self.metadata.harmful_count;
        self.metadata.score
    }

    /// Feedback weight in `[0, 1]`; 0.5 when there is no feedback yet
    #[must_use]
    pub fn feedback_weight(&self) -> f32 {
        let useful = self.metadata.useful_count;
        let harmful = self.metadata.harmful_count;
        let total = useful + harmful;
        if total == 0 {
            return 0.5;
        }
        let raw = (useful - harmful) as f32 / (total + 1) as f32;
        (raw + 1.0) / 2.0
    }

    /// Append an example
    pub fn add_example(
        &mut self,
        task: impl Into<String>,
        result: impl Into<String>,
        reasoning: impl Into<String>,
    ) {
        self.examples.push(EntryExample {
            task: task.into(),
            result: result.into(),
            reasoning: reasoning.into(),
            timestamp: Utc::now().to_rfc3339(),
        });
    }

    /// Bump `last_used` to now
    pub fn touch(&mut self) {
        self.metadata.last_used = Utc::now().to_rfc3339();
    }

    /// Content prefix used for similarity scoring
    #[must_use]
    pub fn content_prefix(&self, max_chars: usize) -> &str {
        match self.content.char_indices().nth(max_chars) {
            Some((idx, _)) => &self.content[..idx],
            None => &self.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_tracks_counts() {
        let mut entry = ContextEntry::new(ContextEntryType::Strategy, "prefer OCR for documents");
        entry.mark(true);
        entry.mark(true);
        entry.mark(false);
        assert_eq!(entry.metadata.useful_count, 2);
        assert_eq!(entry.metadata.harmful_count, 1);
        assert_eq!(entry.metadata.score, 1);
    }

    #[test]
    fn test_mark_useful_then_harmful_is_neutral() {
        let mut entry = ContextEntry::new(ContextEntryType::ToolUsage, "x");
        let before = entry.metadata.score;
        entry.mark(true);
        entry.mark(false);
        assert_eq!(entry.metadata.score, before);
    }

    #[test]
    fn test_feedback_weight_defaults_to_half() {
        let entry = ContextEntry::new(ContextEntryType::Knowledge, "x");
        assert!((entry.feedback_weight() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_feedback_weight_range() {
        let mut entry = ContextEntry::new(ContextEntryType::Knowledge, "x");
        for _ in 0..10 {
            entry.mark(true);
        }
        let positive = entry.feedback_weight();
        assert!(positive > 0.5 && positive <= 1.0);

        let mut bad = ContextEntry::new(ContextEntryType::Knowledge, "y");
        for _ in 0..10 {
            bad.mark(false);
        }
        let negative = bad.feedback_weight();
        assert!((0.0..0.5).contains(&negative));
    }

    #[test]
    fn test_initial_counts_builder() {
        let entry = ContextEntry::new(ContextEntryType::ErrorPattern, "bad pattern")
            .with_initial_counts(0, 1);
        assert_eq!(entry.metadata.score, -1);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut entry = ContextEntry::new(ContextEntryType::ToolUsage, "use full paths")
            .with_source(EntrySource::QualityFeedback)
            .with_related_tool("vl_extract")
            .with_optimized_prompt("extract every speaker tag");
        entry.add_example("summarise chat", "quality_issue", "speaker tags lost");

        let json = serde_json::to_string(&entry).unwrap();
        let back: ContextEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entry_id, entry.entry_id);
        assert_eq!(back.entry_type, ContextEntryType::ToolUsage);
        assert_eq!(back.metadata.source, EntrySource::QualityFeedback);
        assert_eq!(
            back.metadata.optimized_prompt.as_deref(),
            Some("extract every speaker tag")
        );
        assert_eq!(back.examples.len(), 1);
    }

    #[test]
    fn test_content_prefix_respects_char_boundaries() {
        let entry = ContextEntry::new(ContextEntryType::Knowledge, "héllo wörld");
        assert_eq!(entry.content_prefix(5), "héllo");
        assert_eq!(entry.content_prefix(100), "héllo wörld");
    }
}
