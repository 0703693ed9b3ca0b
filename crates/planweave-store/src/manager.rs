//! Storage manager with the four-layer work-directory layout

use crate::error::{Error, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static WHITESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("WHITESPACE_REGEX is a compile-time constant"));

/// Windows-style path prefixes like `C:\Users\x\` carry per-run filename
/// noise that must not affect exact-match keys.
static DRIVE_PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z]:\\[^\\]+\\").expect("DRIVE_PATH_REGEX is a compile-time constant")
});

/// Storage manager rooted at a work directory
///
/// Directories are created lazily on first write. The manager never caches
/// file contents; callers cache as needed.
#[derive(Debug, Clone)]
pub struct StorageManager {
    work_dir: PathBuf,
}

impl StorageManager {
    /// Create a manager rooted at `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)?;
        debug!(work_dir = %work_dir.display(), "Storage manager initialised");
        Ok(Self { work_dir })
    }

    /// The configured work directory
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    // ---- persistent layer -------------------------------------------------

    /// Directory holding plan files
    #[must_use]
    pub fn plans_dir(&self) -> PathBuf {
        self.work_dir.join("persistent").join("plans")
    }

    /// Directory holding task records
    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.work_dir.join("persistent").join("tasks")
    }

    /// Directory holding per-class context files
    #[must_use]
    pub fn contexts_dir(&self) -> PathBuf {
        self.work_dir
            .join("persistent")
            .join("ace_knowledge")
            .join("contexts")
    }

    /// Directory holding reflection chains
    #[must_use]
    pub fn reflections_dir(&self) -> PathBuf {
        self.work_dir
            .join("persistent")
            .join("ace_knowledge")
            .join("reflections")
    }

    /// Directory holding execution traces
    #[must_use]
    pub fn traces_dir(&self) -> PathBuf {
        self.work_dir
            .join("persistent")
            .join("ace_knowledge")
            .join("traces")
    }

    /// Path of a plan file
    #[must_use]
    pub fn plan_file(&self, flow_id: &str) -> PathBuf {
        self.plans_dir().join(format!("{flow_id}.json"))
    }

    /// Path of a task record
    #[must_use]
    pub fn task_file(&self, flow_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("task_{flow_id}.json"))
    }

    /// Path of a context file
    #[must_use]
    pub fn context_file(&self, task_class: &str) -> PathBuf {
        self.contexts_dir().join(format!("{task_class}.json"))
    }

    /// Path of a reflection chain
    #[must_use]
    pub fn reflection_file(&self, chain_id: &str) -> PathBuf {
        self.reflections_dir().join(format!("{chain_id}.json"))
    }

    /// Path of an execution trace
    #[must_use]
    pub fn trace_file(&self, trace_id: &str) -> PathBuf {
        self.traces_dir().join(format!("trace_{trace_id}.json"))
    }

    // ---- cache layer ------------------------------------------------------

    /// Directory holding LLM answer cache files
    #[must_use]
    pub fn llm_cache_dir(&self) -> PathBuf {
        self.work_dir.join("cache").join("llm")
    }

    /// Path of an LLM answer cache entry
    #[must_use]
    pub fn llm_cache_file(&self, cache_key: &str) -> PathBuf {
        self.llm_cache_dir().join(format!("{cache_key}.json"))
    }

    /// Path of the shared embedding cache
    #[must_use]
    pub fn embedding_cache_file(&self) -> PathBuf {
        self.llm_cache_dir().join("embeddings.json")
    }

    /// Base directory for per-flow prompt caches
    #[must_use]
    pub fn prompts_dir(&self) -> PathBuf {
        self.work_dir.join("cache").join("prompts")
    }

    /// Prompt cache directory for one flow
    #[must_use]
    pub fn prompt_cache_dir(&self, flow_id: &str) -> PathBuf {
        self.prompts_dir().join(flow_id)
    }

    /// Directory holding cached tool metadata
    #[must_use]
    pub fn tools_cache_dir(&self) -> PathBuf {
        self.work_dir.join("cache").join("tools")
    }

    /// Path of a tool metadata cache file
    #[must_use]
    pub fn tool_metadata_file(&self, tool_name: &str) -> PathBuf {
        self.tools_cache_dir()
            .join(format!("{tool_name}_metadata.json"))
    }

    // ---- runtime layer ----------------------------------------------------

    /// Scratch directory of the current execution
    #[must_use]
    pub fn runtime_current_dir(&self) -> PathBuf {
        self.work_dir.join("runtime").join("current")
    }

    /// Tool output directory of the current execution
    #[must_use]
    pub fn runtime_outputs_dir(&self) -> PathBuf {
        self.runtime_current_dir().join("outputs")
    }

    /// Path of a tool output file
    #[must_use]
    pub fn tool_output_file(&self, tool_name: &str, flow_id: &str) -> PathBuf {
        self.runtime_outputs_dir()
            .join(format!("{tool_name}_{flow_id}.json"))
    }

    /// Delete all files in the runtime scratch directory
    pub fn cleanup_runtime(&self) -> Result<usize> {
        let dir = self.runtime_current_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                count += 1;
            }
        }
        Ok(count)
    }

    // ---- config layer -----------------------------------------------------

    /// Tool configuration directory for a task namespace
    #[must_use]
    pub fn config_tools_dir(&self, task_namespace: &str) -> PathBuf {
        self.work_dir
            .join("config")
            .join("tools")
            .join(task_namespace)
    }

    /// Persistence directory of the vector index
    #[must_use]
    pub fn vector_db_dir(&self) -> PathBuf {
        self.work_dir.join("vector_db")
    }

    // ---- normalisation ----------------------------------------------------

    /// Normalise a task description into a deterministic key
    ///
    /// Collapses whitespace, strips drive-letter path prefixes, lower-cases.
    /// Idempotent: normalising twice yields the same string.
    #[must_use]
    pub fn normalize_task_description(&self, text: &str) -> String {
        let collapsed = WHITESPACE_REGEX.replace_all(text.trim(), " ");
        let stripped = DRIVE_PATH_REGEX.replace_all(&collapsed, "");
        stripped.to_lowercase()
    }

    // ---- generic JSON read/write ------------------------------------------

    /// Save a value as pretty JSON, creating parent directories
    pub fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(value)?;
        fs::write(path, body)?;
        Ok(())
    }

    /// Save a value atomically (write-then-rename)
    ///
    /// Used for files an external editor may touch concurrently, so readers
    /// never observe a half-written document.
    pub fn save_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a value from JSON; `Ok(None)` when the file does not exist
    pub fn load_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read_to_string(path)?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| Error::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Load a value from JSON, degrading a corrupt file to `None`
    ///
    /// Cache-layer files can always be rebuilt, so a parse failure is logged
    /// and skipped instead of surfaced.
    pub fn load_json_lenient<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        match self.load_json(path) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                None
            }
        }
    }

    /// List JSON files in a directory, newest first
    ///
    /// Returns an empty list when the directory does not exist.
    pub fn list_json_files(&self, dir: &Path, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(prefix) = prefix {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                if !name.starts_with(prefix) {
                    continue;
                }
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }
        files.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(files.into_iter().map(|(p, _)| p).collect())
    }

    // ---- typed helpers ----------------------------------------------------

    /// Save a plan (atomic: plans may be edited externally)
    pub fn save_plan<T: Serialize>(&self, flow_id: &str, plan: &T) -> Result<PathBuf> {
        let path = self.plan_file(flow_id);
        self.save_json_atomic(&path, plan)?;
        Ok(path)
    }

    /// Load a plan
    pub fn load_plan<T: DeserializeOwned>(&self, flow_id: &str) -> Result<Option<T>> {
        self.load_json(&self.plan_file(flow_id))
    }

    /// Save a task record (atomic)
    pub fn save_task<T: Serialize>(&self, flow_id: &str, task: &T) -> Result<PathBuf> {
        let path = self.task_file(flow_id);
        self.save_json_atomic(&path, task)?;
        Ok(path)
    }

    /// Load a task record by flow id (a `task_` prefix is tolerated)
    pub fn load_task<T: DeserializeOwned>(&self, flow_id: &str) -> Result<Option<T>> {
        let flow_id = flow_id.strip_prefix("task_").unwrap_or(flow_id);
        self.load_json(&self.task_file(flow_id))
    }

    /// Load all task records, newest first
    pub fn load_all_tasks<T: DeserializeOwned>(&self, limit: usize) -> Result<Vec<T>> {
        let files = self.list_json_files(&self.tasks_dir(), Some("task_"))?;
        let mut tasks = Vec::new();
        for path in files.into_iter().take(limit) {
            if let Some(task) = self.load_json_lenient(&path) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Save the context entries of a task class
    pub fn save_context<T: Serialize>(&self, task_class: &str, entries: &[T]) -> Result<PathBuf> {
        let path = self.context_file(task_class);
        self.save_json(&path, &entries)?;
        Ok(path)
    }

    /// Load the context entries of a task class (missing file means empty)
    pub fn load_context<T: DeserializeOwned>(&self, task_class: &str) -> Result<Vec<T>> {
        Ok(self
            .load_json(&self.context_file(task_class))?
            .unwrap_or_default())
    }

    /// List every task class that has a context file
    pub fn list_task_classes(&self) -> Result<Vec<String>> {
        let files = self.list_json_files(&self.contexts_dir(), None)?;
        Ok(files
            .into_iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect())
    }

    /// Save an execution trace
    pub fn save_trace<T: Serialize>(&self, trace_id: &str, trace: &T) -> Result<PathBuf> {
        let path = self.trace_file(trace_id);
        self.save_json(&path, trace)?;
        Ok(path)
    }

    /// Load an execution trace
    pub fn load_trace<T: DeserializeOwned>(&self, trace_id: &str) -> Result<Option<T>> {
        self.load_json(&self.trace_file(trace_id))
    }

    /// Load the most recent traces, newest first
    pub fn load_recent_traces<T: DeserializeOwned>(&self, limit: usize) -> Result<Vec<T>> {
        let files = self.list_json_files(&self.traces_dir(), Some("trace_"))?;
        let mut traces = Vec::new();
        for path in files.into_iter().take(limit) {
            if let Some(trace) = self.load_json_lenient(&path) {
                traces.push(trace);
            }
        }
        Ok(traces)
    }

    /// Save a reflection chain
    pub fn save_reflection_chain<T: Serialize>(&self, chain_id: &str, chain: &T) -> Result<PathBuf> {
        let path = self.reflection_file(chain_id);
        self.save_json(&path, chain)?;
        Ok(path)
    }

    /// Load a reflection chain
    pub fn load_reflection_chain<T: DeserializeOwned>(&self, chain_id: &str) -> Result<Option<T>> {
        self.load_json(&self.reflection_file(chain_id))
    }

    /// Save an LLM answer cache entry
    pub fn save_llm_cache<T: Serialize>(&self, cache_key: &str, value: &T) -> Result<()> {
        self.save_json(&self.llm_cache_file(cache_key), value)
    }

    /// Load an LLM answer cache entry (corrupt entries degrade to `None`)
    pub fn load_llm_cache<T: DeserializeOwned>(&self, cache_key: &str) -> Option<T> {
        self.load_json_lenient(&self.llm_cache_file(cache_key))
    }

    /// Save cached metadata for a tool
    pub fn save_tool_metadata<T: Serialize>(&self, tool_name: &str, metadata: &T) -> Result<()> {
        self.save_json(&self.tool_metadata_file(tool_name), metadata)
    }

    /// Load cached metadata for a tool
    pub fn load_tool_metadata<T: DeserializeOwned>(&self, tool_name: &str) -> Option<T> {
        self.load_json_lenient(&self.tool_metadata_file(tool_name))
    }

    /// Load cached metadata for every tool, keyed by tool name
    pub fn load_all_tool_metadata<T: DeserializeOwned>(
        &self,
    ) -> Result<std::collections::HashMap<String, T>> {
        let files = self.list_json_files(&self.tools_cache_dir(), None)?;
        let mut all = std::collections::HashMap::new();
        for path in files {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(name) = stem.strip_suffix("_metadata") else {
                continue;
            };
            if let Some(metadata) = self.load_json_lenient(&path) {
                all.insert(name.to_string(), metadata);
            }
        }
        Ok(all)
    }

    /// Save a tool output produced during execution
    pub fn save_tool_output<T: Serialize>(
        &self,
        tool_name: &str,
        flow_id: &str,
        output: &T,
    ) -> Result<PathBuf> {
        let path = self.tool_output_file(tool_name, flow_id);
        self.save_json(&path, output)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, StorageManager) {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::new(dir.path()).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_plan_round_trip() {
        let (_dir, storage) = manager();
        let plan = json!({"flow_id": "flow_1_abc", "steps": []});
        storage.save_plan("flow_1_abc", &plan).unwrap();

        let loaded: serde_json::Value = storage.load_plan("flow_1_abc").unwrap().unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_missing_file_is_none() {
        let (_dir, storage) = manager();
        let loaded: Option<serde_json::Value> = storage.load_plan("nope").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_persistent_file_errors() {
        let (_dir, storage) = manager();
        let path = storage.plan_file("bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let result: Result<Option<serde_json::Value>> = storage.load_plan("bad");
        assert!(matches!(result, Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_corrupt_cache_file_degrades_to_none() {
        let (_dir, storage) = manager();
        let path = storage.llm_cache_file("bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let loaded: Option<serde_json::Value> = storage.load_llm_cache("bad");
        assert!(loaded.is_none());
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let (_dir, storage) = manager();
        storage.save_task("flow_2_def", &json!({"ok": true})).unwrap();

        let tmp = storage.task_file("flow_2_def").with_extension("json.tmp");
        assert!(!tmp.exists());
        let loaded: serde_json::Value = storage.load_task("flow_2_def").unwrap().unwrap();
        assert_eq!(loaded["ok"], true);
    }

    #[test]
    fn test_load_task_tolerates_prefix() {
        let (_dir, storage) = manager();
        storage.save_task("flow_3", &json!({"id": 3})).unwrap();
        let loaded: serde_json::Value = storage.load_task("task_flow_3").unwrap().unwrap();
        assert_eq!(loaded["id"], 3);
    }

    #[test]
    fn test_normalize_collapses_and_lowercases() {
        let (_dir, storage) = manager();
        let normalized = storage.normalize_task_description("  Summarise   WeChat\tChat ");
        assert_eq!(normalized, "summarise wechat chat");
    }

    #[test]
    fn test_normalize_strips_drive_paths() {
        let (_dir, storage) = manager();
        let normalized =
            storage.normalize_task_description(r"continue C:\Users\me\draft.txt please");
        assert!(!normalized.contains("users"));
        assert!(normalized.contains("draft.txt"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let (_dir, storage) = manager();
        let once = storage.normalize_task_description("  Mixed CASE   text ");
        let twice = storage.normalize_task_description(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_context_round_trip_preserves_order() {
        let (_dir, storage) = manager();
        let entries = vec![json!({"entry_id": "a"}), json!({"entry_id": "b"})];
        storage.save_context("chat_analysis-wechat_extraction", &entries).unwrap();

        let loaded: Vec<serde_json::Value> =
            storage.load_context("chat_analysis-wechat_extraction").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["entry_id"], "a");
        assert_eq!(loaded[1]["entry_id"], "b");
    }

    #[test]
    fn test_missing_context_is_empty() {
        let (_dir, storage) = manager();
        let loaded: Vec<serde_json::Value> = storage.load_context("unknown-class").unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_cleanup_runtime() {
        let (_dir, storage) = manager();
        let scratch = storage.runtime_current_dir();
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("plan.json"), "{}").unwrap();

        assert_eq!(storage.cleanup_runtime().unwrap(), 1);
        assert_eq!(storage.cleanup_runtime().unwrap(), 0);
    }

    #[test]
    fn test_load_all_tool_metadata() {
        let (_dir, storage) = manager();
        storage.save_tool_metadata("ocr", &json!({"kind": "function"})).unwrap();
        storage.save_tool_metadata("vl_extract", &json!({"kind": "vl"})).unwrap();

        let all: std::collections::HashMap<String, serde_json::Value> =
            storage.load_all_tool_metadata().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["vl_extract"]["kind"], "vl");
    }
}
