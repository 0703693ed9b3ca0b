//! Per-flow prompt memoisation with usage statistics

use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use planweave_store::StorageManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Who produced a cached prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptGenerator {
    /// Synthesised by the model at plan time
    Llm,
    /// Injected from a curated optimisation
    Ace,
    /// Edited by hand
    Manual,
}

/// One cached prompt with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    /// The prompt text
    pub prompt: String,
    /// Who produced it
    pub generator: PromptGenerator,
    /// When it was produced
    pub generated_at: String,
    /// Last time it was served
    pub last_used: String,
    /// Times it was served
    pub usage_count: u64,
    /// Quality estimate in `[0, 1]`
    #[serde(default)]
    pub quality_score: f64,
    /// Whether a curated optimisation overwrote it
    #[serde(default)]
    pub optimized_by_ace: bool,
}

/// Per-tool execution statistics for one flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolUsageStats {
    /// Total invocations
    pub total_uses: u64,
    /// Successful invocations
    pub success_count: u64,
    /// Failed invocations
    pub failure_count: u64,
    /// Accumulated execution seconds
    pub total_execution_time: f64,
    /// Last invocation timestamp
    pub last_used: Option<String>,
}

/// Prompt cache scoped to one flow
///
/// All state lives on disk under `cache/prompts/<flow_id>/`; instances are
/// cheap per-flow values.
#[derive(Debug, Clone)]
pub struct PromptCacheManager {
    storage: StorageManager,
    flow_id: String,
}

impl PromptCacheManager {
    /// Days of inactivity after which a flow's prompt cache is collected
    pub const DEFAULT_GC_DAYS: i64 = 30;

    /// Create the cache view for one flow
    #[must_use]
    pub fn for_flow(storage: StorageManager, flow_id: impl Into<String>) -> Self {
        Self {
            storage,
            flow_id: flow_id.into(),
        }
    }

    /// The flow this cache is scoped to
    #[must_use]
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    fn prompts_file(&self) -> PathBuf {
        self.storage
            .prompt_cache_dir(&self.flow_id)
            .join("tool_prompts.json")
    }

    fn metadata_file(&self) -> PathBuf {
        self.storage
            .prompt_cache_dir(&self.flow_id)
            .join("metadata.json")
    }

    fn stats_file(&self) -> PathBuf {
        self.storage
            .prompt_cache_dir(&self.flow_id)
            .join("usage_stats.json")
    }

    fn load_prompts(&self) -> HashMap<String, PromptRecord> {
        self.storage
            .load_json_lenient(&self.prompts_file())
            .unwrap_or_default()
    }

    /// Get the cached prompt for a tool, bumping its usage counters
    pub fn get_cached(&self, tool: &str) -> Option<String> {
        let mut prompts = self.load_prompts();
        let record = prompts.get_mut(tool)?;
        record.usage_count += 1;
        record.last_used = Utc::now().to_rfc3339();
        let prompt = record.prompt.clone();
        if let Err(e) = self.storage.save_json(&self.prompts_file(), &prompts) {
            warn!(error = %e, "Failed to persist prompt usage bump");
        }
        debug!(tool, flow_id = %self.flow_id, "Prompt cache hit");
        Some(prompt)
    }

    /// Store a prompt for a tool
    pub fn save(
        &self,
        tool: &str,
        prompt: &str,
        generator: PromptGenerator,
        quality_score: f64,
        optimized_by_ace: bool,
    ) -> Result<()> {
        let mut prompts = self.load_prompts();
        let now = Utc::now().to_rfc3339();
        prompts.insert(
            tool.to_string(),
            PromptRecord {
                prompt: prompt.to_string(),
                generator,
                generated_at: now.clone(),
                last_used: now,
                usage_count: 1,
                quality_score,
                optimized_by_ace,
            },
        );
        self.storage.save_json(&self.prompts_file(), &prompts)?;
        Ok(())
    }

    /// Replace a prompt by hand
    pub fn update_prompt(&self, tool: &str, new_prompt: &str) -> Result<()> {
        self.save(tool, new_prompt, PromptGenerator::Manual, 0.0, false)
    }

    /// Record one invocation outcome for a tool
    pub fn update_usage(&self, tool: &str, success: bool, duration: f64) -> Result<()> {
        let mut stats: HashMap<String, ToolUsageStats> = self
            .storage
            .load_json_lenient(&self.stats_file())
            .unwrap_or_default();
        let entry = stats.entry(tool.to_string()).or_default();
        entry.total_uses += 1;
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        entry.total_execution_time += duration;
        entry.last_used = Some(Utc::now().to_rfc3339());
        self.storage.save_json(&self.stats_file(), &stats)?;
        Ok(())
    }

    /// All cached prompts of this flow
    #[must_use]
    pub fn all_prompts(&self) -> HashMap<String, String> {
        self.load_prompts()
            .into_iter()
            .map(|(tool, record)| (tool, record.prompt))
            .collect()
    }

    /// Save flow-level metadata
    pub fn save_metadata(&self, metadata: &serde_json::Value) -> Result<()> {
        self.storage
            .save_json(&self.metadata_file(), metadata)
            .map_err(Into::into)
    }

    /// Copy another flow's cached prompts into this flow
    ///
    /// Used when a reused or similar plan donates its prompts.
    pub fn adopt_from(&self, donor_flow_id: &str) -> Result<usize> {
        let donor = Self::for_flow(self.storage.clone(), donor_flow_id);
        let donated = donor.load_prompts();
        if donated.is_empty() {
            return Ok(0);
        }
        let mut prompts = self.load_prompts();
        let mut adopted = 0;
        for (tool, record) in donated {
            if !prompts.contains_key(&tool) {
                prompts.insert(tool, record);
                adopted += 1;
            }
        }
        self.storage.save_json(&self.prompts_file(), &prompts)?;
        info!(adopted, donor = donor_flow_id, "Prompts adopted from donor flow");
        Ok(adopted)
    }

    /// Delete flow cache directories whose every tool is stale
    pub fn cleanup_old_caches(storage: &StorageManager, max_age_days: i64) -> Result<usize> {
        let base = storage.prompts_dir();
        if !base.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let mut collected = 0;

        for entry in std::fs::read_dir(&base).map_err(planweave_store::Error::Io)? {
            let entry = entry.map_err(planweave_store::Error::Io)?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let stats: HashMap<String, ToolUsageStats> = storage
                .load_json_lenient(&dir.join("usage_stats.json"))
                .unwrap_or_default();
            let prompts: HashMap<String, PromptRecord> = storage
                .load_json_lenient(&dir.join("tool_prompts.json"))
                .unwrap_or_default();

            let mut last_activity: Option<DateTime<Utc>> = None;
            let timestamps = stats
                .values()
                .filter_map(|s| s.last_used.as_deref())
                .chain(prompts.values().map(|p| p.last_used.as_str()));
            for timestamp in timestamps {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
                    let parsed = parsed.with_timezone(&Utc);
                    if last_activity.is_none_or(|current| parsed > current) {
                        last_activity = Some(parsed);
                    }
                }
            }

            let stale = match last_activity {
                Some(activity) => activity < cutoff,
                // No parseable activity at all: treat as stale
                None => true,
            };
            if stale && std::fs::remove_dir_all(&dir).is_ok() {
                collected += 1;
            }
        }
        if collected > 0 {
            info!(collected, "Old prompt caches collected");
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StorageManager) {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_save_and_get_bumps_usage() {
        let (_dir, storage) = setup();
        let cache = PromptCacheManager::for_flow(storage, "flow_1");
        cache
            .save("vl_extract", "extract all text", PromptGenerator::Llm, 0.0, false)
            .unwrap();

        assert_eq!(cache.get_cached("vl_extract").unwrap(), "extract all text");
        assert_eq!(cache.get_cached("vl_extract").unwrap(), "extract all text");

        let prompts = cache.load_prompts();
        assert_eq!(prompts["vl_extract"].usage_count, 3);
    }

    #[test]
    fn test_miss_returns_none() {
        let (_dir, storage) = setup();
        let cache = PromptCacheManager::for_flow(storage, "flow_1");
        assert!(cache.get_cached("unknown").is_none());
    }

    #[test]
    fn test_ace_overwrite_marks_provenance() {
        let (_dir, storage) = setup();
        let cache = PromptCacheManager::for_flow(storage, "flow_1");
        cache.save("llm", "v1", PromptGenerator::Llm, 0.0, false).unwrap();
        cache.save("llm", "v2 optimised", PromptGenerator::Ace, 0.8, true).unwrap();

        let prompts = cache.load_prompts();
        assert_eq!(prompts["llm"].prompt, "v2 optimised");
        assert_eq!(prompts["llm"].generator, PromptGenerator::Ace);
        assert!(prompts["llm"].optimized_by_ace);
    }

    #[test]
    fn test_usage_stats_accumulate() {
        let (_dir, storage) = setup();
        let cache = PromptCacheManager::for_flow(storage.clone(), "flow_1");
        cache.update_usage("ocr", true, 0.5).unwrap();
        cache.update_usage("ocr", false, 1.5).unwrap();

        let stats: HashMap<String, ToolUsageStats> = storage
            .load_json_lenient(&cache.stats_file())
            .unwrap();
        assert_eq!(stats["ocr"].total_uses, 2);
        assert_eq!(stats["ocr"].success_count, 1);
        assert_eq!(stats["ocr"].failure_count, 1);
        assert!((stats["ocr"].total_execution_time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_adopt_from_donor_flow() {
        let (_dir, storage) = setup();
        let donor = PromptCacheManager::for_flow(storage.clone(), "flow_old");
        donor.save("vl", "donated prompt", PromptGenerator::Ace, 0.9, true).unwrap();

        let cache = PromptCacheManager::for_flow(storage, "flow_new");
        assert_eq!(cache.adopt_from("flow_old").unwrap(), 1);
        assert_eq!(cache.get_cached("vl").unwrap(), "donated prompt");
    }

    #[test]
    fn test_adopt_does_not_overwrite_existing() {
        let (_dir, storage) = setup();
        let donor = PromptCacheManager::for_flow(storage.clone(), "flow_old");
        donor.save("vl", "donated", PromptGenerator::Llm, 0.0, false).unwrap();

        let cache = PromptCacheManager::for_flow(storage, "flow_new");
        cache.save("vl", "mine", PromptGenerator::Manual, 0.0, false).unwrap();
        assert_eq!(cache.adopt_from("flow_old").unwrap(), 0);
        assert_eq!(cache.get_cached("vl").unwrap(), "mine");
    }

    #[test]
    fn test_cleanup_collects_stale_flows() {
        let (_dir, storage) = setup();
        let stale = PromptCacheManager::for_flow(storage.clone(), "flow_stale");
        stale.save("t", "p", PromptGenerator::Llm, 0.0, false).unwrap();

        // Rewrite the record with an old timestamp
        let mut prompts = stale.load_prompts();
        prompts.get_mut("t").unwrap().last_used = "2020-01-01T00:00:00+00:00".into();
        storage.save_json(&stale.prompts_file(), &prompts).unwrap();

        let fresh = PromptCacheManager::for_flow(storage.clone(), "flow_fresh");
        fresh.save("t", "p", PromptGenerator::Llm, 0.0, false).unwrap();

        let collected = PromptCacheManager::cleanup_old_caches(&storage, 30).unwrap();
        assert_eq!(collected, 1);
        assert!(fresh.get_cached("t").is_some());
        assert!(stale.get_cached("t").is_none());
    }
}
