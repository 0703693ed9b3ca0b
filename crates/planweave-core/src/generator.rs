//! ACE-enhanced plan generation
//!
//! Pipeline: exact reuse, similarity reuse, tool recommendation, context
//! retrieval, prompt assembly, model call, validation, prompt injection,
//! heuristic fix-ups, persistence.

use crate::error::{Error, Result};
use crate::parser::PlanParser;
use crate::plan::{new_flow_id, query_hash, Plan};
use crate::progress::ProgressBus;
use crate::prompt_cache::{PromptCacheManager, PromptGenerator};
use crate::recommender::ToolRecommender;
use planweave_ace::{
    ContextEntry, ContextEntryType, ContextManager, LlmAnalyzer, ReflectionChain, ReflectionStage,
    TaskMatcher,
};
use planweave_llm::{ChatOptions, SharedModelClient};
use planweave_store::StorageManager;
use planweave_tools::{ToolPool, ToolRegistry};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

static CONTENT_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{steps\.(\d+)\.content\}\}")
        .expect("CONTENT_REF_REGEX is a compile-time constant")
});

/// Tunables of the generation pipeline
#[derive(Debug, Clone)]
pub struct PlanGeneratorConfig {
    /// Similarity at or above which a historical plan is silently reused
    pub reuse_threshold: f32,
    /// Context entries injected into the planning prompt
    pub context_top_k: usize,
    /// Pure-function tools that never receive a generated prompt
    pub no_prompt_tools: Vec<String>,
}

impl Default for PlanGeneratorConfig {
    fn default() -> Self {
        Self {
            reuse_threshold: TaskMatcher::REUSE_THRESHOLD,
            context_top_k: ContextManager::DEFAULT_TOP_K,
            no_prompt_tools: vec![
                "ocr_extract_text".to_string(),
                "scroll".to_string(),
                "click_element".to_string(),
                "type_text".to_string(),
            ],
        }
    }
}

enum SimilarOutcome {
    /// A successful similar plan: reuse it outright
    Reuse(Value),
    /// Only a failed similar plan: donate its prompts, generate fresh
    PromptDonor(String),
    /// Nothing close enough
    Miss,
}

/// Produces plans end-to-end: reuse, recommend, prompt, generate, persist
pub struct PlanGenerator {
    model: SharedModelClient,
    analyzer: Arc<LlmAnalyzer>,
    context_manager: Arc<ContextManager>,
    matcher: Arc<TaskMatcher>,
    storage: StorageManager,
    pool: Arc<ToolPool>,
    registry: Arc<ToolRegistry>,
    recommender: ToolRecommender,
    progress: Arc<ProgressBus>,
    config: PlanGeneratorConfig,
}

impl PlanGenerator {
    /// Create a generator
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        model: SharedModelClient,
        analyzer: Arc<LlmAnalyzer>,
        context_manager: Arc<ContextManager>,
        matcher: Arc<TaskMatcher>,
        storage: StorageManager,
        pool: Arc<ToolPool>,
        registry: Arc<ToolRegistry>,
        progress: Arc<ProgressBus>,
        config: PlanGeneratorConfig,
    ) -> Self {
        let recommender = ToolRecommender::new(model.clone());
        Self {
            model,
            analyzer,
            context_manager,
            matcher,
            storage,
            pool,
            registry,
            recommender,
            progress,
            config,
        }
    }

    /// Generate a plan for a request
    #[instrument(skip(self, request, session_id), fields(request_len = request.len()))]
    pub async fn generate(&self, request: &str, session_id: Option<&str>) -> Result<Plan> {
        info!("Generating plan");

        // Stage 1: exact reuse of a successful identical task
        if let Some(reused) = self.matcher.find_exact_plan(request)? {
            info!("Exact match found, reusing plan");
            return self.finalize_reused(reused, request, session_id).await;
        }

        // Stage 2: similarity reuse above the threshold
        let mut prompt_donor: Option<String> = None;
        match self.try_similar_reuse(request).await? {
            SimilarOutcome::Reuse(reused) => {
                info!("Similar successful plan found, reusing");
                return self.finalize_reused(reused, request, session_id).await;
            }
            SimilarOutcome::PromptDonor(flow_id) => {
                info!(donor = %flow_id, "Similar failed plan found, reusing its prompts only");
                prompt_donor = Some(flow_id);
            }
            SimilarOutcome::Miss => {}
        }

        // Stage 3: recommend tools when none are active for this request
        if self.registry.is_empty() {
            if self.pool.is_empty() {
                return Err(Error::PlanGeneration(
                    "no tools available: the pool is empty and nothing is registered".into(),
                ));
            }
            let recommended = self.recommender.recommend(request, &self.pool).await?;
            for tool in &recommended {
                self.registry.activate(&self.pool, tool)?;
            }
            if let Some(session_id) = session_id {
                self.progress.publish_tool_selection(session_id, &recommended);
            }
        }
        if self.registry.is_empty() {
            return Err(Error::PlanGeneration(
                "no tools were selected for this request".into(),
            ));
        }

        // Stage 4: retrieve relevant experience
        let entries = self
            .context_manager
            .retrieve_relevant(request, None, self.config.context_top_k)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Context retrieval failed, planning without experience");
                Vec::new()
            });
        debug!(count = entries.len(), "Context entries retrieved");

        // Stage 5 + 6: assemble the prompt and call the model
        let mut chain = ReflectionChain::new(request);
        let prompt = self.build_planning_prompt(request, &entries);
        chain.add_entry(
            ReflectionStage::PlanGeneration,
            json!({
                "user_prompt": request,
                "full_prompt": planweave_ace::chain::preview(&prompt, 1000),
                "prompt_length": prompt.chars().count(),
                "context_count": entries.len(),
            }),
            Value::Null,
            json!({"model": self.model.model_info().model}),
            "",
        );

        let started = Instant::now();
        let (raw, completion) = self
            .model
            .complete_json(&prompt, &ChatOptions::default())
            .await
            .map_err(|e| Error::PlanGeneration(format!("model call failed: {e}")))?;
        let generation_time = started.elapsed().as_secs_f64();

        chain.add_entry(
            ReflectionStage::PlanGenerationResult,
            Value::Null,
            json!({
                "steps_count": raw.get("steps").and_then(|s| s.as_array()).map_or(0, Vec::len),
                "complexity_level": raw.get("complexity_level"),
                "generation_time": generation_time,
                "model_duration": completion.duration,
            }),
            Value::Null,
            "",
        );

        // Stage 7: validate shape, references, and acyclicity
        let mut plan = Plan::from_value(raw)
            .map_err(|e| Error::PlanGeneration(format!("plan shape invalid: {e}")))?;
        PlanParser::parse(&plan).map_err(|e| Error::PlanGeneration(e.to_string()))?;

        // Stamp identity and metadata
        plan.flow_id = new_flow_id(request);
        plan.original_query = request.to_string();
        plan.query_hash = Some(query_hash(request));
        plan.created_at = chrono::Utc::now().to_rfc3339();
        plan.generation_time = generation_time;
        plan.estimated_steps = Some(plan.steps.len() as u32);
        plan.reflection_chain_id = Some(chain.chain_id.clone());

        let prompt_cache = PromptCacheManager::for_flow(self.storage.clone(), plan.flow_id.as_str());
        if let Some(donor) = prompt_donor {
            prompt_cache.adopt_from(&donor)?;
        }

        // Stages 8-10: prompt injection and heuristic fix-ups
        self.inject_optimized_prompts(&mut plan, &entries, &prompt_cache)?;
        self.inject_default_prompts(&mut plan, &prompt_cache).await?;
        Self::fix_content_parameter(&mut plan);

        // Stage 11: persist
        self.storage.save_plan(&plan.flow_id, &plan)?;
        self.matcher
            .save_task_mapping(request, &plan.to_value(), None)
            .await?;
        self.storage.save_reflection_chain(&chain.chain_id, &chain)?;

        if let Some(session_id) = session_id {
            self.progress
                .publish_plan_ready(session_id, serde_json::to_value(&plan.steps).unwrap_or_default());
        }
        info!(flow_id = %plan.flow_id, steps = plan.steps.len(), "Plan generated");
        Ok(plan)
    }

    /// Clone a reusable plan under a fresh flow id
    ///
    /// The fresh id keeps one task record per execution. Context retrieval
    /// and prompt injection are skipped: the donor plan already carries
    /// complete prompts.
    async fn finalize_reused(
        &self,
        reused: Value,
        request: &str,
        session_id: Option<&str>,
    ) -> Result<Plan> {
        let mut plan = Plan::from_value(reused)?;
        let old_flow_id = plan.flow_id.clone();
        plan.flow_id = new_flow_id(request);
        plan.reused_from = Some(old_flow_id.clone());
        plan.created_at = chrono::Utc::now().to_rfc3339();
        plan.generation_time = 0.0;

        // Carry the donor's prompts over to the new flow
        let prompt_cache = PromptCacheManager::for_flow(self.storage.clone(), plan.flow_id.as_str());
        prompt_cache.adopt_from(&old_flow_id)?;

        // Pull the plan's tools from the pool; a tool the pool no longer has
        // will surface at execution time
        for tool in plan.tools() {
            if !self.registry.has(&tool) {
                if let Err(e) = self.registry.activate(&self.pool, &tool) {
                    warn!(tool = %tool, error = %e, "Reused plan references a tool the pool lacks");
                }
            }
        }

        let mut chain = ReflectionChain::new(request);
        chain.add_entry(
            ReflectionStage::PlanGeneration,
            json!({"reused_from": old_flow_id, "reuse": true}),
            json!({"flow_id": plan.flow_id, "steps_count": plan.steps.len()}),
            Value::Null,
            "reused a historical plan, no context retrieval",
        );
        plan.reflection_chain_id = Some(chain.chain_id.clone());

        self.storage.save_plan(&plan.flow_id, &plan)?;
        self.matcher
            .save_task_mapping(request, &plan.to_value(), None)
            .await?;
        self.storage.save_reflection_chain(&chain.chain_id, &chain)?;

        if let Some(session_id) = session_id {
            self.progress
                .publish_plan_ready(session_id, serde_json::to_value(&plan.steps).unwrap_or_default());
        }
        Ok(plan)
    }

    async fn try_similar_reuse(&self, request: &str) -> Result<SimilarOutcome> {
        let mut matches = self
            .matcher
            .find_similar_plans(request, self.config.reuse_threshold, TaskMatcher::DEFAULT_TOP_K)
            .await?;
        if matches.is_empty() {
            return Ok(SimilarOutcome::Miss);
        }
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut donor: Option<String> = None;
        for (record, similarity) in &matches {
            debug!(flow_id = %record.flow_id, similarity, success = ?record.success, "Reuse candidate");
            // The plan file is preferred over the snapshot to honour edits
            let plan = match self.storage.load_plan::<Value>(&record.flow_id)? {
                Some(latest) => latest,
                None => record.plan_json.clone(),
            };
            if record.success == Some(true) {
                return Ok(SimilarOutcome::Reuse(plan));
            }
            if donor.is_none() {
                donor = Some(record.flow_id.clone());
            }
        }
        Ok(donor.map_or(SimilarOutcome::Miss, SimilarOutcome::PromptDonor))
    }

    fn build_planning_prompt(&self, request: &str, entries: &[ContextEntry]) -> String {
        let context_block = if entries.is_empty() {
            String::new()
        } else {
            let rendered: Vec<String> = entries
                .iter()
                .enumerate()
                .map(|(i, entry)| {
                    format!(
                        "{}. [{}] {}",
                        i + 1,
                        match entry.entry_type {
                            ContextEntryType::Strategy => "strategy",
                            ContextEntryType::Knowledge => "knowledge",
                            ContextEntryType::ErrorPattern => "error pattern",
                            ContextEntryType::ToolUsage => "tool usage",
                        },
                        entry.content.trim(),
                    )
                })
                .collect();
            format!(
                "Relevant experience from earlier tasks (follow strategies, avoid error \
                 patterns):\n{}\n\n",
                rendered.join("\n")
            )
        };

        format!(
            "You are a workflow planner. Decompose the user's request into a JSON \
             workflow over the available tools.\n\n\
             {context_block}\
             Available tools:\n{catalogue}\n\n\
             User request:\n{request}\n\n\
             Rules:\n\
             - step_id values are 1, 2, 3, ... with no gaps.\n\
             - dependencies lists the step_ids a step needs; only earlier steps.\n\
             - Reference earlier outputs as {{{{steps.N.field}}}} using the field \
             names from each tool's output schema.\n\
             - A general_llm_processor step must receive the text to analyse in a \
             'content' parameter (e.g. \"content\": \"{{{{steps.1.content}}}}\") and \
             the instruction in 'prompt'; never bury the content reference inside \
             the prompt text.\n\
             - Use only the tools listed above, with their declared parameters.\n\n\
             Return JSON only:\n\
             {{\n\
               \"overall_strategy\": \"one-paragraph approach\",\n\
               \"complexity_level\": \"simple|medium|complex\",\n\
               \"estimated_steps\": 2,\n\
               \"steps\": [\n\
                 {{\n\
                   \"step_id\": 1,\n\
                   \"description\": \"what this step does\",\n\
                   \"tool\": \"tool_name\",\n\
                   \"tool_input\": {{\"param\": \"value\"}},\n\
                   \"dependencies\": [],\n\
                   \"reasoning\": \"why this step\"\n\
                 }}\n\
               ]\n\
             }}",
            catalogue = self.registry.catalogue(),
        )
    }

    /// Injection pass 1: curated optimised prompts
    fn inject_optimized_prompts(
        &self,
        plan: &mut Plan,
        entries: &[ContextEntry],
        prompt_cache: &PromptCacheManager,
    ) -> Result<()> {
        for step in &mut plan.steps {
            if self.config.no_prompt_tools.contains(&step.tool) {
                continue;
            }
            let optimized = entries.iter().find_map(|entry| {
                (entry.entry_type == ContextEntryType::ToolUsage
                    && entry.metadata.related_tools.iter().any(|t| *t == step.tool))
                .then(|| entry.metadata.optimized_prompt.clone())
                .flatten()
            });
            if let Some(prompt) = optimized {
                info!(step_id = step.step_id, tool = %step.tool, "Injecting optimised prompt");
                step.tool_input
                    .insert("prompt".to_string(), Value::String(prompt.clone()));
                prompt_cache.save(&step.tool, &prompt, PromptGenerator::Ace, 0.0, true)?;
            }
        }
        Ok(())
    }

    /// Injection pass 2: cached or synthesised default prompts
    async fn inject_default_prompts(
        &self,
        plan: &mut Plan,
        prompt_cache: &PromptCacheManager,
    ) -> Result<()> {
        for step in &mut plan.steps {
            if self.config.no_prompt_tools.contains(&step.tool) {
                continue;
            }
            let Some(metadata) = self.registry.metadata(&step.tool) else {
                continue;
            };
            let expects_prompt =
                metadata.kind.is_model_backed() || metadata.input_parameters.contains_key("prompt");
            if !expects_prompt {
                continue;
            }
            let current = step
                .tool_input
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !current.trim().is_empty() {
                continue;
            }

            let prompt = match prompt_cache.get_cached(&step.tool) {
                Some(cached) => cached,
                None => {
                    let synthesised = self
                        .synthesise_prompt(&step.tool, &metadata.description, step)
                        .await?;
                    prompt_cache.save(&step.tool, &synthesised, PromptGenerator::Llm, 0.0, false)?;
                    synthesised
                }
            };
            debug!(step_id = step.step_id, tool = %step.tool, "Default prompt filled in");
            step.tool_input
                .insert("prompt".to_string(), Value::String(prompt));
        }
        Ok(())
    }

    async fn synthesise_prompt(
        &self,
        tool: &str,
        tool_description: &str,
        step: &crate::plan::PlanStep,
    ) -> Result<String> {
        let reasoning = step.reasoning.as_deref().unwrap_or("");
        let request = format!(
            "Write the instruction prompt a tool invocation should carry.\n\n\
             Tool: {tool}\n\
             Tool description: {tool_description}\n\
             Step description: {}\n\
             Step reasoning: {reasoning}\n\n\
             The prompt must describe what to produce and how to organise it. Do \
             not define output formats; the tool's schema owns the response shape.\n\n\
             Return JSON only: {{\"prompt\": \"...\"}}",
            step.description,
        );
        let cache_key = format!(
            "prompt_gen_{}",
            query_hash(&format!("{tool}|{}|{reasoning}", step.description))
        );
        let value = self
            .analyzer
            .analyze_with_cache(&request, &cache_key, None)
            .await?;
        let prompt = value
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or(&step.description)
            .to_string();
        Ok(prompt)
    }

    /// Heuristic fix-up: `general_llm_processor` must receive its text in a
    /// dedicated `content` parameter, not buried inside the prompt
    fn fix_content_parameter(plan: &mut Plan) {
        for step in &mut plan.steps {
            if step.tool != "general_llm_processor" {
                continue;
            }
            let content_empty = step
                .tool_input
                .get("content")
                .and_then(|v| v.as_str())
                .map_or(true, str::is_empty);
            if !content_empty {
                continue;
            }
            let Some(prompt) = step
                .tool_input
                .get("prompt")
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            let Some(matched) = CONTENT_REF_REGEX.find(&prompt) else {
                continue;
            };
            let reference = matched.as_str().to_string();
            let cleaned = prompt.replace(&reference, "").trim().to_string();
            warn!(
                step_id = step.step_id,
                "Extracting content reference out of the prompt"
            );
            step.tool_input
                .insert("content".to_string(), Value::String(reference));
            step.tool_input
                .insert("prompt".to_string(), Value::String(cleaned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planweave_ace::EmbeddingCache;
    use planweave_llm::{MockEmbedder, MockModelClient};
    use planweave_search::TaskIndex;
    use planweave_tools::{FnTool, ParameterSpec, ToolKind, ToolMetadata};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        model: Arc<MockModelClient>,
        generator: PlanGenerator,
        matcher: Arc<TaskMatcher>,
        registry: Arc<ToolRegistry>,
        storage: StorageManager,
        context_manager: Arc<ContextManager>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let model = Arc::new(MockModelClient::new());
        let embedder = Arc::new(MockEmbedder::new(64));
        let embeddings = Arc::new(EmbeddingCache::new(storage.clone(), embedder.clone()));
        let analyzer = Arc::new(LlmAnalyzer::new(
            model.clone(),
            embeddings,
            storage.clone(),
        ));
        let context_manager = Arc::new(ContextManager::new(storage.clone(), analyzer.clone()));
        let index = Arc::new(TaskIndex::open(&storage.vector_db_dir(), embedder).unwrap());
        let matcher = Arc::new(TaskMatcher::new(storage.clone(), index));
        let pool = Arc::new(ToolPool::new());
        let registry = Arc::new(ToolRegistry::new());

        for name in ["screenshot_and_analyze", "general_llm_processor", "ocr_extract_text"] {
            let kind = if name == "general_llm_processor" {
                ToolKind::Llm
            } else {
                ToolKind::Function
            };
            let mut metadata = ToolMetadata::new(name, format!("{name} tool"), kind)
                .with_parameter("prompt", ParameterSpec::optional("string", "instruction"));
            if kind.is_model_backed() {
                metadata = metadata.with_output_schema(
                    json!({"type": "object", "properties": {"content": {"type": "string"}}}),
                );
            }
            pool.insert(FnTool::shared(metadata, |_args| Ok(json!({"content": "ok"}))))
                .unwrap();
        }

        let generator = PlanGenerator::new(
            model.clone(),
            analyzer,
            context_manager.clone(),
            matcher.clone(),
            storage.clone(),
            pool,
            registry.clone(),
            Arc::new(ProgressBus::default()),
            PlanGeneratorConfig::default(),
        );
        Fixture {
            _dir: dir,
            model,
            generator,
            matcher,
            registry,
            storage,
            context_manager,
        }
    }

    fn classification() -> &'static str {
        r#"{"primary_category": "chat_analysis", "sub_category": "wechat_extraction"}"#
    }

    fn recommendation() -> &'static str {
        r#"{"recommended_tools": ["screenshot_and_analyze", "general_llm_processor"],
            "reasoning": "capture then analyse"}"#
    }

    fn raw_plan() -> &'static str {
        r#"{
            "overall_strategy": "capture the chat and summarise it",
            "complexity_level": "simple",
            "estimated_steps": 2,
            "steps": [
                {"step_id": 1, "description": "capture the chat window",
                 "tool": "screenshot_and_analyze",
                 "tool_input": {"prompt": "read the visible messages"},
                 "dependencies": []},
                {"step_id": 2, "description": "summarise the captured text",
                 "tool": "general_llm_processor",
                 "tool_input": {"content": "{{steps.1.content}}", "prompt": "summarise the conversation"},
                 "dependencies": [1]}
            ]
        }"#
    }

    #[tokio::test]
    async fn test_full_generation_pipeline() {
        let fixture = fixture();
        fixture.model.push_response(recommendation());
        fixture.model.push_response(classification());
        fixture.model.push_response(raw_plan());

        let plan = fixture
            .generator
            .generate("summarise wechat chat", None)
            .await
            .unwrap();

        assert!(plan.flow_id.starts_with("flow_"));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.query_hash.as_deref(), Some(&*query_hash("summarise wechat chat")));
        assert!(plan.reflection_chain_id.is_some());
        assert!(fixture.registry.has("screenshot_and_analyze"));

        // Plan, task record, and chain were persisted
        let stored: Option<Value> = fixture.storage.load_plan(&plan.flow_id).unwrap();
        assert!(stored.is_some());
        let record: Option<Value> = fixture.storage.load_task(&plan.flow_id).unwrap();
        assert!(record.is_some());
        let chain: Option<Value> = fixture
            .storage
            .load_reflection_chain(plan.reflection_chain_id.as_deref().unwrap())
            .unwrap();
        assert!(chain.is_some());
    }

    #[tokio::test]
    async fn test_empty_pool_fails_clearly() {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let model = Arc::new(MockModelClient::new());
        let embedder = Arc::new(MockEmbedder::new(64));
        let embeddings = Arc::new(EmbeddingCache::new(storage.clone(), embedder.clone()));
        let analyzer = Arc::new(LlmAnalyzer::new(model.clone(), embeddings, storage.clone()));
        let context_manager = Arc::new(ContextManager::new(storage.clone(), analyzer.clone()));
        let index = Arc::new(TaskIndex::open(&storage.vector_db_dir(), embedder).unwrap());
        let matcher = Arc::new(TaskMatcher::new(storage.clone(), index));

        let generator = PlanGenerator::new(
            model,
            analyzer,
            context_manager,
            matcher,
            storage,
            Arc::new(ToolPool::new()),
            Arc::new(ToolRegistry::new()),
            Arc::new(ProgressBus::default()),
            PlanGeneratorConfig::default(),
        );

        let err = generator.generate("anything", None).await.unwrap_err();
        assert!(matches!(err, Error::PlanGeneration(_)));
        assert!(err.to_string().contains("pool is empty"));
    }

    #[tokio::test]
    async fn test_exact_reuse_produces_fresh_flow_id() {
        let fixture = fixture();
        // Seed a successful historical task
        let old_plan: Value = serde_json::from_str(raw_plan()).unwrap();
        let mut old_plan = old_plan;
        old_plan["flow_id"] = json!("flow_100_origin01");
        old_plan["original_query"] = json!("summarise wechat chat");
        fixture
            .matcher
            .save_task_mapping("summarise wechat chat", &old_plan, Some(true))
            .await
            .unwrap();
        fixture.storage.save_plan("flow_100_origin01", &old_plan).unwrap();

        let plan = fixture
            .generator
            .generate("Summarise  WeChat   chat", None)
            .await
            .unwrap();

        assert_eq!(plan.reused_from.as_deref(), Some("flow_100_origin01"));
        assert_ne!(plan.flow_id, "flow_100_origin01");
        assert_eq!(plan.steps.len(), 2);
        // No model call happened: no recommendation, no classification, no generation
        assert_eq!(fixture.model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_similarity_below_threshold_generates_fresh() {
        let fixture = fixture();
        // Seed a dissimilar successful task
        let mut other: Value = serde_json::from_str(raw_plan()).unwrap();
        other["flow_id"] = json!("flow_200_other001");
        other["original_query"] = json!("rotate the pdf ninety degrees");
        fixture
            .matcher
            .save_task_mapping("rotate the pdf ninety degrees", &other, Some(true))
            .await
            .unwrap();

        fixture.model.push_response(recommendation());
        fixture.model.push_response(classification());
        fixture.model.push_response(raw_plan());

        let plan = fixture
            .generator
            .generate("summarise wechat chat", None)
            .await
            .unwrap();
        assert!(plan.reused_from.is_none());
        // Generation path ran the model
        assert!(fixture.model.call_count() >= 2);
    }

    #[tokio::test]
    async fn test_optimized_prompt_injection() {
        let fixture = fixture();
        // A curated quality-feedback entry for the llm tool, in the class the
        // classifier will resolve
        let entry = ContextEntry::new(
            ContextEntryType::ToolUsage,
            "summarise wechat chat carefully",
        )
        .with_related_tool("general_llm_processor")
        .with_optimized_prompt("summarise and keep every speaker tag");
        fixture
            .context_manager
            .save_context("chat_analysis-wechat_extraction", vec![entry])
            .await
            .unwrap();

        fixture.model.push_response(recommendation());
        fixture.model.push_response(classification());
        fixture.model.push_response(raw_plan());

        let plan = fixture
            .generator
            .generate("summarise wechat chat", None)
            .await
            .unwrap();

        let step = plan.step(2).unwrap();
        assert_eq!(
            step.tool_input["prompt"],
            json!("summarise and keep every speaker tag")
        );
        // The injected prompt is cached for the flow
        let cache = PromptCacheManager::for_flow(fixture.storage.clone(), plan.flow_id.as_str());
        assert_eq!(
            cache.get_cached("general_llm_processor").unwrap(),
            "summarise and keep every speaker tag"
        );
    }

    #[tokio::test]
    async fn test_invalid_model_plan_surfaces_generation_error() {
        let fixture = fixture();
        fixture.model.push_response(recommendation());
        fixture.model.push_response(classification());
        // Cyclic dependencies
        fixture.model.push_response(
            r#"{"steps": [
                {"step_id": 1, "description": "a", "tool": "ocr_extract_text", "tool_input": {}, "dependencies": [2]},
                {"step_id": 2, "description": "b", "tool": "ocr_extract_text", "tool_input": {}, "dependencies": [1]}
            ]}"#,
        );

        let err = fixture
            .generator
            .generate("summarise wechat chat", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlanGeneration(_)));
    }

    #[test]
    fn test_fix_content_parameter_extracts_reference() {
        let mut plan = Plan::from_value(serde_json::from_str(
            r#"{"steps": [
                {"step_id": 1, "description": "capture", "tool": "ocr_extract_text", "tool_input": {}},
                {"step_id": 2, "description": "analyse", "tool": "general_llm_processor",
                 "tool_input": {"prompt": "analyse this: {{steps.1.content}}"}, "dependencies": [1]}
            ]}"#,
        ).unwrap()).unwrap();

        PlanGenerator::fix_content_parameter(&mut plan);

        let step = plan.step(2).unwrap();
        assert_eq!(step.tool_input["content"], json!("{{steps.1.content}}"));
        let prompt = step.tool_input["prompt"].as_str().unwrap();
        assert!(!prompt.contains("{{steps.1.content}}"));
        assert!(prompt.contains("analyse this"));
    }

    #[test]
    fn test_fix_content_parameter_leaves_existing_content() {
        let mut plan = Plan::from_value(serde_json::from_str(
            r#"{"steps": [
                {"step_id": 1, "description": "capture", "tool": "ocr_extract_text", "tool_input": {}},
                {"step_id": 2, "description": "analyse", "tool": "general_llm_processor",
                 "tool_input": {"content": "{{steps.1.content}}", "prompt": "analyse {{steps.1.content}}"},
                 "dependencies": [1]}
            ]}"#,
        ).unwrap()).unwrap();

        PlanGenerator::fix_content_parameter(&mut plan);
        let step = plan.step(2).unwrap();
        // Prompt untouched because content was already present
        assert!(step.tool_input["prompt"].as_str().unwrap().contains("{{steps.1.content}}"));
    }
}
