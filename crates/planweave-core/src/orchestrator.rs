//! Orchestrator: the public facade owning the engine's lifecycle

use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, PlanExecutor};
use crate::generator::{PlanGenerator, PlanGeneratorConfig};
use crate::plan::Plan;
use crate::progress::ProgressBus;
use crate::prompt_cache::PromptCacheManager;
use planweave_ace::{
    AceGenerator, ContextManager, Curator, EmbeddingCache, ExecutionTrace, LlmAnalyzer,
    ReflectionChain, Reflector, TaskMatcher, TaskRecord,
};
use planweave_llm::{SharedEmbeddingProvider, SharedModelClient};
use planweave_search::TaskIndex;
use planweave_store::StorageManager;
use planweave_tools::{Tool, ToolPool, ToolRegistry, ToolUnderstandingAgent};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Work directory holding all persistent state
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Similarity at or above which historical plans are silently reused
    #[serde(default = "default_reuse_threshold")]
    pub reuse_threshold: f32,
    /// Similarity threshold for general task retrieval
    #[serde(default = "default_retrieval_threshold")]
    pub retrieval_threshold: f32,
    /// Context entries injected into planning prompts
    #[serde(default = "default_context_top_k")]
    pub context_top_k: usize,
    /// Score below which context entries are pruned during maintenance
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: i64,
    /// Per-session progress queue capacity
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
    /// Seconds without consumer progress before a session is reaped
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    /// Pure-function tools that never receive a generated prompt
    #[serde(default = "default_no_prompt_tools")]
    pub no_prompt_tools: Vec<String>,
}

fn default_work_dir() -> PathBuf {
    planweave_store::default_work_dir()
}

fn default_reuse_threshold() -> f32 {
    TaskMatcher::REUSE_THRESHOLD
}

fn default_retrieval_threshold() -> f32 {
    TaskMatcher::RETRIEVAL_THRESHOLD
}

fn default_context_top_k() -> usize {
    ContextManager::DEFAULT_TOP_K
}

fn default_prune_threshold() -> i64 {
    ContextManager::DEFAULT_PRUNE_THRESHOLD
}

fn default_progress_capacity() -> usize {
    ProgressBus::DEFAULT_CAPACITY
}

fn default_session_idle_timeout() -> u64 {
    60
}

fn default_no_prompt_tools() -> Vec<String> {
    PlanGeneratorConfig::default().no_prompt_tools
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            reuse_threshold: default_reuse_threshold(),
            retrieval_threshold: default_retrieval_threshold(),
            context_top_k: default_context_top_k(),
            prune_threshold: default_prune_threshold(),
            progress_capacity: default_progress_capacity(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            no_prompt_tools: default_no_prompt_tools(),
        }
    }
}

impl OrchestratorConfig {
    /// Configuration rooted at a specific work directory
    #[must_use]
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }
}

/// Public facade owning every engine component
///
/// Entry points: `generate_plan`, `execute_plan`, `reflect_quality`,
/// `mark_entry`, `list_task_history`. The ACE pipeline runs after every
/// execution, success or failure; a reflection error never masks the
/// primary outcome.
pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: StorageManager,
    pool: Arc<ToolPool>,
    registry: Arc<ToolRegistry>,
    context_manager: Arc<ContextManager>,
    matcher: Arc<TaskMatcher>,
    generator: PlanGenerator,
    executor: PlanExecutor,
    reflector: Reflector,
    curator: Curator,
    understanding: ToolUnderstandingAgent,
    progress: Arc<ProgressBus>,
    cancel_token: CancellationToken,
}

impl Orchestrator {
    /// Wire the engine together
    ///
    /// Opens the vector index eagerly: a broken index directory is a hard
    /// error rather than a silent degradation of matching quality.
    pub fn new(
        config: OrchestratorConfig,
        model: SharedModelClient,
        embedder: SharedEmbeddingProvider,
    ) -> Result<Self> {
        let storage = StorageManager::new(&config.work_dir)?;
        let index = Arc::new(TaskIndex::open(&storage.vector_db_dir(), embedder.clone())?);

        let embeddings = Arc::new(EmbeddingCache::new(storage.clone(), embedder));
        let analyzer = Arc::new(LlmAnalyzer::new(
            model.clone(),
            embeddings,
            storage.clone(),
        ));
        let context_manager = Arc::new(ContextManager::new(storage.clone(), analyzer.clone()));
        let matcher = Arc::new(TaskMatcher::new(storage.clone(), index));
        let pool = Arc::new(ToolPool::new());
        let registry = Arc::new(ToolRegistry::new());
        let progress = Arc::new(ProgressBus::new(config.progress_capacity));

        let generator = PlanGenerator::new(
            model.clone(),
            analyzer,
            context_manager.clone(),
            matcher.clone(),
            storage.clone(),
            pool.clone(),
            registry.clone(),
            progress.clone(),
            PlanGeneratorConfig {
                reuse_threshold: config.reuse_threshold,
                context_top_k: config.context_top_k,
                no_prompt_tools: config.no_prompt_tools.clone(),
            },
        );
        let executor = PlanExecutor::new(progress.clone());
        let reflector = Reflector::new(model.clone());
        let curator = Curator::new(context_manager.clone());
        let understanding = ToolUnderstandingAgent::new(model, storage.clone());

        info!(work_dir = %config.work_dir.display(), "Orchestrator ready");
        Ok(Self {
            config,
            storage,
            pool,
            registry,
            context_manager,
            matcher,
            generator,
            executor,
            reflector,
            curator,
            understanding,
            progress,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Advertise a tool into the pool
    pub fn add_tool(&self, tool: Arc<dyn Tool>) -> Result<()> {
        self.pool.insert(tool).map_err(Into::into)
    }

    /// Advertise a tool and derive its metadata manifest
    ///
    /// The manifest is cached per source hash; analysis failure falls back
    /// to the declared metadata and never blocks registration.
    pub async fn add_tool_with_analysis(
        &self,
        tool: Arc<dyn Tool>,
        source: Option<&str>,
    ) -> Result<()> {
        self.understanding.analyze(tool.as_ref(), source).await?;
        self.pool.insert(tool).map_err(Into::into)
    }

    /// The tool pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ToolPool> {
        &self.pool
    }

    /// The activated tool registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The progress bus
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    /// A child cancellation token for callers
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Cancel every running session
    pub fn cancel(&self) {
        info!("Cancelling all sessions");
        self.cancel_token.cancel();
    }

    /// Generate a plan for a request
    #[instrument(skip(self, request, session_id))]
    pub async fn generate_plan(&self, request: &str, session_id: Option<&str>) -> Result<Plan> {
        self.generator.generate(request, session_id).await
    }

    /// Execute a plan and run the ACE pipeline on its trace
    ///
    /// The pipeline runs on success and on failure. A failure surfaces as a
    /// typed error after reflection completes; errors inside reflection are
    /// logged and reported alongside, never masking the primary outcome.
    #[instrument(skip(self, plan, session_id), fields(flow_id = %plan.flow_id))]
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        session_id: Option<&str>,
    ) -> Result<ExecutionResult> {
        let mut ace = AceGenerator::new(self.storage.clone());
        let mut chain = match &plan.reflection_chain_id {
            Some(chain_id) => self
                .storage
                .load_reflection_chain::<ReflectionChain>(chain_id)?
                .unwrap_or_else(|| ReflectionChain::new(plan.original_query.as_str())),
            None => ReflectionChain::new(plan.original_query.as_str()),
        };
        let cancel = self.cancel_token.child_token();

        // Scratch copy of the executing plan for external inspection
        let scratch = self.storage.runtime_current_dir().join("plan.json");
        if let Err(e) = self.storage.save_json(&scratch, plan) {
            warn!(error = %e, "Runtime plan copy failed");
        }

        let outcome = self
            .executor
            .execute(plan, &self.registry, &mut ace, Some(&mut chain), session_id, &cancel)
            .await;

        if let Err(e) = self.storage.save_reflection_chain(&chain.chain_id, &chain) {
            warn!(error = %e, "Reflection chain save failed");
        }

        let trace = match ace.finalize_trace() {
            Ok(trace) => trace,
            Err(e) => {
                warn!(error = %e, "Trace finalisation failed");
                None
            }
        };
        if let Some(trace) = trace {
            if let Err(e) = self.run_reflection(&trace).await {
                warn!(error = %e, "Reflection failed, primary outcome unaffected");
            }
        }

        if let Err(e) = self
            .matcher
            .update_task_success(&plan.flow_id, outcome.is_ok())
        {
            warn!(error = %e, "Task success update failed");
        }

        if let Some(session_id) = session_id {
            self.progress.close(session_id);
        }
        outcome
    }

    async fn run_reflection(&self, trace: &ExecutionTrace) -> Result<()> {
        let insights = self.reflector.analyze_trace(trace).await?;
        let entries = self.curator.curate_insights(&insights, trace, None).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let task_class = self
            .context_manager
            .identify_task_class(&trace.task_description)
            .await?;
        self.curator.update_context(&task_class, entries).await?;
        Ok(())
    }

    /// Process negative quality feedback on a successful execution
    ///
    /// Classifies the run as a quality issue, curates a `tool_usage` entry
    /// carrying the optimised prompt, and marks the task unsuccessful so a
    /// later identical request regenerates instead of silently reusing.
    #[instrument(skip(self, plan, feedback), fields(flow_id = %plan.flow_id))]
    pub async fn reflect_quality(&self, plan: &Plan, feedback: &str) -> Result<()> {
        let traces: Vec<ExecutionTrace> = self.storage.load_recent_traces(100)?;
        let trace = traces
            .into_iter()
            .find(|t| t.flow_id == plan.flow_id)
            .ok_or_else(|| {
                Error::Ace(planweave_ace::Error::Reflection(format!(
                    "no execution trace for flow '{}'",
                    plan.flow_id
                )))
            })?;

        let mut chain = match &plan.reflection_chain_id {
            Some(chain_id) => self
                .storage
                .load_reflection_chain::<ReflectionChain>(chain_id)?
                .unwrap_or_else(|| ReflectionChain::new(plan.original_query.as_str())),
            None => ReflectionChain::new(plan.original_query.as_str()),
        };

        let insights = self
            .reflector
            .analyze_quality_issue(&trace, feedback, Some(&mut chain))
            .await?;
        let entries = self
            .curator
            .curate_insights(&insights, &trace, Some(&mut chain))
            .await?;
        if !entries.is_empty() {
            let task_class = self
                .context_manager
                .identify_task_class(&trace.task_description)
                .await?;
            self.curator.update_context(&task_class, entries).await?;
        }
        self.storage.save_reflection_chain(&chain.chain_id, &chain)?;

        if let Err(e) = self.matcher.update_task_success(&plan.flow_id, false) {
            warn!(error = %e, "Task success update failed");
        }
        info!("Quality feedback processed");
        Ok(())
    }

    /// Mark a context entry useful or harmful
    pub async fn mark_entry(&self, entry_id: &str, useful: bool) -> Result<bool> {
        let marked = if useful {
            self.context_manager.mark_useful(entry_id).await?
        } else {
            self.context_manager.mark_harmful(entry_id).await?
        };
        Ok(marked)
    }

    /// Task history, newest first
    pub fn list_task_history(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.matcher.task_history(limit).map_err(Into::into)
    }

    /// Retrieve historical tasks similar to a description
    ///
    /// Uses the general retrieval threshold, which is looser than the one
    /// gating silent reuse.
    pub async fn find_similar_tasks(
        &self,
        description: &str,
        limit: usize,
    ) -> Result<Vec<(TaskRecord, f32)>> {
        self.matcher
            .find_similar_plans(description, self.config.retrieval_threshold, limit)
            .await
            .map_err(Into::into)
    }

    /// Run offline maintenance: prune low-score entries, collect stale
    /// prompt caches, reap idle progress sessions
    pub async fn run_maintenance(&self) -> Result<()> {
        let pruned = self
            .context_manager
            .cleanup_low_score_entries(self.config.prune_threshold)
            .await?;
        let collected =
            PromptCacheManager::cleanup_old_caches(&self.storage, PromptCacheManager::DEFAULT_GC_DAYS)?;
        let reaped = self
            .progress
            .reap_inactive(Duration::from_secs(self.config.session_idle_timeout_secs));
        info!(pruned, collected, reaped, "Maintenance pass done");
        Ok(())
    }

    /// The storage manager backing the engine
    #[must_use]
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }
}
