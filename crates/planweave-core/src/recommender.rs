//! Tool recommender: model-driven selection over the pool

use crate::error::Result;
use planweave_llm::{ChatOptions, SharedModelClient};
use planweave_tools::ToolPool;
use tracing::{debug, info, instrument, warn};

/// Maximum tools one recommendation may select
const MAX_RECOMMENDED: usize = 5;

/// Picks the tools a request needs from the pool
///
/// The recommender only chooses; activating the chosen tools into the
/// registry is the orchestrator's job.
pub struct ToolRecommender {
    model: SharedModelClient,
}

impl ToolRecommender {
    /// Create a recommender
    #[must_use]
    pub fn new(model: SharedModelClient) -> Self {
        Self { model }
    }

    /// Recommend 2-5 pool tools for a request
    ///
    /// Returns an empty list when the pool is empty. Names the model invents
    /// are dropped; a selection past the cap is truncated.
    #[instrument(skip(self, request, pool))]
    pub async fn recommend(&self, request: &str, pool: &ToolPool) -> Result<Vec<String>> {
        if pool.is_empty() {
            warn!("Tool pool is empty, nothing to recommend");
            return Ok(Vec::new());
        }

        let prompt = Self::build_prompt(request, pool);
        let (value, _completion) = self
            .model
            .complete_json(&prompt, &ChatOptions::default())
            .await?;

        let mut recommended: Vec<String> = value
            .get("recommended_tools")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        recommended.retain(|name| {
            let known = pool.contains(name);
            if !known {
                warn!(tool = %name, "Model recommended an unknown tool, dropping");
            }
            known
        });
        if recommended.len() > MAX_RECOMMENDED {
            warn!(
                count = recommended.len(),
                "Recommendation exceeds the cap, truncating"
            );
            recommended.truncate(MAX_RECOMMENDED);
        }

        debug!(
            reasoning = value.get("reasoning").and_then(|v| v.as_str()).unwrap_or(""),
            "Recommendation reasoning"
        );
        info!(tools = ?recommended, "Tools recommended");
        Ok(recommended)
    }

    fn build_prompt(request: &str, pool: &ToolPool) -> String {
        format!(
            "You are a tool selection expert. Pick the tools needed to satisfy the \
             user's request from the catalogue below.\n\n\
             User request:\n{request}\n\n\
             Available tools ({count} total):\n{catalogue}\n\n\
             Selection rules:\n\
             - Understand the goal, decompose it into sub-tasks, then match each \
             sub-task against tool capabilities and limitations.\n\
             - Vision-language tools suit semantic understanding and scene or \
             dialogue extraction; OCR tools suit precise verbatim text capture.\n\
             - Mind the data flow between tools (a later tool may need an earlier \
             tool's output).\n\
             - Select only what the task needs: 2 to 5 tools, no redundant picks, \
             but enough to cover the whole flow.\n\n\
             Return JSON only:\n\
             {{\n\
               \"analysis\": \"what the request requires\",\n\
               \"recommended_tools\": [\"tool1\", \"tool2\"],\n\
               \"reasoning\": \"why these tools\"\n\
             }}",
            count = pool.len(),
            catalogue = pool.catalogue(),
        )
    }
}
