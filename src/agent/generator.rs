//! Text generation boundary.

use std::collections::HashMap;

use async_trait::async_trait;

use super::roles::RoleConfig;
use crate::delivery::ChunkEmitter;
use crate::dispatch::AgentTaskRequest;
use crate::error::TaskError;

/// One generation call for one task attempt.
///
/// Implementations stream partial text through the emitter as it is
/// produced and return the complete raw response. The runner parses the
/// response into a structured output; generators never touch session state.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        request: &AgentTaskRequest,
        role: &RoleConfig,
        chunks: &ChunkEmitter,
    ) -> std::result::Result<String, TaskError>;
}

/// Canned response for one task type.
#[derive(Debug, Clone)]
pub struct Script {
    pub chunks: Vec<String>,
    pub reply: String,
}

impl Script {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            reply: reply.into(),
        }
    }

    pub fn json(reply: &serde_json::Value) -> Self {
        Self::new(reply.to_string())
    }

    pub fn with_chunk(mut self, text: impl Into<String>) -> Self {
        self.chunks.push(text.into());
        self
    }
}

/// Deterministic generator for the demo and tests: each task type maps to
/// a fixed script. Task types without a script fail permanently.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    scripts: HashMap<String, Script>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, task_type: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(task_type.into(), script);
        self
    }

    /// Scripts matching the builtin role table, enough to walk a session
    /// from Initiation to Closed.
    pub fn research_demo() -> Self {
        let refined =
            "How have restoration programs changed water quality in urban rivers since 2010?";
        Self::new()
            .with_script(
                "question_refinement",
                Script::json(&serde_json::json!({
                    "type": "refined_question",
                    "text": refined,
                }))
                .with_chunk("Weighing the draft against available sources, ")
                .with_chunk("a sharper framing could be: ")
                .with_chunk(refined),
            )
            .with_script(
                "keyword_extraction",
                Script::json(&serde_json::json!({
                    "type": "keywords",
                    "keywords": ["river restoration", "water quality", "urban watersheds"],
                })),
            )
            .with_script(
                "scope_summary",
                Script::json(&serde_json::json!({
                    "type": "scope_elements",
                    "elements": [
                        { "name": "timeframe", "description": "2010 to present" },
                        { "name": "geography", "description": "urban rivers, OECD countries" },
                    ],
                })),
            )
            .with_script(
                "feasibility_scoring",
                Script::json(&serde_json::json!({
                    "type": "feasibility",
                    "score": 7,
                    "is_niche": false,
                    "summary": "Hydrology and restoration policy are both well published",
                })),
            )
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &AgentTaskRequest,
        _role: &RoleConfig,
        chunks: &ChunkEmitter,
    ) -> std::result::Result<String, TaskError> {
        let Some(script) = self.scripts.get(request.task_type.as_str()) else {
            return Err(TaskError::InvalidInput(format!(
                "no script for task type {}",
                request.task_type
            )));
        };
        for chunk in &script.chunks {
            chunks.emit(chunk.clone());
            // Yield between chunks so cancellation and subscribers get a turn.
            tokio::task::yield_now().await;
        }
        Ok(script.reply.clone())
    }
}
