//! Runs one task attempt and classifies what came back.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::generator::Generator;
use super::roles::RoleConfig;
use crate::delivery::{ChannelRouter, ChunkEmitter};
use crate::dispatch::{AgentTaskRequest, AgentTaskResult, Lane, TaskOutcome, TaskOutput};
use crate::error::TaskError;

/// Executes single attempts. Retry and single-flight live in the
/// dispatcher; the runner's job is to turn one generation call into a
/// classified result without ever panicking or leaking raw errors.
pub struct TaskRunner {
    generator: Arc<dyn Generator>,
    router: Arc<ChannelRouter>,
}

impl TaskRunner {
    pub fn new(generator: Arc<dyn Generator>, router: Arc<ChannelRouter>) -> Self {
        Self { generator, router }
    }

    pub async fn run_attempt(
        &self,
        request: &AgentTaskRequest,
        role: &RoleConfig,
        cancel: &CancellationToken,
    ) -> AgentTaskResult {
        let emitter = self.router.chunk_emitter(
            request.session_id.clone(),
            request.task_type.clone(),
            request.idempotency_key.clone(),
            request.lane == Lane::Stream,
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(
                    session_id = %request.session_id,
                    task_type = %request.task_type,
                    "Attempt cancelled"
                );
                TaskOutcome::Failure(TaskError::Cancelled)
            }
            generated = self.generator.generate(request, role, &emitter) => {
                match generated {
                    Ok(raw) => Self::classify(&raw, &emitter),
                    Err(err) => TaskOutcome::Failure(err),
                }
            }
        };

        AgentTaskResult::new(request, outcome)
    }

    /// A reply that does not parse as a task output is a permanent failure;
    /// retrying the same prompt would produce the same shape again.
    fn classify(raw: &str, emitter: &ChunkEmitter) -> TaskOutcome {
        match serde_json::from_str::<TaskOutput>(raw) {
            Ok(output) => {
                emitter.finish();
                TaskOutcome::Success(output)
            }
            Err(e) => TaskOutcome::Failure(TaskError::MalformedOutput(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::generator::{Script, ScriptedGenerator};
    use crate::config::DeliveryConfig;
    use crate::delivery::StreamMessage;
    use crate::dispatch::Lane;
    use crate::session::SessionId;

    fn runner_with(generator: ScriptedGenerator) -> (TaskRunner, Arc<ChannelRouter>) {
        let router = Arc::new(ChannelRouter::new(DeliveryConfig::default()));
        (
            TaskRunner::new(Arc::new(generator), router.clone()),
            router,
        )
    }

    fn request(task_type: &str) -> AgentTaskRequest {
        AgentTaskRequest::new(
            SessionId::new("s-runner"),
            task_type,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn test_success_parses_output() {
        let generator = ScriptedGenerator::new().with_script(
            "keyword_extraction",
            Script::json(&serde_json::json!({
                "type": "keywords",
                "keywords": ["a", "b"],
            })),
        );
        let (runner, _router) = runner_with(generator);

        let result = runner
            .run_attempt(
                &request("keyword_extraction"),
                &RoleConfig::new("research/keyword-extraction"),
                &CancellationToken::new(),
            )
            .await;

        match result.outcome {
            TaskOutcome::Success(TaskOutput::Keywords { keywords }) => {
                assert_eq!(keywords, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_reply_is_permanent() {
        let generator = ScriptedGenerator::new()
            .with_script("keyword_extraction", Script::new("not json at all"));
        let (runner, _router) = runner_with(generator);

        let result = runner
            .run_attempt(
                &request("keyword_extraction"),
                &RoleConfig::new("research/keyword-extraction"),
                &CancellationToken::new(),
            )
            .await;

        match result.outcome {
            TaskOutcome::Failure(err) => {
                assert!(matches!(err, TaskError::MalformedOutput(_)));
                assert!(err.is_permanent());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let (runner, _router) = runner_with(ScriptedGenerator::research_demo());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner
            .run_attempt(
                &request("keyword_extraction"),
                &RoleConfig::new("research/keyword-extraction"),
                &cancel,
            )
            .await;

        match result.outcome {
            TaskOutcome::Failure(err) => assert!(err.is_cancelled()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_task_emits_chunks_then_done() {
        let (runner, router) = runner_with(ScriptedGenerator::research_demo());
        let session_id = SessionId::new("s-runner");
        let mut sub = router.subscribe(&session_id);

        let result = runner
            .run_attempt(
                &AgentTaskRequest::new(
                    session_id.clone(),
                    "question_refinement",
                    serde_json::json!({}),
                )
                .with_lane(Lane::Stream),
                &RoleConfig::new("research/question-refinement").with_lane(Lane::Stream),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.outcome.is_success());

        let mut chunk_count = 0u64;
        loop {
            match sub.next_stream().await.unwrap() {
                StreamMessage::Chunk { seq, .. } => {
                    assert_eq!(seq, chunk_count);
                    chunk_count += 1;
                }
                StreamMessage::Done { chunks, .. } => {
                    assert_eq!(chunks, chunk_count);
                    break;
                }
            }
        }
        assert_eq!(chunk_count, 3);
    }

    #[tokio::test]
    async fn test_default_lane_emits_nothing() {
        let (runner, router) = runner_with(ScriptedGenerator::research_demo());
        let session_id = SessionId::new("s-runner");
        let mut sub = router.subscribe(&session_id);

        let result = runner
            .run_attempt(
                &AgentTaskRequest::new(
                    session_id.clone(),
                    "keyword_extraction",
                    serde_json::json!({}),
                ),
                &RoleConfig::new("research/keyword-extraction"),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.outcome.is_success());

        router.close_session(&session_id);
        assert!(sub.next_stream().await.is_none());
    }
}
