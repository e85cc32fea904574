//! Wire types exchanged between submitters, workers and the reconciler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::session::{ScopeElement, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(pub(crate) String);

impl TaskType {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TaskType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Client-chosen key that makes a submission safe to repeat. Two submissions
/// with the same key execute at most once between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub(crate) String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for IdempotencyKey {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Execution lane for a task type. Stream tasks emit partial chunks while
/// they run; default tasks answer in one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    #[default]
    Default,
    Stream,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request to run one agent task against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskRequest {
    pub session_id: SessionId,
    pub task_type: TaskType,
    pub idempotency_key: IdempotencyKey,
    /// Task-specific input, passed through to the generator untouched.
    pub payload: serde_json::Value,
    /// Declared lane; routing follows this, and only stream-lane tasks
    /// emit partial chunks.
    #[serde(default)]
    pub lane: Lane,
}

impl AgentTaskRequest {
    pub fn new(
        session_id: SessionId,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            task_type: task_type.into(),
            idempotency_key: IdempotencyKey::generate(),
            payload,
            lane: Lane::Default,
        }
    }

    pub fn with_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }
}

/// Structured output of a successful agent task. The variant decides which
/// session mutation the reconciler applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutput {
    RefinedQuestion {
        text: String,
    },
    Keywords {
        keywords: Vec<String>,
    },
    ScopeElements {
        elements: Vec<ScopeElement>,
    },
    Feasibility {
        score: u8,
        is_niche: bool,
        summary: String,
    },
    Reflection {
        text: String,
    },
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(TaskOutput),
    Failure(TaskError),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// What a worker hands to the reconciler after the final attempt.
#[derive(Debug, Clone)]
pub struct AgentTaskResult {
    pub session_id: SessionId,
    pub task_type: TaskType,
    pub idempotency_key: IdempotencyKey,
    pub outcome: TaskOutcome,
    pub produced_at: DateTime<Utc>,
}

impl AgentTaskResult {
    pub fn new(request: &AgentTaskRequest, outcome: TaskOutcome) -> Self {
        Self {
            session_id: request.session_id.clone(),
            task_type: request.task_type.clone(),
            idempotency_key: request.idempotency_key.clone(),
            outcome,
            produced_at: Utc::now(),
        }
    }
}

/// Answer to a task submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAck {
    /// Task entered its lane queue.
    Enqueued,
    /// The idempotency key was already seen; nothing new was enqueued.
    Deduplicated,
}

/// What the dispatcher knew about a task when it left the queue. The
/// reconciler uses the issued version to detect results that raced a
/// question change.
#[derive(Debug, Clone, Copy)]
pub struct FlightInfo {
    pub issued_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_output_tagging() {
        let output = TaskOutput::Keywords {
            keywords: vec!["soil".to_string(), "erosion".to_string()],
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"type\":\"keywords\""));

        let parsed: TaskOutput = serde_json::from_str(
            r#"{"type":"feasibility","score":7,"is_niche":false,"summary":"plenty of sources"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            TaskOutput::Feasibility {
                score: 7,
                is_niche: false,
                summary: "plenty of sources".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_output_type_rejected() {
        let parsed: std::result::Result<TaskOutput, _> =
            serde_json::from_str(r#"{"type":"telemetry","value":1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = AgentTaskRequest::new(
            crate::session::SessionId::new("s-1"),
            "keyword_extraction",
            serde_json::json!({"question": "why"}),
        )
        .with_key("client-key-1");
        assert_eq!(request.idempotency_key.as_str(), "client-key-1");
        assert_eq!(request.task_type.as_str(), "keyword_extraction");
    }

    #[test]
    fn test_lane_serde() {
        assert_eq!(serde_json::to_string(&Lane::Stream).unwrap(), "\"stream\"");
        let lane: Lane = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(lane, Lane::Default);
    }
}
