use thiserror::Error;

use crate::phase::Phase;

/// Failure reported by an agent task attempt.
///
/// The dispatcher retries transient failures with backoff and gives up
/// immediately on permanent ones, so classification here decides whether
/// a task gets another attempt at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    Timeout {
        duration_secs: u64,
    },
    RateLimited {
        retry_after_secs: Option<u64>,
    },
    Provider(String),
    InvalidInput(String),
    MalformedOutput(String),
    Cancelled,
    Other(String),
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Provider(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Parse a raw provider message into a structured TaskError.
    /// Only matches unambiguous patterns (HTTP codes, explicit keywords);
    /// anything else stays Other and is treated as permanent.
    pub fn from_message(msg: &str) -> Self {
        if msg.contains("429") || msg.contains("Too Many Requests") {
            return Self::RateLimited {
                retry_after_secs: Self::extract_retry_after(msg),
            };
        }
        if msg.contains("502") || msg.contains("503") || msg.contains("504") {
            return Self::Provider(msg.to_string());
        }
        if msg.contains("timed out after") || msg.contains("timeout after") {
            return Self::Timeout { duration_secs: 60 };
        }
        Self::Other(msg.to_string())
    }

    fn extract_retry_after(msg: &str) -> Option<u64> {
        let msg_lower = msg.to_lowercase();
        for pattern in ["retry after ", "retry-after: ", "retry_after="] {
            if let Some(idx) = msg_lower.find(pattern) {
                let after_pattern = &msg_lower[idx + pattern.len()..];
                let num_str: String = after_pattern
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if let Ok(secs) = num_str.parse() {
                    return Some(secs);
                }
            }
        }
        None
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { duration_secs } => {
                write!(f, "Timeout after {}s", duration_secs)
            }
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "Rate limited, retry after {}s", secs)
                } else {
                    write!(f, "Rate limited")
                }
            }
            Self::Provider(msg) => write!(f, "Provider error: {}", msg),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Self::MalformedOutput(msg) => write!(f, "Malformed output: {}", msg),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Transition denied: {from} -> {to}: {}", reasons.join("; "))]
    GateDenied {
        from: Phase,
        to: Phase,
        reasons: Vec<String>,
    },

    #[error("Task already in flight: {session_id}/{task_type}")]
    DuplicateInFlight {
        session_id: String,
        task_type: String,
    },

    #[error("Lane saturated: {0}")]
    LaneSaturated(String),

    #[error("Unknown task type: {0}")]
    TaskTypeUnknown(String),

    #[error("Stale result rejected: {0}")]
    StaleResult(String),

    #[error("No in-flight task for result: {0}")]
    UnknownRequest(String),

    #[error("Question is locked")]
    QuestionLocked,

    #[error("Agent task failed: {0}")]
    TaskFailed(String),

    #[error("Subscriber channel closed: {0}")]
    SubscriberGone(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

impl From<TaskError> for WorkflowError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => WorkflowError::TaskFailed("cancelled".to_string()),
            other => WorkflowError::TaskFailed(other.to_string()),
        }
    }
}
