//! Push messages delivered to session subscribers.

use serde::{Deserialize, Serialize};

use crate::dispatch::{IdempotencyKey, TaskType};
use crate::session::{SessionId, SessionSnapshot};

/// Best-effort partial output from a running stream task. Chunks for one
/// execution carry a per-task sequence number starting at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamMessage {
    Chunk {
        session_id: SessionId,
        task_type: TaskType,
        idempotency_key: IdempotencyKey,
        seq: u64,
        text: String,
    },
    /// Marks the end of a stream task's chunk sequence.
    Done {
        session_id: SessionId,
        task_type: TaskType,
        idempotency_key: IdempotencyKey,
        chunks: u64,
    },
}

impl StreamMessage {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Chunk { session_id, .. } | Self::Done { session_id, .. } => session_id,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Reliable, ordered notification about committed session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateNotice {
    /// A mutation committed at `version`.
    Snapshot {
        session_id: SessionId,
        version: u64,
        snapshot: Box<SessionSnapshot>,
    },
    /// A task exhausted its attempts or failed permanently.
    TaskFailed {
        session_id: SessionId,
        task_type: TaskType,
        idempotency_key: IdempotencyKey,
        error: String,
    },
    /// A task result was rejected because the session moved underneath it.
    /// Nothing was merged; the task can be resubmitted against fresh state.
    TaskStale {
        session_id: SessionId,
        task_type: TaskType,
        idempotency_key: IdempotencyKey,
        reason: String,
    },
    /// Delivery overflowed for this subscriber. Versions may have been
    /// skipped; refetch the session before trusting further snapshots.
    Resync { session_id: SessionId, version: u64 },
}

impl StateNotice {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Snapshot { session_id, .. }
            | Self::TaskFailed { session_id, .. }
            | Self::TaskStale { session_id, .. }
            | Self::Resync { session_id, .. } => session_id,
        }
    }

    /// Committed version this notice pins, when it pins one.
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Snapshot { version, .. } => Some(*version),
            Self::Resync { version, .. } => Some(*version),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskStale { .. } => "task_stale",
            Self::Resync { .. } => "resync",
        }
    }
}

/// Envelope tagged with the channel a message travels on, for clients that
/// multiplex both channels over one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum PushMessage {
    Stream(StreamMessage),
    State(StateNotice),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_tagging() {
        let message = PushMessage::Stream(StreamMessage::Chunk {
            session_id: SessionId::new("s-1"),
            task_type: TaskType::new("question_refinement"),
            idempotency_key: IdempotencyKey::new("k-1"),
            seq: 0,
            text: "What if".to_string(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["channel"], "stream");
        assert_eq!(json["kind"], "chunk");
        assert_eq!(json["seq"], 0);
    }

    #[test]
    fn test_state_notice_version() {
        let resync = StateNotice::Resync {
            session_id: SessionId::new("s-1"),
            version: 9,
        };
        assert_eq!(resync.version(), Some(9));
        assert_eq!(resync.kind(), "resync");

        let failed = StateNotice::TaskFailed {
            session_id: SessionId::new("s-1"),
            task_type: TaskType::new("keyword_extraction"),
            idempotency_key: IdempotencyKey::new("k-2"),
            error: "timeout".to_string(),
        };
        assert_eq!(failed.version(), None);
    }
}
