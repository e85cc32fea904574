pub mod agent;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod phase;
pub mod reconcile;
pub mod session;

pub use agent::{Generator, RoleConfig, RoleRegistry, RoleTable, ScriptedGenerator};
pub use config::PilotConfig;
pub use coordinator::Coordinator;
pub use delivery::{ChannelRouter, PushMessage, StateNotice, StreamMessage, Subscriber};
pub use dispatch::{
    AgentTaskRequest, AgentTaskResult, Dispatcher, IdempotencyKey, Lane, RetryPolicy, SubmitAck,
    TaskOutcome, TaskOutput, TaskType,
};
pub use error::{Result, TaskError, WorkflowError};
pub use phase::{GateDecision, GateEvaluator, Phase};
pub use session::{
    Author, FeasibilityAssessment, FeasibilityStatus, Question, QuestionStatus, ScopeElement,
    SessionId, SessionSnapshot, SessionStore,
};
