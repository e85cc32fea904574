//! Agent task dispatch.
//!
//! Submissions enter through [`Dispatcher::submit`]; each accepted task runs
//! on a bounded lane, retries transient failures per its role's policy, and
//! ends in the reconciler. The dispatcher enforces single-flight per
//! (session, task type) and at-most-once execution per idempotency key.

mod dispatcher;
mod retry;
mod types;

pub use dispatcher::Dispatcher;
pub use retry::RetryPolicy;
pub use types::{
    AgentTaskRequest, AgentTaskResult, FlightInfo, IdempotencyKey, Lane, SubmitAck, TaskOutcome,
    TaskOutput, TaskType,
};
