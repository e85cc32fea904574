//! Applies final task results to session state.

use std::sync::Arc;

use tracing::{debug, warn};

use super::mutation::SessionMutation;
use crate::delivery::{ChannelRouter, StateNotice};
use crate::dispatch::{AgentTaskResult, FlightInfo, TaskOutcome};
use crate::error::{Result, WorkflowError};
use crate::session::SessionStore;

/// What reconciliation did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Output merged; a new snapshot committed and was pushed.
    Applied,
    /// Terminal failure recorded as a state notice; session untouched.
    FailureRecorded,
    /// Cancelled leftovers, dropped without any notice.
    Discarded,
}

pub struct Reconciler {
    store: SessionStore,
    router: Arc<ChannelRouter>,
}

impl Reconciler {
    pub fn new(store: SessionStore, router: Arc<ChannelRouter>) -> Self {
        Self { store, router }
    }

    /// Reconcile the final result of a task.
    ///
    /// `flight` is the dispatcher's record for the idempotency key; a
    /// result arriving without one is unknown and rejected. Successful
    /// outputs merge through the store's serialized write path, so the
    /// staleness guard and the commit are atomic. Stale and locked-out
    /// results reject with an error after a `TaskStale` notice; they never
    /// silently vanish and never overwrite newer state.
    pub fn reconcile(
        &self,
        result: AgentTaskResult,
        flight: Option<FlightInfo>,
    ) -> Result<ReconcileOutcome> {
        let Some(flight) = flight else {
            debug!(
                idempotency_key = %result.idempotency_key,
                "Result for unknown request dropped"
            );
            return Err(WorkflowError::UnknownRequest(
                result.idempotency_key.to_string(),
            ));
        };

        match result.outcome {
            TaskOutcome::Success(output) => {
                let mutation = SessionMutation::from_output(output);
                let applied = self.store.apply(&result.session_id, None, |snapshot| {
                    mutation.apply(snapshot, flight.issued_version)
                });
                match applied {
                    Ok(snapshot) => {
                        debug!(
                            session_id = %result.session_id,
                            task_type = %result.task_type,
                            version = snapshot.version,
                            "Task result applied"
                        );
                        Ok(ReconcileOutcome::Applied)
                    }
                    Err(err) if is_rejection(&err) => {
                        warn!(
                            session_id = %result.session_id,
                            task_type = %result.task_type,
                            reason = %err,
                            "Task result rejected as stale"
                        );
                        self.router.publish_state(StateNotice::TaskStale {
                            session_id: result.session_id.clone(),
                            task_type: result.task_type.clone(),
                            idempotency_key: result.idempotency_key.clone(),
                            reason: err.to_string(),
                        });
                        Err(err)
                    }
                    Err(other) => Err(other),
                }
            }
            TaskOutcome::Failure(error) if error.is_cancelled() => {
                debug!(
                    session_id = %result.session_id,
                    task_type = %result.task_type,
                    "Cancelled result discarded"
                );
                Ok(ReconcileOutcome::Discarded)
            }
            TaskOutcome::Failure(error) => {
                warn!(
                    session_id = %result.session_id,
                    task_type = %result.task_type,
                    error = %error,
                    "Task failed"
                );
                self.router.publish_state(StateNotice::TaskFailed {
                    session_id: result.session_id.clone(),
                    task_type: result.task_type.clone(),
                    idempotency_key: result.idempotency_key.clone(),
                    error: error.to_string(),
                });
                Ok(ReconcileOutcome::FailureRecorded)
            }
        }
    }
}

fn is_rejection(err: &WorkflowError) -> bool {
    matches!(
        err,
        WorkflowError::StaleResult(_) | WorkflowError::QuestionLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::dispatch::{AgentTaskRequest, TaskOutput};
    use crate::error::TaskError;
    use crate::session::{SessionId, SessionStore};

    fn setup() -> (Reconciler, SessionStore, Arc<ChannelRouter>, SessionId) {
        let router = Arc::new(ChannelRouter::new(DeliveryConfig::default()));
        let store = SessionStore::new(
            Arc::new(crate::session::NullPersistence),
            router.clone(),
        )
        .unwrap();
        let id = SessionId::new("r-1");
        store.create(id.clone()).unwrap();
        (
            Reconciler::new(store.clone(), router.clone()),
            store,
            router,
            id,
        )
    }

    fn result_for(id: &SessionId, output: TaskOutput) -> AgentTaskResult {
        let request = AgentTaskRequest::new(id.clone(), "keyword_extraction", serde_json::json!({}));
        AgentTaskResult::new(&request, TaskOutcome::Success(output))
    }

    #[test]
    fn test_commutative_output_applies() {
        let (reconciler, store, _router, id) = setup();
        let outcome = reconciler
            .reconcile(
                result_for(
                    &id,
                    TaskOutput::Keywords {
                        keywords: vec!["headwaters".to_string()],
                    },
                ),
                Some(FlightInfo { issued_version: 1 }),
            )
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let snapshot = store.get(&id).unwrap();
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.keywords.contains("headwaters"));
    }

    #[test]
    fn test_unknown_flight_rejected() {
        let (reconciler, store, _router, id) = setup();
        let err = reconciler
            .reconcile(
                result_for(
                    &id,
                    TaskOutput::Keywords {
                        keywords: vec!["x".to_string()],
                    },
                ),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownRequest(_)));
        assert_eq!(store.version(&id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_question_result_rejected_and_surfaced() {
        let (reconciler, store, router, id) = setup();
        let mut sub = router.subscribe(&id);

        // The question changes after the task was issued at version 1.
        store
            .apply(&id, None, |s| {
                s.question.text = "newer text".to_string();
                s.question.revision = s.version;
                Ok(())
            })
            .unwrap();

        let err = reconciler
            .reconcile(
                result_for(
                    &id,
                    TaskOutput::RefinedQuestion {
                        text: "answer to the old question".to_string(),
                    },
                ),
                Some(FlightInfo { issued_version: 1 }),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StaleResult(_)));

        // State kept the newer text and no extra version was committed.
        let snapshot = store.get(&id).unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.question.text, "newer text");

        // Subscribers saw the user's commit, then the stale rejection.
        let first = sub.next_state().await.unwrap();
        assert_eq!(first.version(), Some(2));
        let second = sub.next_state().await.unwrap();
        match second {
            StateNotice::TaskStale { reason, .. } => {
                assert!(reason.contains("version 1"));
            }
            other => panic!("expected stale notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_recorded_without_state_change() {
        let (reconciler, store, router, id) = setup();
        let mut sub = router.subscribe(&id);

        let request =
            AgentTaskRequest::new(id.clone(), "keyword_extraction", serde_json::json!({}));
        let result = AgentTaskResult::new(
            &request,
            TaskOutcome::Failure(TaskError::Timeout { duration_secs: 30 }),
        );
        let outcome = reconciler
            .reconcile(result, Some(FlightInfo { issued_version: 1 }))
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::FailureRecorded);
        assert_eq!(store.version(&id).unwrap(), 1);

        match sub.next_state().await.unwrap() {
            StateNotice::TaskFailed { error, .. } => assert!(error.contains("Timeout")),
            other => panic!("expected failure notice, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_result_discarded_silently() {
        let (reconciler, store, _router, id) = setup();
        let request =
            AgentTaskRequest::new(id.clone(), "keyword_extraction", serde_json::json!({}));
        let result = AgentTaskResult::new(&request, TaskOutcome::Failure(TaskError::Cancelled));
        let outcome = reconciler
            .reconcile(result, Some(FlightInfo { issued_version: 1 }))
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Discarded);
        assert_eq!(store.version(&id).unwrap(), 1);
    }

    #[test]
    fn test_agent_reflection_merges() {
        let (reconciler, store, _router, id) = setup();
        reconciler
            .reconcile(
                result_for(
                    &id,
                    TaskOutput::Reflection {
                        text: "scope may be too broad".to_string(),
                    },
                ),
                Some(FlightInfo { issued_version: 1 }),
            )
            .unwrap();
        let snapshot = store.get(&id).unwrap();
        assert_eq!(
            snapshot.reflections_by(crate::session::Author::Agent),
            1
        );
    }
}
