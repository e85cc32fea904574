//! The workflow facade: sessions, gated transitions, task submission and
//! subscription, wired over the store, dispatcher and router.

use std::sync::Arc;

use tracing::info;

use crate::agent::{Generator, RoleRegistry, TaskRunner};
use crate::config::PilotConfig;
use crate::delivery::{ChannelRouter, Subscriber};
use crate::dispatch::{AgentTaskRequest, Dispatcher, IdempotencyKey, SubmitAck, TaskType};
use crate::error::{Result, WorkflowError};
use crate::phase::{GateEvaluator, Phase};
use crate::reconcile::{Reconciler, SessionMutation};
use crate::session::{
    Author, NullPersistence, QuestionStatus, ScopeElement, SessionId, SessionSnapshot,
    SessionStore, SnapshotPersistence, SqliteSnapshots,
};

/// Owns every moving part of one workflow deployment. Callers hold a
/// Coordinator and nothing else; all state flows through it.
///
/// Construction spawns the lane pumps, so it must run inside a tokio
/// runtime.
pub struct Coordinator {
    store: SessionStore,
    gate: GateEvaluator,
    dispatcher: Dispatcher,
    router: Arc<ChannelRouter>,
    roles: Arc<dyn RoleRegistry>,
}

impl Coordinator {
    pub fn new(
        config: &PilotConfig,
        roles: Arc<dyn RoleRegistry>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(ChannelRouter::new(config.delivery.clone()));
        let persistence: Arc<dyn SnapshotPersistence> = match &config.store.snapshot_db {
            Some(path) => Arc::new(SqliteSnapshots::new(path.clone())?),
            None => Arc::new(NullPersistence),
        };
        let store = SessionStore::new(persistence, router.clone())?;
        let gate = GateEvaluator::new(&config.gate);
        let runner = TaskRunner::new(generator, router.clone());
        let reconciler = Reconciler::new(store.clone(), router.clone());
        let dispatcher = Dispatcher::new(
            config.dispatch.clone(),
            roles.clone(),
            runner,
            reconciler,
            store.clone(),
        );

        Ok(Self {
            store,
            gate,
            dispatcher,
            router,
            roles,
        })
    }

    pub fn create_session(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        let snapshot = self.store.create(session_id)?;
        info!(session_id = %snapshot.session_id, "Session created");
        Ok(snapshot)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        self.store.get(session_id)
    }

    /// Open both push channels for a session. The returned subscriber is
    /// independent of others; dropping it never affects delivery elsewhere.
    pub fn subscribe(&self, session_id: &SessionId) -> Result<Subscriber> {
        let snapshot = self.store.get(session_id)?;
        ensure_open(&snapshot)?;
        Ok(self.router.subscribe(session_id))
    }

    /// Move a session to `target`, gated and version-checked.
    ///
    /// Evaluation and application happen inside one store commit, so the
    /// decision can never be approved against one snapshot and applied to
    /// a newer one. Closing a session cancels its in-flight tasks and
    /// retires its delivery hub; the Closed snapshot is still delivered to
    /// subscribers before the hub goes away.
    pub fn request_transition(
        &self,
        session_id: &SessionId,
        target: Phase,
        expected_version: u64,
    ) -> Result<SessionSnapshot> {
        let gate = &self.gate;
        let mut from = Phase::default();
        let updated = self
            .store
            .apply(session_id, Some(expected_version), |snapshot| {
                let decision = gate.evaluate(snapshot, target);
                if !decision.allowed() {
                    return Err(WorkflowError::GateDenied {
                        from: decision.from,
                        to: decision.to,
                        reasons: decision.reasons,
                    });
                }
                from = snapshot.phase;
                snapshot.phase = target;
                // Rolling back to Initiation reopens the question; bumping
                // its revision turns any in-flight question task stale.
                if from == Phase::Exploration && target == Phase::Initiation {
                    snapshot.question.status = QuestionStatus::Draft;
                    snapshot.question.revision = snapshot.version;
                }
                Ok(())
            })?;

        info!(
            session_id = %session_id,
            from = %from,
            to = %target,
            version = updated.version,
            "Phase transition applied"
        );

        if target == Phase::Closed {
            let cancelled = self.dispatcher.cancel_session(session_id);
            if cancelled > 0 {
                info!(
                    session_id = %session_id,
                    cancelled,
                    "Cancelled in-flight tasks on close"
                );
            }
            self.router.close_session(session_id);
        }

        Ok(updated)
    }

    /// Submit an agent task. The lane comes from the task's role; pass a
    /// key to make the submission safe to repeat.
    pub fn submit_agent_task(
        &self,
        session_id: &SessionId,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<SubmitAck> {
        let task_type = task_type.into();
        let snapshot = self.store.get(session_id)?;
        ensure_open(&snapshot)?;
        let Some(role) = self.roles.role(&task_type) else {
            return Err(WorkflowError::TaskTypeUnknown(task_type.into_inner()));
        };

        let mut request =
            AgentTaskRequest::new(session_id.clone(), task_type, payload).with_lane(role.lane);
        if let Some(key) = idempotency_key {
            request = request.with_key(key);
        }
        self.dispatcher.submit(request)
    }

    pub fn cancel_task(&self, session_id: &SessionId, task_type: &TaskType) -> bool {
        self.dispatcher.cancel(session_id, task_type)
    }

    /// Replace the draft question text. Locked questions reject the edit.
    pub fn update_question(
        &self,
        session_id: &SessionId,
        expected_version: u64,
        text: impl Into<String>,
    ) -> Result<SessionSnapshot> {
        let text = text.into();
        self.store
            .apply(session_id, Some(expected_version), |snapshot| {
                ensure_open(snapshot)?;
                if snapshot.question.is_locked() {
                    return Err(WorkflowError::QuestionLocked);
                }
                snapshot.question.text = text;
                snapshot.question.revision = snapshot.version;
                Ok(())
            })
    }

    /// Lock the question so gates that require it can pass. Locking does
    /// not touch the revision: the text is unchanged, and agent results
    /// computed against it stay valid.
    pub fn lock_question(
        &self,
        session_id: &SessionId,
        expected_version: u64,
    ) -> Result<SessionSnapshot> {
        self.store
            .apply(session_id, Some(expected_version), |snapshot| {
                ensure_open(snapshot)?;
                if snapshot.question.text.trim().is_empty() {
                    return Err(WorkflowError::Other(
                        "cannot lock an empty question".to_string(),
                    ));
                }
                snapshot.question.status = QuestionStatus::Locked;
                Ok(())
            })
    }

    pub fn add_keywords(
        &self,
        session_id: &SessionId,
        expected_version: u64,
        keywords: Vec<String>,
    ) -> Result<SessionSnapshot> {
        self.store
            .apply(session_id, Some(expected_version), |snapshot| {
                ensure_open(snapshot)?;
                let issued = snapshot.version;
                SessionMutation::MergeKeywords(keywords).apply(snapshot, issued)
            })
    }

    pub fn add_scope_element(
        &self,
        session_id: &SessionId,
        expected_version: u64,
        element: ScopeElement,
    ) -> Result<SessionSnapshot> {
        self.store
            .apply(session_id, Some(expected_version), |snapshot| {
                ensure_open(snapshot)?;
                let issued = snapshot.version;
                SessionMutation::AppendScopeElements(vec![element]).apply(snapshot, issued)
            })
    }

    pub fn add_reflection(
        &self,
        session_id: &SessionId,
        expected_version: u64,
        text: impl Into<String>,
    ) -> Result<SessionSnapshot> {
        let text = text.into();
        self.store
            .apply(session_id, Some(expected_version), |snapshot| {
                ensure_open(snapshot)?;
                let issued = snapshot.version;
                SessionMutation::AppendReflection {
                    author: Author::User,
                    text,
                }
                .apply(snapshot, issued)
            })
    }
}

fn ensure_open(snapshot: &SessionSnapshot) -> Result<()> {
    if snapshot.phase.is_terminal() {
        return Err(WorkflowError::SessionClosed(
            snapshot.session_id.to_string(),
        ));
    }
    Ok(())
}
