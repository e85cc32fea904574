//! Task dispatch: bounded lanes, single-flight, dedup and retry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::types::{
    AgentTaskRequest, AgentTaskResult, FlightInfo, IdempotencyKey, Lane, SubmitAck, TaskOutcome,
    TaskType,
};
use crate::agent::{RoleConfig, RoleRegistry, TaskRunner};
use crate::config::DispatchConfig;
use crate::error::{Result, TaskError, WorkflowError};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::session::{SessionId, SessionStore};

type FlightKey = (SessionId, TaskType);

struct Flight {
    idempotency_key: IdempotencyKey,
    issued_version: u64,
    cancel: CancellationToken,
}

struct CachedOutcome {
    finished_at: Instant,
}

struct QueuedTask {
    request: AgentTaskRequest,
    role: RoleConfig,
}

/// Accepts task submissions and drives them to a reconciled end.
///
/// Guarantees, in order of how much they cost when broken:
/// - at most one task per (session, task type) is in flight at a time
/// - a given idempotency key executes at most once
/// - lanes are bounded; saturation is an error at submit time, not an
///   unbounded queue
/// - transient failures retry with backoff, permanent ones do not
/// - cancellation releases the slot immediately and late results of a
///   cancelled task are discarded, never merged
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: DispatchConfig,
    roles: Arc<dyn RoleRegistry>,
    runner: TaskRunner,
    reconciler: Reconciler,
    store: SessionStore,
    lanes: HashMap<Lane, mpsc::Sender<QueuedTask>>,
    /// Single-flight index, one entry per (session, task type) in flight.
    flights: DashMap<FlightKey, Flight>,
    /// Reverse index from idempotency key to its flight.
    by_key: DashMap<IdempotencyKey, FlightKey>,
    /// Keys that finished recently; answers duplicates until the TTL runs out.
    recent: DashMap<IdempotencyKey, CachedOutcome>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        roles: Arc<dyn RoleRegistry>,
        runner: TaskRunner,
        reconciler: Reconciler,
        store: SessionStore,
    ) -> Self {
        let (default_tx, default_rx) = mpsc::channel(config.queue_depth);
        let (stream_tx, stream_rx) = mpsc::channel(config.queue_depth);
        let mut lanes = HashMap::new();
        lanes.insert(Lane::Default, default_tx);
        lanes.insert(Lane::Stream, stream_tx);

        let default_workers = config.default_workers;
        let stream_workers = config.stream_workers;

        let inner = Arc::new(DispatcherInner {
            config,
            roles,
            runner,
            reconciler,
            store,
            lanes,
            flights: DashMap::new(),
            by_key: DashMap::new(),
            recent: DashMap::new(),
        });

        spawn_lane(Arc::downgrade(&inner), Lane::Default, default_rx, default_workers);
        spawn_lane(Arc::downgrade(&inner), Lane::Stream, stream_rx, stream_workers);

        Self { inner }
    }

    /// Submit a task for execution. See [`SubmitAck`] for the two ways a
    /// submission can be accepted.
    pub fn submit(&self, request: AgentTaskRequest) -> Result<SubmitAck> {
        self.inner.submit(request)
    }

    /// Cancel the in-flight task for (session, task type), if any. Returns
    /// whether something was actually cancelled. The slot frees immediately;
    /// whatever the worker still produces is discarded.
    pub fn cancel(&self, session_id: &SessionId, task_type: &TaskType) -> bool {
        self.inner.cancel(session_id, task_type)
    }

    /// Cancel everything in flight for a session. Used when it closes.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        self.inner.cancel_session(session_id)
    }

    pub fn in_flight(&self, session_id: &SessionId, task_type: &TaskType) -> bool {
        self.inner
            .flights
            .contains_key(&(session_id.clone(), task_type.clone()))
    }
}

fn spawn_lane(
    inner: Weak<DispatcherInner>,
    lane: Lane,
    mut rx: mpsc::Receiver<QueuedTask>,
    workers: usize,
) {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(workers));
        while let Some(task) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                inner.execute(task).await;
                drop(permit);
            });
        }
        debug!(lane = %lane, "Lane pump stopped");
    });
}

impl DispatcherInner {
    fn submit(&self, request: AgentTaskRequest) -> Result<SubmitAck> {
        let Some(role) = self.roles.role(&request.task_type) else {
            return Err(WorkflowError::TaskTypeUnknown(request.task_type.to_string()));
        };
        // Also validates the session exists.
        let issued_version = self.store.version(&request.session_id)?;

        self.prune_recent();
        // A key whose result is still cached gets the cached acceptance and
        // nothing re-runs.
        if self.recent.contains_key(&request.idempotency_key) {
            debug!(
                idempotency_key = %request.idempotency_key,
                "Duplicate submission answered from result cache"
            );
            return Ok(SubmitAck::Deduplicated);
        }
        // A key still in flight is a duplicate the caller must wait out.
        if self.by_key.contains_key(&request.idempotency_key) {
            return Err(WorkflowError::DuplicateInFlight {
                session_id: request.session_id.to_string(),
                task_type: request.task_type.to_string(),
            });
        }

        let flight_key = (request.session_id.clone(), request.task_type.clone());
        match self.flights.entry(flight_key.clone()) {
            Entry::Occupied(_) => {
                return Err(WorkflowError::DuplicateInFlight {
                    session_id: request.session_id.to_string(),
                    task_type: request.task_type.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Flight {
                    idempotency_key: request.idempotency_key.clone(),
                    issued_version,
                    cancel: CancellationToken::new(),
                });
            }
        }
        self.by_key
            .insert(request.idempotency_key.clone(), flight_key.clone());

        let lane = request.lane;
        let Some(sender) = self.lanes.get(&lane) else {
            self.release(&flight_key, &request.idempotency_key);
            return Err(WorkflowError::Other(format!("no such lane: {}", lane)));
        };

        let session_id = request.session_id.clone();
        let task_type = request.task_type.clone();
        match sender.try_send(QueuedTask { request, role }) {
            Ok(()) => {
                info!(
                    session_id = %session_id,
                    task_type = %task_type,
                    lane = %lane,
                    issued_version,
                    "Task enqueued"
                );
                Ok(SubmitAck::Enqueued)
            }
            Err(TrySendError::Full(task)) => {
                self.release(&flight_key, &task.request.idempotency_key);
                warn!(lane = %lane, "Lane saturated, task rejected");
                Err(WorkflowError::LaneSaturated(lane.to_string()))
            }
            Err(TrySendError::Closed(task)) => {
                self.release(&flight_key, &task.request.idempotency_key);
                Err(WorkflowError::Other("dispatcher is shut down".to_string()))
            }
        }
    }

    async fn execute(self: Arc<Self>, task: QueuedTask) {
        let QueuedTask { request, role } = task;
        let flight_key = (request.session_id.clone(), request.task_type.clone());

        // The flight may have been cancelled (and possibly replaced) while
        // this task sat in the queue.
        let cancel = {
            let Some(flight) = self.flights.get(&flight_key) else {
                debug!(
                    session_id = %request.session_id,
                    task_type = %request.task_type,
                    "Flight released while queued, dropping task"
                );
                return;
            };
            if flight.idempotency_key != request.idempotency_key {
                debug!(
                    session_id = %request.session_id,
                    task_type = %request.task_type,
                    "Flight superseded while queued, dropping task"
                );
                return;
            }
            flight.cancel.clone()
        };

        let result = self.run_with_retry(&request, &role, &cancel).await;
        self.finish(result);
    }

    async fn run_with_retry(
        &self,
        request: &AgentTaskRequest,
        role: &RoleConfig,
        cancel: &CancellationToken,
    ) -> AgentTaskResult {
        let mut attempt: u32 = 1;
        loop {
            let result = self.runner.run_attempt(request, role, cancel).await;
            match &result.outcome {
                TaskOutcome::Failure(err)
                    if !err.is_cancelled() && role.retry.should_retry(attempt, err) =>
                {
                    let delay = role.retry.delay_after(attempt, err);
                    warn!(
                        session_id = %request.session_id,
                        task_type = %request.task_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return AgentTaskResult::new(
                                request,
                                TaskOutcome::Failure(TaskError::Cancelled),
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                _ => return result,
            }
        }
    }

    /// Reconcile the final result, then release the single-flight slot and
    /// remember the key. Release happens after reconciliation so a fresh
    /// submission cannot start until this result has fully landed.
    fn finish(&self, result: AgentTaskResult) {
        let flight_key = (result.session_id.clone(), result.task_type.clone());
        let key = result.idempotency_key.clone();

        let flight_info = self.flights.get(&flight_key).and_then(|flight| {
            (flight.idempotency_key == key).then_some(FlightInfo {
                issued_version: flight.issued_version,
            })
        });

        let outcome = self.reconciler.reconcile(result, flight_info);
        match outcome {
            Err(WorkflowError::UnknownRequest(_)) | Ok(ReconcileOutcome::Discarded) => {
                // Cancelled underneath us; cancel() already freed the slot
                // and the key stays usable for a fresh submission.
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "Result not applied");
            }
        }

        self.release(&flight_key, &key);
        self.recent.insert(
            key,
            CachedOutcome {
                finished_at: Instant::now(),
            },
        );
    }

    fn cancel(&self, session_id: &SessionId, task_type: &TaskType) -> bool {
        let flight_key = (session_id.clone(), task_type.clone());
        let Some((_, flight)) = self.flights.remove(&flight_key) else {
            return false;
        };
        flight.cancel.cancel();
        self.by_key.remove(&flight.idempotency_key);
        info!(
            session_id = %session_id,
            task_type = %task_type,
            "Task cancelled"
        );
        true
    }

    fn cancel_session(&self, session_id: &SessionId) -> usize {
        let keys: Vec<FlightKey> = self
            .flights
            .iter()
            .filter(|entry| entry.key().0 == *session_id)
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter()
            .filter(|(sid, task_type)| self.cancel(sid, task_type))
            .count()
    }

    /// Remove a flight entry, but only if it still belongs to `key`; a
    /// cancel-and-resubmit may have replaced it with a newer flight.
    fn release(&self, flight_key: &FlightKey, key: &IdempotencyKey) {
        if let Entry::Occupied(entry) = self.flights.entry(flight_key.clone())
            && entry.get().idempotency_key == *key
        {
            entry.remove();
        }
        self.by_key.remove(key);
    }

    fn prune_recent(&self) {
        let ttl = Duration::from_secs(self.config.result_cache_ttl_secs);
        self.recent
            .retain(|_, cached| cached.finished_at.elapsed() < ttl);
    }
}
