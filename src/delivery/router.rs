//! Per-session fan-out of stream chunks and state notices.
//!
//! The two channels have different delivery contracts. Stream messages are
//! best effort: a slow subscriber loses the oldest chunks and keeps going.
//! State notices never arrive out of order or with a silent gap: when a
//! subscriber's buffer overflows it is marked stale, withheld from further
//! pushes, and handed an explicit resync notice once it drains.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::messages::{StateNotice, StreamMessage};
use crate::config::DeliveryConfig;
use crate::dispatch::{IdempotencyKey, TaskType};
use crate::session::{SessionId, SessionSnapshot, StateSink};

#[derive(Debug)]
struct SubscriberFlags {
    stale: AtomicBool,
}

struct StateSubscriber {
    tx: mpsc::Sender<StateNotice>,
    flags: Arc<SubscriberFlags>,
}

struct SessionHub {
    stream_tx: broadcast::Sender<StreamMessage>,
    state_subs: parking_lot::Mutex<Vec<StateSubscriber>>,
    /// Highest committed version seen, reported in resync notices.
    last_version: Arc<AtomicU64>,
}

pub struct ChannelRouter {
    config: DeliveryConfig,
    hubs: DashMap<SessionId, Arc<SessionHub>>,
}

impl ChannelRouter {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            hubs: DashMap::new(),
        }
    }

    fn hub(&self, session_id: &SessionId) -> Arc<SessionHub> {
        self.hubs
            .entry(session_id.clone())
            .or_insert_with(|| {
                let (stream_tx, _) = broadcast::channel(self.config.stream_buffer);
                Arc::new(SessionHub {
                    stream_tx,
                    state_subs: parking_lot::Mutex::new(Vec::new()),
                    last_version: Arc::new(AtomicU64::new(0)),
                })
            })
            .clone()
    }

    pub fn subscribe(&self, session_id: &SessionId) -> Subscriber {
        let hub = self.hub(session_id);
        let (tx, rx) = mpsc::channel(self.config.state_buffer);
        let flags = Arc::new(SubscriberFlags {
            stale: AtomicBool::new(false),
        });
        hub.state_subs.lock().push(StateSubscriber {
            tx,
            flags: flags.clone(),
        });
        Subscriber {
            session_id: session_id.clone(),
            stream_rx: hub.stream_tx.subscribe(),
            state_rx: rx,
            flags,
            last_version: hub.last_version.clone(),
        }
    }

    /// Drop the session's hub. Subscribers drain what they have buffered
    /// and then see end-of-channel.
    pub fn close_session(&self, session_id: &SessionId) {
        if self.hubs.remove(session_id).is_some() {
            debug!(session_id = %session_id, "Delivery hub closed");
        }
    }

    pub fn publish_stream(&self, message: StreamMessage) {
        let Some(hub) = self.hubs.get(message.session_id()) else {
            return;
        };
        // Err means no live receivers, which is fine for best-effort chunks.
        let _ = hub.stream_tx.send(message);
    }

    pub fn publish_state(&self, notice: StateNotice) {
        let Some(hub) = self.hubs.get(notice.session_id()) else {
            return;
        };
        if let Some(version) = notice.version() {
            hub.last_version.store(version, Ordering::SeqCst);
        }
        let mut subs = hub.state_subs.lock();
        subs.retain(|sub| {
            if sub.flags.stale.load(Ordering::SeqCst) {
                // Withheld until the subscriber consumes its resync.
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(notice.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.flags.stale.store(true, Ordering::SeqCst);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Emitter for one stream task execution. Only stream-lane tasks get a
    /// live emitter; for default-lane tasks `enabled` is false and emitted
    /// chunks go nowhere.
    pub(crate) fn chunk_emitter(
        self: &Arc<Self>,
        session_id: SessionId,
        task_type: TaskType,
        idempotency_key: IdempotencyKey,
        enabled: bool,
    ) -> ChunkEmitter {
        ChunkEmitter {
            router: Arc::clone(self),
            session_id,
            task_type,
            idempotency_key,
            seq: AtomicU64::new(0),
            enabled,
        }
    }
}

impl StateSink for ChannelRouter {
    fn state_committed(&self, snapshot: &SessionSnapshot) {
        if !self.hubs.contains_key(&snapshot.session_id) {
            return;
        }
        self.publish_state(StateNotice::Snapshot {
            session_id: snapshot.session_id.clone(),
            version: snapshot.version,
            snapshot: Box::new(snapshot.clone()),
        });
    }
}

/// Receiving end of both channels for one subscriber.
#[derive(Debug)]
pub struct Subscriber {
    session_id: SessionId,
    stream_rx: broadcast::Receiver<StreamMessage>,
    state_rx: mpsc::Receiver<StateNotice>,
    flags: Arc<SubscriberFlags>,
    last_version: Arc<AtomicU64>,
}

impl Subscriber {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next state notice, in commit order.
    ///
    /// Buffered notices are drained first. Once the buffer is empty a
    /// pending overflow surfaces as a single `Resync` carrying the latest
    /// committed version, after which delivery resumes. Returns None when
    /// the session's hub is gone and the buffer is exhausted.
    pub async fn next_state(&mut self) -> Option<StateNotice> {
        match self.state_rx.try_recv() {
            Ok(notice) => Some(notice),
            Err(mpsc::error::TryRecvError::Empty) => {
                if self.flags.stale.swap(false, Ordering::SeqCst) {
                    return Some(StateNotice::Resync {
                        session_id: self.session_id.clone(),
                        version: self.last_version.load(Ordering::SeqCst),
                    });
                }
                self.state_rx.recv().await
            }
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if self.flags.stale.swap(false, Ordering::SeqCst) {
                    return Some(StateNotice::Resync {
                        session_id: self.session_id.clone(),
                        version: self.last_version.load(Ordering::SeqCst),
                    });
                }
                None
            }
        }
    }

    /// Next stream message in emission order. A lagging subscriber skips
    /// the oldest messages and continues from what is still buffered.
    pub async fn next_stream(&mut self) -> Option<StreamMessage> {
        loop {
            match self.stream_rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        session_id = %self.session_id,
                        skipped,
                        "Stream subscriber lagged, oldest chunks dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Ordered chunk emission for one stream task attempt.
pub struct ChunkEmitter {
    router: Arc<ChannelRouter>,
    session_id: SessionId,
    task_type: TaskType,
    idempotency_key: IdempotencyKey,
    seq: AtomicU64,
    enabled: bool,
}

impl ChunkEmitter {
    pub fn is_streaming(&self) -> bool {
        self.enabled
    }

    pub fn emit(&self, text: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.router.publish_stream(StreamMessage::Chunk {
            session_id: self.session_id.clone(),
            task_type: self.task_type.clone(),
            idempotency_key: self.idempotency_key.clone(),
            seq,
            text: text.into(),
        });
    }

    /// Emit the completion marker. Called once by the runner after the
    /// final chunk of a successful stream task.
    pub(crate) fn finish(&self) {
        if !self.enabled {
            return;
        }
        self.router.publish_stream(StreamMessage::Done {
            session_id: self.session_id.clone(),
            task_type: self.task_type.clone(),
            idempotency_key: self.idempotency_key.clone(),
            chunks: self.seq.load(Ordering::SeqCst),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Arc<ChannelRouter> {
        Arc::new(ChannelRouter::new(DeliveryConfig::default()))
    }

    fn tiny_router(state_buffer: usize, stream_buffer: usize) -> Arc<ChannelRouter> {
        Arc::new(ChannelRouter::new(DeliveryConfig {
            stream_buffer,
            state_buffer,
        }))
    }

    fn snapshot_notice(id: &SessionId, version: u64) -> StateNotice {
        let mut snapshot = SessionSnapshot::new(id.clone());
        snapshot.version = version;
        StateNotice::Snapshot {
            session_id: id.clone(),
            version,
            snapshot: Box::new(snapshot),
        }
    }

    #[tokio::test]
    async fn test_state_notices_arrive_in_commit_order() {
        let router = router();
        let id = SessionId::new("s-1");
        let mut sub = router.subscribe(&id);

        for version in 1..=5 {
            router.publish_state(snapshot_notice(&id, version));
        }

        for expected in 1..=5 {
            let notice = sub.next_state().await.unwrap();
            assert_eq!(notice.version(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_overflow_yields_single_resync_then_resumes() {
        let router = tiny_router(3, 8);
        let id = SessionId::new("s-1");
        let mut sub = router.subscribe(&id);

        // Fill the buffer and push past it.
        for version in 1..=10 {
            router.publish_state(snapshot_notice(&id, version));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sub.next_state().await.unwrap().version().unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);

        // Buffer drained; the overflow surfaces as one resync at the
        // latest committed version.
        let notice = sub.next_state().await.unwrap();
        match notice {
            StateNotice::Resync { version, .. } => assert_eq!(version, 10),
            other => panic!("expected resync, got {:?}", other),
        }

        // Delivery resumes afterwards.
        router.publish_state(snapshot_notice(&id, 11));
        let notice = sub.next_state().await.unwrap();
        assert_eq!(notice.version(), Some(11));
    }

    #[tokio::test]
    async fn test_no_version_skipped_without_resync() {
        let router = tiny_router(4, 8);
        let id = SessionId::new("s-1");
        let mut sub = router.subscribe(&id);

        for version in 1..=20 {
            router.publish_state(snapshot_notice(&id, version));
        }
        router.close_session(&id);

        let mut last = 0u64;
        let mut resynced = false;
        while let Some(notice) = sub.next_state().await {
            match notice {
                StateNotice::Snapshot { version, .. } => {
                    if !resynced {
                        assert_eq!(version, last + 1, "gap without resync");
                    }
                    last = version;
                }
                StateNotice::Resync { .. } => resynced = true,
                other => panic!("unexpected notice {:?}", other),
            }
        }
        assert!(resynced, "overflow must surface a resync");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let router = tiny_router(2, 8);
        let id = SessionId::new("s-1");
        let _slow = router.subscribe(&id);
        let mut fast = router.subscribe(&id);

        for version in 1..=6 {
            router.publish_state(snapshot_notice(&id, version));
        }

        // The slow subscriber never drains; the fast one went stale too
        // once its buffer filled, but its buffered prefix is intact.
        for expected in 1..=2 {
            assert_eq!(
                fast.next_state().await.unwrap().version(),
                Some(expected)
            );
        }
    }

    #[tokio::test]
    async fn test_stream_chunks_in_emission_order() {
        let router = router();
        let id = SessionId::new("s-1");
        let mut sub = router.subscribe(&id);

        let emitter = router.chunk_emitter(
            id.clone(),
            TaskType::new("question_refinement"),
            IdempotencyKey::new("k-1"),
            true,
        );
        for i in 0..4 {
            emitter.emit(format!("chunk {}", i));
        }
        emitter.finish();

        for expected in 0..4u64 {
            match sub.next_stream().await.unwrap() {
                StreamMessage::Chunk { seq, .. } => assert_eq!(seq, expected),
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(sub.next_stream().await.unwrap().is_done());
    }

    #[tokio::test]
    async fn test_stream_overflow_drops_oldest() {
        let router = tiny_router(8, 4);
        let id = SessionId::new("s-1");
        let mut sub = router.subscribe(&id);

        let emitter = router.chunk_emitter(
            id.clone(),
            TaskType::new("question_refinement"),
            IdempotencyKey::new("k-1"),
            true,
        );
        for i in 0..10 {
            emitter.emit(format!("chunk {}", i));
        }
        router.close_session(&id);

        let mut seqs = Vec::new();
        while let Some(message) = sub.next_stream().await {
            if let StreamMessage::Chunk { seq, .. } = message {
                seqs.push(seq);
            }
        }
        assert!(!seqs.is_empty());
        assert!(seqs[0] > 0, "oldest chunks should have been dropped");
        for pair in seqs.windows(2) {
            assert!(pair[0] < pair[1], "chunks out of order: {:?}", seqs);
        }
        assert_eq!(*seqs.last().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_disabled_emitter_goes_nowhere() {
        let router = router();
        let id = SessionId::new("s-1");
        let mut sub = router.subscribe(&id);

        let emitter = router.chunk_emitter(
            id.clone(),
            TaskType::new("keyword_extraction"),
            IdempotencyKey::new("k-1"),
            false,
        );
        emitter.emit("should vanish");
        emitter.finish();
        router.close_session(&id);

        assert!(sub.next_stream().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let router = router();
        let id = SessionId::new("nobody");
        router.publish_state(snapshot_notice(&id, 1));
        router.publish_stream(StreamMessage::Done {
            session_id: id,
            task_type: TaskType::new("t"),
            idempotency_key: IdempotencyKey::new("k"),
            chunks: 0,
        });
    }
}
