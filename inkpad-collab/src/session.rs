//! Per-document collaboration session.
//!
//! A [`DocSession`] owns one duplex channel to the sync server for the
//! lifetime of a document view. A spawned driver task walks the connection
//! state machine:
//!
//! ```text
//! Connecting ──► Synced ──► Disconnected ──► Reconnecting ──► Synced
//!                                 ▲               │    │
//!                                 └──(backoff)────┘    └──► Failed
//! ```
//!
//! Local edits apply to the merge engine synchronously and never wait on the
//! network; updates produced while the channel is down are retained in a
//! replay queue and re-sent after the next handshake. Transient transport
//! errors feed the state machine and never escape; only the terminal
//! `Failed` state (retry budget spent, or the server rejected the session)
//! is observable, on the same view stream as normal progress.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::merge::{Edit, MergeEngine, MergeError};
use crate::protocol::{MessageType, PeerInfo, RejectReason, SyncMessage};
use crate::retry::RetryPolicy;
use crate::transport::{DuplexChannel, Transport};

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Synced,
    Disconnected,
    Reconnecting,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Synced => "synced",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session reached the terminal `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The reconnect budget was spent without reaching the server
    RetriesExhausted { attempts: u32 },
    /// The server refused the session
    Rejected(RejectReason),
}

/// Snapshot published to subscribers on every state or content change.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub state: ConnectionState,
    pub content: Arc<str>,
    /// Bumped on every content change
    pub revision: u64,
    /// Set exactly when `state == Failed`
    pub failure: Option<FailureReason>,
}

/// Discrete roster events (who else is editing this document).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// Session-level errors returned to the caller.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// A document id must be non-nil
    NilDocumentId,
    /// The session was closed
    Closed,
    /// A local edit was invalid
    Merge(MergeError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NilDocumentId => write!(f, "Document id must be non-nil"),
            Self::Closed => write!(f, "Session is closed"),
            Self::Merge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<MergeError> for SessionError {
    fn from(e: MergeError) -> Self {
        Self::Merge(e)
    }
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    /// Roster event channel capacity
    pub event_capacity: usize,
    /// Updates retained while the channel is down
    pub replay_capacity: usize,
    /// Heartbeat ping period while connected
    pub heartbeat_interval: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            event_capacity: 256,
            replay_capacity: 10_000,
            heartbeat_interval: std::time::Duration::from_secs(30),
        }
    }
}

/// Queue of locally-produced updates awaiting a live channel.
///
/// Replayed after the next handshake. Updates are idempotent and the
/// handshake diff independently carries everything the replica holds, so a
/// full queue may shed entries without losing edits.
pub struct ReplayQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl ReplayQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Retain an update for replay. Returns false when the queue is full.
    pub fn push(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Drain all retained updates for replay.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes retained.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.len()).sum()
    }
}

struct SessionShared {
    doc_id: Uuid,
    peer: PeerInfo,
    merge: Mutex<MergeEngine>,
    replay: Mutex<ReplayQueue>,
    /// Live channel sender, present only while a connection is up
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    view: watch::Sender<SessionView>,
    /// Set once by close(); observed by the driver at every suspension point
    shutdown: watch::Sender<bool>,
    seq: AtomicU64,
}

impl SessionShared {
    fn set_state(&self, state: ConnectionState) {
        self.view.send_if_modified(|v| {
            if v.state == state {
                false
            } else {
                v.state = state;
                true
            }
        });
    }

    fn set_failure(&self, failure: FailureReason) {
        self.view.send_modify(|v| {
            v.state = ConnectionState::Failed;
            v.failure = Some(failure);
        });
    }

    fn publish_content(&self) {
        let content: Arc<str> = self.merge.lock().unwrap().content().into();
        self.view.send_modify(|v| {
            v.content = content;
            v.revision += 1;
        });
    }

    fn clear_outgoing(&self) {
        *self.outgoing.lock().unwrap() = None;
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Handle to a live collaboration session. Cloneable; all clones address the
/// same session.
#[derive(Clone)]
pub struct DocSession {
    shared: Arc<SessionShared>,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<SessionEvent>>>>,
}

impl DocSession {
    /// Open a session and start its driver task. Must be called from within
    /// a tokio runtime. Callers go through [`crate::manager::SessionManager`].
    pub(crate) fn open(
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        config: SessionConfig,
        doc_id: Uuid,
        initial: &str,
    ) -> Self {
        let merge = MergeEngine::new(doc_id, initial);
        let content: Arc<str> = merge.content().into();

        let (view_tx, _) = watch::channel(SessionView {
            state: ConnectionState::Connecting,
            content,
            revision: 0,
            failure: None,
        });
        let (shutdown_tx, _) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        let shared = Arc::new(SessionShared {
            doc_id,
            peer,
            merge: Mutex::new(merge),
            replay: Mutex::new(ReplayQueue::new(config.replay_capacity)),
            outgoing: Mutex::new(None),
            view: view_tx,
            shutdown: shutdown_tx,
            seq: AtomicU64::new(0),
        });

        tokio::spawn(drive(shared.clone(), transport, config, event_tx));

        Self {
            shared,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.shared.doc_id
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.shared.peer
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.view.borrow().state
    }

    /// Current merged content snapshot (read-only; route changes through
    /// [`DocSession::apply_edit`]).
    pub fn content(&self) -> Arc<str> {
        self.shared.view.borrow().content.clone()
    }

    pub fn revision(&self) -> u64 {
        self.shared.view.borrow().revision
    }

    /// Subscribe to `(state, content)` changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.shared.view.subscribe()
    }

    /// Take the roster event receiver (can only be taken once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Updates currently retained for replay.
    pub fn pending_replay(&self) -> usize {
        self.shared.replay.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Apply a local edit.
    ///
    /// Synchronous with respect to the caller: the merged view updates
    /// before this returns, regardless of connection state. The produced
    /// update is sent immediately when synced, retained for replay
    /// otherwise.
    pub fn apply_edit(&self, edit: &Edit) -> Result<(), SessionError> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(SessionError::Closed);
        }

        let update = shared.merge.lock().unwrap().apply_edit(edit)?;
        shared.publish_content();

        // The replay lock also guards the Synced flip (see run_connection),
        // so an edit either sees Synced and sends directly, or lands in the
        // queue before the driver drains it
        let mut replay = shared.replay.lock().unwrap();
        let sent = if shared.view.borrow().state == ConnectionState::Synced {
            let guard = shared.outgoing.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let seq = shared.seq.fetch_add(1, Ordering::Relaxed) + 1;
                let msg = SyncMessage::update(shared.peer.peer_id, shared.doc_id, seq, update.clone());
                match msg.encode() {
                    Ok(frame) => tx.try_send(frame).is_ok(),
                    Err(e) => {
                        log::error!("session {}: encode failed: {e}", shared.doc_id);
                        false
                    }
                }
            } else {
                false
            }
        } else {
            false
        };

        if !sent && !replay.push(update) {
            log::warn!(
                "session {}: replay queue full; update will ride the next handshake diff",
                shared.doc_id
            );
        }
        Ok(())
    }

    /// Close the session: cancels any in-flight reconnect timer and releases
    /// the channel. Idempotent; safe to call from teardown paths that fire
    /// more than once.
    pub fn close(&self) {
        if !self.shared.shutdown.send_replace(true) {
            log::debug!("session {} closing", self.shared.doc_id);
        }
    }
}

enum Outcome {
    Lost { synced: bool },
    Rejected(RejectReason),
    Closed,
}

/// The driver task: owns the transport channel and walks the state machine.
async fn drive(
    shared: Arc<SessionShared>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let jitter_seed = {
        let d = shared.doc_id.as_u128();
        let p = shared.peer.peer_id.as_u128();
        (d as u64) ^ ((d >> 64) as u64) ^ (p as u64) ^ ((p >> 64) as u64)
    };
    let mut attempt: u32 = 0;
    let mut first = true;

    'outer: loop {
        if shared.is_shut_down() {
            break;
        }
        shared.set_state(if first {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        first = false;

        let connected = tokio::select! {
            r = transport.connect(shared.doc_id) => r,
            _ = shutdown.wait_for(|v| *v) => break 'outer,
        };

        match connected {
            Ok(chan) => {
                let outcome = run_connection(&shared, chan, &config, &event_tx).await;
                shared.clear_outgoing();
                match outcome {
                    Outcome::Closed => break 'outer,
                    Outcome::Rejected(reason) => {
                        log::warn!("session {} rejected by server: {reason}", shared.doc_id);
                        shared.set_failure(FailureReason::Rejected(reason));
                        return;
                    }
                    Outcome::Lost { synced } => {
                        // A successful sync resets the budget: it bounds each
                        // outage, not the session lifetime
                        if synced {
                            attempt = 0;
                        }
                        log::debug!("session {} lost its channel", shared.doc_id);
                    }
                }
            }
            Err(e) => {
                log::debug!("session {} connect failed: {e}", shared.doc_id);
            }
        }

        if shared.is_shut_down() {
            break;
        }
        shared.set_state(ConnectionState::Disconnected);

        attempt += 1;
        if config.retry.is_exhausted(attempt) {
            log::warn!(
                "session {}: retry budget exhausted after {attempt} attempts",
                shared.doc_id
            );
            shared.set_failure(FailureReason::RetriesExhausted { attempts: attempt });
            return;
        }
        let delay = config.retry.delay_for(attempt, jitter_seed);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|v| *v) => break 'outer,
        }
    }

    shared.set_state(ConnectionState::Closed);
}

/// Drive one live connection until it closes, fails, or the session ends.
async fn run_connection(
    shared: &Arc<SessionShared>,
    mut chan: DuplexChannel,
    config: &SessionConfig,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Outcome {
    let peer_id = shared.peer.peer_id;
    let doc_id = shared.doc_id;
    let mut shutdown = shared.shutdown.subscribe();

    // Handshake: announce ourselves, then exchange state vectors. The server
    // answers with the diff we are missing and asks for the diff it is
    // missing, which carries any edits made while we were offline.
    let join = SyncMessage::join(peer_id, doc_id, &shared.peer);
    let sv = shared.merge.lock().unwrap().state_vector();
    let step1 = SyncMessage::sync_step1(peer_id, doc_id, sv);
    for msg in [join, step1] {
        match msg.encode() {
            Ok(frame) => {
                if chan.send(frame).await.is_err() {
                    return Outcome::Lost { synced: false };
                }
            }
            Err(e) => {
                log::error!("session {doc_id}: encode failed: {e}");
                return Outcome::Lost { synced: false };
            }
        }
    }

    *shared.outgoing.lock().unwrap() = Some(chan.sender());

    let mut synced = false;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|v| *v).await; } => {
                // Best effort: tell the room we are leaving
                if let Ok(frame) = SyncMessage::peer_left(peer_id, doc_id).encode() {
                    let _ = chan.send(frame).await;
                }
                return Outcome::Closed;
            }

            _ = heartbeat.tick() => {
                if let Ok(frame) = SyncMessage::ping(peer_id).encode() {
                    if chan.send(frame).await.is_err() {
                        return Outcome::Lost { synced };
                    }
                }
            }

            incoming = chan.recv() => {
                let Some(bytes) = incoming else {
                    return Outcome::Lost { synced };
                };
                let msg = match SyncMessage::decode(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("session {doc_id}: undecodable frame: {e}");
                        continue;
                    }
                };
                // Our own updates echoed back are already applied
                if msg.peer_id == peer_id && msg.msg_type == MessageType::Update {
                    continue;
                }

                match msg.msg_type {
                    MessageType::SyncStep2 => {
                        let applied = shared.merge.lock().unwrap().apply_remote(&msg.payload);
                        match applied {
                            Ok(()) => shared.publish_content(),
                            Err(e) => {
                                log::error!("session {doc_id}: bad state diff: {e}");
                                continue;
                            }
                        }
                        if !synced {
                            // Drain and flip to Synced under the replay lock
                            // so no concurrent edit slips between replay and
                            // direct sending
                            let retained = {
                                let mut replay = shared.replay.lock().unwrap();
                                let retained = replay.drain();
                                shared.set_state(ConnectionState::Synced);
                                retained
                            };
                            synced = true;
                            if !retained.is_empty() {
                                log::info!(
                                    "session {doc_id}: replaying {} retained updates",
                                    retained.len()
                                );
                            }
                            for update in retained {
                                let seq = shared.seq.fetch_add(1, Ordering::Relaxed) + 1;
                                let msg = SyncMessage::update(peer_id, doc_id, seq, update);
                                match msg.encode() {
                                    Ok(frame) => {
                                        if chan.send(frame).await.is_err() {
                                            // The handshake of the next
                                            // connection re-carries whatever
                                            // we could not push here
                                            return Outcome::Lost { synced: true };
                                        }
                                    }
                                    Err(e) => log::error!(
                                        "session {doc_id}: encode failed during replay: {e}"
                                    ),
                                }
                            }
                            log::info!("session {doc_id} synced");
                        }
                    }

                    MessageType::SyncStep1 => {
                        let diff = shared.merge.lock().unwrap().diff(&msg.payload);
                        match diff {
                            Ok(diff) => {
                                if let Ok(frame) =
                                    SyncMessage::sync_step2(peer_id, doc_id, diff).encode()
                                {
                                    if chan.send(frame).await.is_err() {
                                        return Outcome::Lost { synced };
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("session {doc_id}: bad remote state vector: {e}");
                            }
                        }
                    }

                    MessageType::Update => {
                        let applied = shared.merge.lock().unwrap().apply_remote(&msg.payload);
                        match applied {
                            Ok(()) => shared.publish_content(),
                            Err(e) => log::error!("session {doc_id}: bad remote update: {e}"),
                        }
                    }

                    MessageType::PeerJoined => {
                        if let Ok(info) = msg.peer_info() {
                            if info.peer_id != peer_id {
                                let _ = event_tx.try_send(SessionEvent::PeerJoined(info));
                            }
                        }
                    }

                    MessageType::PeerLeft => {
                        let _ = event_tx.try_send(SessionEvent::PeerLeft(msg.peer_id));
                    }

                    MessageType::Reject => {
                        let reason = msg.reject_reason().unwrap_or(RejectReason::AccessRevoked);
                        return Outcome::Rejected(reason);
                    }

                    MessageType::Ping => {
                        if let Ok(frame) = SyncMessage::pong(peer_id).encode() {
                            let _ = chan.send(frame).await;
                        }
                    }

                    MessageType::Pong | MessageType::Join => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Transport whose every connection attempt is refused.
    struct NeverConnect {
        attempts: Arc<AtomicU32>,
    }

    impl Transport for NeverConnect {
        fn connect(
            &self,
            _doc_id: Uuid,
        ) -> BoxFuture<'static, Result<DuplexChannel, TransportError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(TransportError::Connect("refused".into())) })
        }
    }

    fn fast_config(max_attempts: u32) -> SessionConfig {
        SessionConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                max_attempts,
            },
            ..SessionConfig::default()
        }
    }

    fn open_unreachable(max_attempts: u32) -> (DocSession, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = Arc::new(NeverConnect { attempts: attempts.clone() });
        let session = DocSession::open(
            transport,
            PeerInfo::new("tester"),
            fast_config(max_attempts),
            Uuid::new_v4(),
            "Hello",
        );
        (session, attempts)
    }

    async fn wait_for_state(session: &DocSession, want: ConnectionState) -> SessionView {
        let mut rx = session.subscribe();
        let view = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| v.state == want))
            .await
            .expect("timed out waiting for state")
            .expect("view sender dropped")
            .clone();
        view
    }

    #[tokio::test]
    async fn test_initial_view() {
        let (session, _) = open_unreachable(3);
        assert_eq!(&*session.content(), "Hello");
        assert_eq!(session.revision(), 0);
        assert!(!session.is_closed());
        session.close();
    }

    #[tokio::test]
    async fn test_failed_after_retry_budget() {
        let (session, attempts) = open_unreachable(3);

        let view = wait_for_state(&session, ConnectionState::Failed).await;
        assert_eq!(
            view.failure,
            Some(FailureReason::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // No further attempts after Failed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_local_edit_nonblocking_while_offline() {
        let (session, _) = open_unreachable(u32::MAX);

        session
            .apply_edit(&Edit::Insert { index: 5, text: " world".into() })
            .unwrap();

        // Applied synchronously, retained for replay
        assert_eq!(&*session.content(), "Hello world");
        assert_eq!(session.revision(), 1);
        assert_eq!(session.pending_replay(), 1);

        session.close();
    }

    #[tokio::test]
    async fn test_invalid_edit_rejected() {
        let (session, _) = open_unreachable(3);
        let err = session
            .apply_edit(&Edit::Delete { index: 0, len: 99 })
            .unwrap_err();
        assert!(matches!(err, SessionError::Merge(_)));
        assert_eq!(&*session.content(), "Hello");
        session.close();
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (session, _) = open_unreachable(u32::MAX);

        session.close();
        session.close();
        assert!(session.is_closed());

        wait_for_state(&session, ConnectionState::Closed).await;
        assert!(matches!(
            session.apply_edit(&Edit::Insert { index: 0, text: "x".into() }),
            Err(SessionError::Closed)
        ));
        session.close();
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let (session, _) = open_unreachable(3);
        assert!(session.take_event_rx().is_some());
        assert!(session.take_event_rx().is_none());
        session.close();
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let (session, _) = open_unreachable(u32::MAX);
        let other = session.clone();

        session
            .apply_edit(&Edit::Insert { index: 0, text: ">".into() })
            .unwrap();
        assert_eq!(&*other.content(), ">Hello");

        other.close();
        assert!(session.is_closed());
    }

    #[test]
    fn test_replay_queue() {
        let mut queue = ReplayQueue::new(100);
        assert!(queue.is_empty());

        queue.push(vec![1, 2, 3]);
        queue.push(vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_replay_queue_capacity() {
        let mut queue = ReplayQueue::new(2);
        assert!(queue.push(vec![1]));
        assert!(queue.push(vec![2]));
        assert!(!queue.push(vec![3])); // full
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Synced.to_string(), "synced");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }
}
