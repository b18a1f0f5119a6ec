//! # Sync Engine
//!
//! Background loop that keeps the local [`VersionStore`] converging with the
//! rest of the network. Each pass:
//!
//! 1. asks the authority (or, without one, each online peer in turn) for its
//!    latest version
//! 2. does nothing more if that matches the local version pointer
//! 3. otherwise fetches the version records after the local pointer, replays
//!    them, and adopts the reported version as the new pointer
//! 4. independently pushes pending local changes to every online peer and to
//!    the authority
//!
//! A failed pass is logged and the loop waits out the retry backoff before
//! trying again.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{NetworkConfig, SyncConfig};
use crate::error::{NetworkError, ProtocolError, SyncError};
use crate::p2p::{Peer, PeerHandle};
use crate::protocol::{object, Message, MessageKind, NodeId, MAX_FRAME_LEN};
use crate::requests::REQUEST_ID_FIELD;
use crate::storage::{batch_len, VersionRecord, VersionStore};

/// Something that can report versions and accept pushed ones.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// The source's current version, or `None` if it has no history yet.
    async fn latest_version(&self) -> Result<Option<String>, SyncError>;

    /// Version records after `version_hash`, oldest first.
    async fn changes_since(&self, version_hash: Option<String>) -> Result<Vec<VersionRecord>, SyncError>;

    /// Returns whether the source accepted the record.
    async fn push_changes(&self, record: VersionRecord) -> Result<bool, SyncError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSyncPayload {
    pub versions: Vec<VersionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponsePayload {
    pub request_id: String,
    pub version_hash: Option<String>,
}

/// Asks for the records after `since`. `start` continues a paged reply
/// from a history index the responder handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesRequestPayload {
    pub request_id: String,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub start: Option<usize>,
}

/// One page of records. `next` is set while more follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponsePayload {
    pub request_id: String,
    pub versions: Vec<VersionRecord>,
    #[serde(default)]
    pub next: Option<usize>,
}

/// Room left in a frame for the envelope around a list of records.
const FRAME_RESERVE: usize = 4 * 1024;

/// Bytes of records that fit in one frame on this endpoint.
fn frame_budget(config: &NetworkConfig) -> usize {
    config.max_frame_len.min(MAX_FRAME_LEN).saturating_sub(FRAME_RESERVE)
}

fn message_with<T: Serialize>(kind: MessageKind, payload: &T, sender: &NodeId) -> Result<Message, ProtocolError> {
    let value = serde_json::to_value(payload)?;
    Ok(Message::new(kind, object(value), sender.clone()))
}

/// Asks one connected peer for versions over the overlay.
pub struct PeerSource {
    peer: PeerHandle,
    target: NodeId,
    timeout: Duration,
}

impl PeerSource {
    pub fn new(peer: PeerHandle, target: NodeId, timeout: Duration) -> Self {
        Self { peer, target, timeout }
    }

    fn bad_response(&self, reason: impl ToString) -> SyncError {
        SyncError::BadResponse {
            source_name: format!("peer {}", self.target.short()),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl VersionSource for PeerSource {
    async fn latest_version(&self) -> Result<Option<String>, SyncError> {
        let sender = self.peer.id().clone();
        let reply = self
            .peer
            .request(
                &self.target,
                MessageKind::VersionResponse,
                |request_id| {
                    Message::new(
                        MessageKind::VersionRequest,
                        object(json!({ REQUEST_ID_FIELD: request_id })),
                        sender,
                    )
                },
                self.timeout,
            )
            .await?;
        let payload: VersionResponsePayload = reply.parse_payload().map_err(|e| self.bad_response(e))?;
        Ok(payload.version_hash)
    }

    async fn changes_since(&self, version_hash: Option<String>) -> Result<Vec<VersionRecord>, SyncError> {
        let mut versions = Vec::new();
        let mut start: Option<usize> = None;
        loop {
            let sender = self.peer.id().clone();
            let since = version_hash.clone();
            let reply = self
                .peer
                .request(
                    &self.target,
                    MessageKind::ChangesResponse,
                    |request_id| {
                        Message::new(
                            MessageKind::ChangesRequest,
                            object(json!({ REQUEST_ID_FIELD: request_id, "since": since, "start": start })),
                            sender,
                        )
                    },
                    self.timeout,
                )
                .await?;
            let page: ChangesResponsePayload = reply.parse_payload().map_err(|e| self.bad_response(e))?;
            versions.extend(page.versions);

            match page.next {
                None => return Ok(versions),
                Some(next) if start.map_or(true, |current| next > current) => {
                    debug!("Fetched {} records from {}, continuing at {}", versions.len(), self.target.short(), next);
                    start = Some(next);
                }
                Some(next) => return Err(self.bad_response(format!("page cursor went back to {}", next))),
            }
        }
    }

    async fn push_changes(&self, record: VersionRecord) -> Result<bool, SyncError> {
        let message = message_with(
            MessageKind::DbSync,
            &DbSyncPayload { versions: vec![record] },
            self.peer.id(),
        )
        .map_err(NetworkError::from)?;
        self.peer.send_message(&self.target, message).await?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Stopping,
}

/// Outcome of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote changes replayed.
    pub pulled: usize,
    /// Remote changes that failed to replay and were skipped.
    pub skipped: usize,
    /// Local operations marked applied.
    pub pushed: usize,
    /// The version adopted from the source, if the pointer moved.
    pub adopted: Option<String>,
}

struct EngineInner {
    store: VersionStore,
    peer: Option<PeerHandle>,
    authority: Option<Arc<dyn VersionSource>>,
    config: SyncConfig,
    request_timeout: Duration,
    state: Mutex<EngineState>,
    running: AtomicBool,
    wake: Notify,
}

pub struct SyncEngine {
    inner: Arc<EngineInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(store: VersionStore, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                peer: None,
                authority: None,
                config,
                request_timeout: Duration::from_secs(5),
                state: Mutex::new(EngineState::Stopped),
                running: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Pulls from and pushes to this endpoint's online peers.
    pub fn with_peer(mut self, peer: PeerHandle) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.request_timeout = peer.config().request_timeout();
            inner.peer = Some(peer);
        }
        self
    }

    /// Uses `authority` as the source of truth instead of the peers.
    pub fn with_authority(mut self, authority: Arc<dyn VersionSource>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.authority = Some(authority);
        }
        self
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    pub fn store(&self) -> &VersionStore {
        &self.inner.store
    }

    /// Spawns the background loop. Returns false if it is not stopped.
    pub fn start(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != EngineState::Stopped {
                return false;
            }
            *state = EngineState::Running;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        *self.task.lock() = Some(tokio::spawn(run_loop(inner)));
        info!("Sync engine started");
        true
    }

    /// Stops the loop and joins it, aborting it after the join timeout.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::Stopping;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            let join_timeout = self.inner.config.join_timeout();
            if timeout(join_timeout, &mut task).await.is_err() {
                warn!("Sync loop did not stop within {:?}, aborting", join_timeout);
                task.abort();
            }
        }

        *self.inner.state.lock() = EngineState::Stopped;
        info!("Sync engine stopped");
    }

    /// Runs a single pull and push.
    pub async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        self.inner.sync_once().await
    }
}

async fn run_loop(inner: Arc<EngineInner>) {
    while inner.running.load(Ordering::SeqCst) {
        let delay = match inner.sync_once().await {
            Ok(report) => {
                if report != SyncReport::default() {
                    debug!("Sync pass: {:?}", report);
                }
                inner.config.interval()
            }
            Err(e) => {
                error!("Sync pass failed: {}", e);
                inner.config.retry_backoff()
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            _ = inner.wake.notified() => {}
        }
    }
}

impl EngineInner {
    async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let pulled = self.pull(&mut report).await;
        let pushed = self.push(&mut report).await;
        pulled?;
        pushed?;
        Ok(report)
    }

    fn sources(&self) -> Vec<(String, Arc<dyn VersionSource>)> {
        if let Some(authority) = &self.authority {
            return vec![("authority".to_string(), authority.clone())];
        }
        let Some(peer) = &self.peer else {
            return Vec::new();
        };
        peer.connected_peers()
            .into_iter()
            .map(|record| {
                let source: Arc<dyn VersionSource> =
                    Arc::new(PeerSource::new(peer.clone(), record.id.clone(), self.request_timeout));
                (format!("peer {}", record.id.short()), source)
            })
            .collect()
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let sources = self.sources();
        if sources.is_empty() {
            return Ok(());
        }

        let mut last_error = None;
        for (name, source) in sources {
            match self.pull_from(source.as_ref(), report).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Failed to pull from {}: {}", name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(SyncError::NoSource))
    }

    async fn pull_from(&self, source: &dyn VersionSource, report: &mut SyncReport) -> Result<(), SyncError> {
        let Some(latest) = source.latest_version().await? else {
            return Ok(());
        };
        let current = self.store.current_version_hash();
        if current.as_deref() == Some(latest.as_str()) {
            return Ok(());
        }

        let records = source.changes_since(current).await?;
        let replay = self.store.catch_up(&records, &latest).await?;
        info!(
            "Caught up to {} ({} changes replayed, {} skipped)",
            latest,
            replay.applied,
            replay.failed.len()
        );
        report.pulled += replay.applied;
        report.skipped += replay.failed.len();
        report.adopted = Some(latest);
        Ok(())
    }

    async fn push(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let pending = self.store.pending_changes();
        if pending.is_empty() {
            return Ok(());
        }

        // Each record once, with the outbox operations it carries.
        let mut records: Vec<(VersionRecord, Vec<u64>)> = Vec::new();
        for operation in &pending {
            let Some(record) = self.store.record_of(operation) else {
                warn!("No version record for pending operation {}", operation.id);
                continue;
            };
            match records.iter_mut().find(|(known, _)| known.same_record(&record)) {
                Some((_, ids)) => ids.push(operation.id),
                None => records.push((record, vec![operation.id])),
            }
        }

        let mut delivered = vec![false; records.len()];
        if let Some(peer) = &self.peer {
            let versions: Vec<VersionRecord> = records.iter().map(|(record, _)| record.clone()).collect();
            let budget = frame_budget(peer.config());
            let mut start = 0;
            while start < versions.len() {
                let end = start + batch_len(&versions[start..], budget);
                let message = message_with(
                    MessageKind::DbSync,
                    &DbSyncPayload {
                        versions: versions[start..end].to_vec(),
                    },
                    peer.id(),
                )
                .map_err(NetworkError::from)?;
                if peer.broadcast(&message).await > 0 {
                    delivered[start..end].fill(true);
                }
                start = end;
            }
        }

        let mut acked = Vec::new();
        let mut failure = None;
        for (index, (record, ids)) in records.iter().enumerate() {
            let accepted = match &self.authority {
                Some(authority) => match authority.push_changes(record.clone()).await {
                    Ok(accepted) => {
                        if !accepted {
                            warn!("Authority rejected version {}", record.version_hash);
                        }
                        accepted
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
                None => delivered[index],
            };
            if accepted {
                acked.extend_from_slice(ids);
            }
        }

        report.pushed += self.store.mark_all_applied(&acked).await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Installs the version store's message handlers on an endpoint.
///
/// Incoming `db_sync` batches are applied in arrival order by a task spawned
/// here, so this must run inside a tokio runtime.
pub fn register_handlers(peer: &mut Peer, store: VersionStore) {
    let (batches, mut incoming) = mpsc::unbounded_channel::<(NodeId, Vec<VersionRecord>)>();
    let applier = store.clone();
    tokio::spawn(async move {
        while let Some((sender, versions)) = incoming.recv().await {
            apply_db_sync(&applier, &sender, &versions).await;
        }
    });

    peer.register_handler(
        MessageKind::DbSync,
        move |_: &PeerHandle, message: &Message| -> Result<Option<Message>, NetworkError> {
            let payload: DbSyncPayload = message.parse_payload()?;
            if !payload.versions.is_empty() && batches.send((message.sender_id().clone(), payload.versions)).is_err() {
                warn!("Dropping db_sync from {}: store applier stopped", message.sender_id().short());
            }
            Ok(None)
        },
    );

    let version_store = store.clone();
    peer.register_handler(
        MessageKind::VersionRequest,
        move |peer: &PeerHandle, message: &Message| -> Result<Option<Message>, NetworkError> {
            let request_id = request_id_of(message)?;
            let payload = VersionResponsePayload {
                request_id,
                version_hash: version_store.current_version_hash(),
            };
            Ok(Some(message_with(MessageKind::VersionResponse, &payload, peer.id())?))
        },
    );

    peer.register_handler(
        MessageKind::ChangesRequest,
        move |peer: &PeerHandle, message: &Message| -> Result<Option<Message>, NetworkError> {
            let request: ChangesRequestPayload = message.parse_payload()?;
            let start = request
                .start
                .unwrap_or_else(|| store.position_after(request.since.as_deref()));
            let (versions, next) = store.history_page(start, frame_budget(peer.config()));
            let payload = ChangesResponsePayload {
                request_id: request.request_id,
                versions,
                next,
            };
            Ok(Some(message_with(MessageKind::ChangesResponse, &payload, peer.id())?))
        },
    );
}

async fn apply_db_sync(store: &VersionStore, sender: &NodeId, versions: &[VersionRecord]) {
    let Some(latest) = versions.last().map(|record| record.version_hash.clone()) else {
        return;
    };
    match store.catch_up(versions, &latest).await {
        Ok(report) => debug!(
            "Applied db_sync from {}: {} changes, {} skipped",
            sender.short(),
            report.applied,
            report.failed.len()
        ),
        Err(e) => error!("Failed to apply db_sync from {}: {}", sender.short(), e),
    }
}

fn request_id_of(message: &Message) -> Result<String, ProtocolError> {
    match message.payload().get(REQUEST_ID_FIELD) {
        Some(Value::String(id)) => Ok(id.clone()),
        _ => Err(ProtocolError::InvalidPayload {
            kind: message.kind().as_str(),
            reason: format!("missing {}", REQUEST_ID_FIELD),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Operation, Row};
    use assert_matches::assert_matches;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn tables() -> Vec<String> {
        vec!["users".into(), "files".into(), "permissions".into()]
    }

    fn user(name: &str) -> Row {
        object(json!({ "username": name }))
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            interval_ms: 10,
            retry_backoff_ms: 10_000,
            join_timeout_ms: 500,
            ..SyncConfig::default()
        }
    }

    async fn origin_with_two_users() -> VersionStore {
        let origin = VersionStore::in_memory(NodeId::from("origin"), tables());
        origin.apply_change(Operation::Insert, "users", "u1", user("alice")).await.unwrap();
        origin.apply_change(Operation::Insert, "users", "u2", user("bob")).await.unwrap();
        origin
    }

    #[tokio::test]
    async fn test_pass_adopts_authority_version() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        let h1 = local
            .apply_change(Operation::Insert, "files", "f1", object(json!({ "filename": "a" })))
            .await
            .unwrap()
            .version_hash;

        let origin = origin_with_two_users().await;
        let h2 = origin.current_version_hash().unwrap();
        let history = origin.history();

        let mut authority = MockVersionSource::new();
        let latest = h2.clone();
        authority
            .expect_latest_version()
            .times(1)
            .returning(move || Ok(Some(latest.clone())));
        authority
            .expect_changes_since()
            .with(eq(Some(h1.clone())))
            .times(1)
            .returning(move |_| Ok(history.clone()));
        authority.expect_push_changes().times(1).returning(|_| Ok(true));

        let engine = SyncEngine::new(local.clone(), fast_config()).with_authority(Arc::new(authority));
        let report = engine.sync_once().await.unwrap();

        assert_eq!(local.current_version_hash(), Some(h2.clone()));
        assert_eq!(report.pulled, 2);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.adopted, Some(h2));
        assert_eq!(local.rows("users").len(), 2);
        assert!(local.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn test_matching_version_skips_pull() {
        let local = origin_with_two_users().await;
        let current = local.current_version_hash();
        for op in local.pending_changes() {
            local.mark_applied(op.id).await.unwrap();
        }

        let mut authority = MockVersionSource::new();
        authority
            .expect_latest_version()
            .returning(move || Ok(current.clone()));
        authority.expect_changes_since().never();
        authority.expect_push_changes().never();

        let engine = SyncEngine::new(local, fast_config()).with_authority(Arc::new(authority));
        assert_eq!(engine.sync_once().await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn test_unpushed_local_version_falls_off_chain() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        let local_version = local
            .apply_change(Operation::Insert, "users", "mine", user("carol"))
            .await
            .unwrap()
            .version_hash;

        let origin = origin_with_two_users().await;
        let reported = origin.current_version_hash().unwrap();
        let history = origin.history();

        let mut authority = MockVersionSource::new();
        let latest = reported.clone();
        authority
            .expect_latest_version()
            .returning(move || Ok(Some(latest.clone())));
        authority
            .expect_changes_since()
            .returning(move |_| Ok(history.clone()));
        authority.expect_push_changes().returning(|_| Ok(false));

        let engine = SyncEngine::new(local.clone(), fast_config()).with_authority(Arc::new(authority));
        let report = engine.sync_once().await.unwrap();
        assert_eq!(report.pushed, 0);

        // The row survives locally but no chain from the adopted version
        // reaches the local version any more.
        assert_eq!(local.current_version_hash(), Some(reported.clone()));
        assert!(local.get("users", "mine").is_some());
        assert!(local
            .chain(&reported)
            .iter()
            .all(|record| record.version_hash != local_version));
        assert_ne!(local.state_hash(), reported);
        assert_eq!(local.pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_pull_still_pushes() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        local.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();

        let mut authority = MockVersionSource::new();
        authority
            .expect_latest_version()
            .returning(|| Err(SyncError::Authority("connection refused".into())));
        authority.expect_push_changes().times(1).returning(|_| Ok(true));

        let engine = SyncEngine::new(local.clone(), fast_config()).with_authority(Arc::new(authority));
        assert_matches!(engine.sync_once().await, Err(SyncError::Authority(_)));
        assert!(local.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn test_push_sends_every_link_of_a_repeated_state() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        let first = local.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        let gone = local.apply_change(Operation::Delete, "users", "u1", Row::new()).await.unwrap();
        let again = local.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        assert_eq!(first.version_hash, again.version_hash);

        let pushed = Arc::new(Mutex::new(Vec::new()));
        let sink = pushed.clone();
        let mut authority = MockVersionSource::new();
        authority.expect_latest_version().returning(|| Ok(None));
        authority.expect_push_changes().times(3).returning(move |record| {
            sink.lock().push(record);
            Ok(true)
        });

        let engine = SyncEngine::new(local.clone(), fast_config()).with_authority(Arc::new(authority));
        assert_eq!(engine.sync_once().await.unwrap().pushed, 3);
        assert_eq!(*pushed.lock(), vec![first, gone, again]);
        assert!(local.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn test_authority_failure_keeps_unacked_changes() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        for id in ["u1", "u2", "u3"] {
            local.apply_change(Operation::Insert, "users", id, user(id)).await.unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut authority = MockVersionSource::new();
        authority.expect_latest_version().returning(|| Ok(None));
        authority.expect_push_changes().times(2).returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(true),
                _ => Err(SyncError::Authority("503".into())),
            }
        });

        let engine = SyncEngine::new(local.clone(), fast_config()).with_authority(Arc::new(authority));
        assert_matches!(engine.sync_once().await, Err(SyncError::Authority(_)));
        let pending: Vec<String> = local
            .pending_changes()
            .into_iter()
            .map(|op| op.change.record_id)
            .collect();
        assert_eq!(pending, vec!["u2", "u3"]);
    }

    #[tokio::test]
    async fn test_no_sources_is_a_quiet_pass() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        local.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();

        let engine = SyncEngine::new(local.clone(), fast_config());
        assert_eq!(engine.sync_once().await.unwrap(), SyncReport::default());
        assert_eq!(local.pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut authority = MockVersionSource::new();
        authority.expect_latest_version().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        let engine = SyncEngine::new(local, fast_config()).with_authority(Arc::new(authority));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.start());
        assert!(!engine.start());
        assert_eq!(engine.state(), EngineState::Running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(calls.load(Ordering::SeqCst) >= 2);

        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
        assert!(engine.start());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_failed_pass_waits_for_backoff() {
        let local = VersionStore::in_memory(NodeId::from("local"), tables());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut authority = MockVersionSource::new();
        authority.expect_latest_version().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Authority("503".into()))
        });

        let engine = SyncEngine::new(local, fast_config()).with_authority(Arc::new(authority));
        engine.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Stop interrupts the backoff sleep instead of waiting it out.
        let started = std::time::Instant::now();
        engine.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_request_id_is_required() {
        let message = Message::new(MessageKind::VersionRequest, Default::default(), NodeId::from("a"));
        assert_matches!(request_id_of(&message), Err(ProtocolError::InvalidPayload { .. }));

        let message = Message::new(
            MessageKind::VersionRequest,
            object(json!({ "request_id": "r1" })),
            NodeId::from("a"),
        );
        assert_eq!(request_id_of(&message).unwrap(), "r1");
    }
}
