//! Per-owner exclusive processing workspaces.
//!
//! A workspace wraps one stored video: the source is downloaded exactly once
//! into a per-session temp namespace, repeated transforms reuse that local
//! copy, and every produced artifact is deleted right after its bytes are
//! handed to the caller. At most one live session per owner; opening a new
//! one closes the old one first. Operations on the same session are strictly
//! serialized through the session's own lock.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::{
    config::Config,
    domain::{StoredItem, UserId},
    errors::Error,
    media::{MediaProcessor, OperationSpec},
    store::ContentStore,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Downloading,
    Active,
    Closing,
    Closed,
}

#[derive(Clone, Debug)]
pub struct WorkspaceOptions {
    pub temp_dir: PathBuf,
    pub idle_timeout: Duration,
    /// Whether a second concurrent operation on the same session waits for
    /// the running one or fails fast with `SessionBusy`.
    pub busy_wait: bool,
}

impl WorkspaceOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            temp_dir: cfg.temp_dir.clone(),
            idle_timeout: cfg.session_idle_timeout,
            busy_wait: cfg.session_busy_wait,
        }
    }
}

struct SessionInner {
    state: SessionState,
    local_copy: Option<PathBuf>,
    last_active: DateTime<Utc>,
    artifact_seq: u32,
}

pub struct WorkspaceSession {
    pub id: u64,
    pub owner: UserId,
    pub source: StoredItem,
    namespace: PathBuf,
    inner: Mutex<SessionInner>,
}

/// Read-only view of a session for status displays.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub id: u64,
    pub owner: UserId,
    pub source: StoredItem,
    pub state: SessionState,
    pub downloaded: bool,
    pub last_active: DateTime<Utc>,
}

/// A produced transform output on disk; the file is removed when this guard
/// drops, which is what guarantees cleanup even when the send step fails.
struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct WorkspaceManager {
    opts: WorkspaceOptions,
    store: Arc<ContentStore>,
    processor: Arc<dyn MediaProcessor>,
    sessions: DashMap<UserId, Arc<WorkspaceSession>>,
    next_session_id: AtomicU64,
}

impl WorkspaceManager {
    pub fn new(
        opts: WorkspaceOptions,
        store: Arc<ContentStore>,
        processor: Arc<dyn MediaProcessor>,
    ) -> Self {
        Self {
            opts,
            store,
            processor,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Open a workspace for `owner` on `source`.
    ///
    /// Any existing session for the owner is closed first (its local copy
    /// released), so there is never more than one live session per owner.
    pub async fn open(&self, owner: UserId, source: StoredItem) -> Result<SessionSnapshot> {
        if let Some((_, old)) = self.sessions.remove(&owner) {
            self.close_session(&old).await;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let namespace = self.opts.temp_dir.join(format!("ws-{}-{id}", owner.0));
        tokio::fs::create_dir_all(&namespace).await?;

        let session = Arc::new(WorkspaceSession {
            id,
            owner,
            source,
            namespace,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                local_copy: None,
                last_active: Utc::now(),
                artifact_seq: 0,
            }),
        });
        info!(owner = owner.0, session = id, "workspace opened");
        let inner = session.inner.lock().await;
        let snapshot = snapshot_of(&session, &inner);
        drop(inner);
        self.sessions.insert(owner, session);
        Ok(snapshot)
    }

    pub fn session(&self, owner: UserId) -> Option<Arc<WorkspaceSession>> {
        self.sessions.get(&owner).map(|s| s.clone())
    }

    pub async fn status(&self, owner: UserId) -> Option<SessionSnapshot> {
        let session = self.session(owner)?;
        let inner = session.inner.lock().await;
        Some(snapshot_of(&session, &inner))
    }

    /// Make sure the session has its local copy, fetching it at most once.
    ///
    /// The session transitions Idle → Downloading → Active. The content store
    /// owns the transient-failure backoff; if the fetch still fails, the
    /// session reverts to Idle and `SessionFetch` surfaces.
    pub async fn ensure_local_copy(&self, owner: UserId) -> Result<PathBuf> {
        let session = self.require(owner)?;
        let mut inner = self.lock_session(&session).await?;
        if inner.state == SessionState::Closed || inner.state == SessionState::Closing {
            return Err(Error::SessionClosed);
        }
        inner.last_active = Utc::now();

        if let Some(path) = &inner.local_copy {
            return Ok(path.clone());
        }

        inner.state = SessionState::Downloading;
        let dest = session.namespace.join(source_file_name(&session.source));
        match self
            .store
            .fetch_to_file(session.source.reference, &dest)
            .await
        {
            Ok(bytes) => {
                info!(
                    owner = owner.0,
                    session = session.id,
                    bytes,
                    "source downloaded"
                );
                inner.state = SessionState::Active;
                inner.local_copy = Some(dest.clone());
                Ok(dest)
            }
            Err(e) => {
                // Not a broken intermediate state: back to Idle, retryable.
                inner.state = SessionState::Idle;
                let _ = std::fs::remove_file(&dest);
                Err(Error::SessionFetch(e.to_string()))
            }
        }
    }

    /// Run one transform against the session's local copy and return the
    /// artifact bytes. The artifact file is deleted before returning, no
    /// matter how the transform or the read ends.
    pub async fn produce_artifact(
        &self,
        owner: UserId,
        op: &OperationSpec,
    ) -> Result<(Vec<u8>, String)> {
        op.validate()?;

        let session = self.require(owner)?;
        let mut inner = self.lock_session(&session).await?;
        if inner.state == SessionState::Closed || inner.state == SessionState::Closing {
            return Err(Error::SessionClosed);
        }
        let Some(input) = inner.local_copy.clone() else {
            return Err(Error::InvalidOperation(
                "the source has not been downloaded yet".to_string(),
            ));
        };
        inner.last_active = Utc::now();

        inner.artifact_seq += 1;
        let file_name = format!("artifact-{}.{}", inner.artifact_seq, op.output_extension());
        let output = session.namespace.join(&file_name);
        let guard = TempArtifact::new(output.clone());

        // Tool failures leave the session Active so the owner can retry a
        // different operation on the same local copy.
        self.processor.transform(&input, op, &output).await?;

        let bytes = tokio::fs::read(&output).await?;
        drop(guard);
        inner.last_active = Utc::now();
        Ok((bytes, file_name))
    }

    /// Close the owner's session. Closing an absent or already-closed
    /// session is a no-op, not an error.
    pub async fn close(&self, owner: UserId) -> bool {
        let Some((_, session)) = self.sessions.remove(&owner) else {
            return false;
        };
        self.close_session(&session).await;
        true
    }

    /// Close sessions idle beyond the configured window. Returns the owners
    /// whose sessions were reaped.
    pub async fn reap_idle(&self, now: DateTime<Utc>) -> Vec<UserId> {
        let idle = chrono::Duration::from_std(self.opts.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));

        // Collect handles first so no table guard is held across an await.
        let sessions: Vec<(UserId, Arc<WorkspaceSession>)> = self
            .sessions
            .iter()
            .map(|p| (*p.key(), p.value().clone()))
            .collect();

        let mut stale = Vec::new();
        for (owner, session) in sessions {
            let last_active = session.inner.lock().await.last_active;
            if now - last_active >= idle {
                stale.push(owner);
            }
        }

        let mut reaped = Vec::new();
        for owner in stale {
            if self.close(owner).await {
                info!(owner = owner.0, "idle workspace reaped");
                reaped.push(owner);
            }
        }
        reaped
    }

    /// Remove `ws-*` temp namespaces whose owning session no longer exists.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let live: Vec<PathBuf> = self
            .sessions
            .iter()
            .map(|s| s.value().namespace.clone())
            .collect();

        let mut removed = 0usize;
        let mut rd = tokio::fs::read_dir(&self.opts.temp_dir).await?;
        while let Some(ent) = rd.next_entry().await? {
            let path = ent.path();
            let name = ent.file_name().to_string_lossy().to_string();
            if !name.starts_with("ws-") || !path.is_dir() {
                continue;
            }
            if live.contains(&path) {
                continue;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(namespace = %path.display(), "orphaned workspace namespace removed");
                    removed += 1;
                }
                Err(e) => warn!(namespace = %path.display(), "orphan sweep failed: {e}"),
            }
        }
        Ok(removed)
    }

    fn require(&self, owner: UserId) -> Result<Arc<WorkspaceSession>> {
        self.session(owner).ok_or(Error::SessionClosed)
    }

    async fn lock_session<'a>(
        &self,
        session: &'a WorkspaceSession,
    ) -> Result<MutexGuard<'a, SessionInner>> {
        if self.opts.busy_wait {
            Ok(session.inner.lock().await)
        } else {
            session.inner.try_lock().map_err(|_| Error::SessionBusy)
        }
    }

    async fn close_session(&self, session: &WorkspaceSession) {
        // Closing always waits for a running operation, regardless of the
        // busy policy.
        let mut inner = session.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        inner.state = SessionState::Closing;
        inner.local_copy = None;
        if let Err(e) = tokio::fs::remove_dir_all(&session.namespace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    owner = session.owner.0,
                    session = session.id,
                    "workspace cleanup failed: {e}"
                );
            }
        }
        inner.state = SessionState::Closed;
        info!(owner = session.owner.0, session = session.id, "workspace closed");
    }
}

fn source_file_name(source: &StoredItem) -> String {
    let ext = Path::new(&source.display_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    format!("source.{ext}")
}

fn snapshot_of(session: &WorkspaceSession, inner: &SessionInner) -> SessionSnapshot {
    SessionSnapshot {
        id: session.id,
        owner: session.owner,
        source: session.source.clone(),
        state: inner.state,
        downloaded: inner.local_copy.is_some(),
        last_active: inner.last_active,
    }
}

/// Background reaper: closes idle sessions and sweeps orphaned namespaces on
/// a fixed cadence until cancelled.
pub fn spawn_reaper(
    manager: Arc<WorkspaceManager>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tick.tick() => {
                let _ = manager.reap_idle(Utc::now()).await;
                if let Err(e) = manager.sweep_orphans().await {
                    warn!("workspace orphan sweep failed: {e}");
                }
              }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MediaKind, MessageId, MessageRef, Reference};
    use crate::store::RetryPolicy;
    use crate::transport::{ContentTransport, DeliveryOptions, ItemMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FileTransport {
        fetches: AtomicU32,
        failures_left: AtomicU32,
    }

    impl FileTransport {
        fn new(failures: u32) -> Self {
            Self {
                fetches: AtomicU32::new(0),
                failures_left: AtomicU32::new(failures),
            }
        }

        fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentTransport for FileTransport {
        async fn archive(&self, _source: MessageRef) -> Result<Reference> {
            unimplemented!("not used by workspace tests")
        }

        async fn copy_to(
            &self,
            _reference: Reference,
            _dest: ChatId,
            _options: &DeliveryOptions,
        ) -> Result<MessageRef> {
            unimplemented!("not used by workspace tests")
        }

        async fn fetch_to_file(&self, _reference: Reference, dest: &Path) -> Result<u64> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::TransientTransport("rate limited".to_string()));
            }
            std::fs::write(dest, b"source bytes")?;
            Ok(12)
        }

        async fn probe(&self, _reference: Reference) -> Result<Option<ItemMetadata>> {
            Ok(None)
        }

        async fn purge(&self, _reference: Reference) -> Result<bool> {
            Ok(false)
        }
    }

    struct FakeProcessor {
        fail_clips: bool,
        delay: Duration,
    }

    impl FakeProcessor {
        fn ok() -> Self {
            Self {
                fail_clips: false,
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl MediaProcessor for FakeProcessor {
        async fn probe_duration(&self, _input: &Path) -> Result<f64> {
            Ok(120.0)
        }

        async fn transform(
            &self,
            _input: &Path,
            op: &OperationSpec,
            output: &Path,
        ) -> Result<()> {
            if self.delay > Duration::from_millis(0) {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_clips && matches!(op, OperationSpec::Clip { .. }) {
                return Err(Error::Processing {
                    operation: op.name().to_string(),
                    detail: "exit status 1".to_string(),
                });
            }
            std::fs::write(output, b"artifact bytes")?;
            Ok(())
        }
    }

    fn item() -> StoredItem {
        StoredItem {
            reference: Reference(5),
            display_name: "movie.mkv".to_string(),
            byte_size: 12,
            media_kind: MediaKind::Video,
            created_at: Utc::now(),
        }
    }

    fn manager_with(
        transport: Arc<FileTransport>,
        processor: FakeProcessor,
        busy_wait: bool,
    ) -> (WorkspaceManager, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::new(
            transport,
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(0),
            },
        ));
        let mgr = WorkspaceManager::new(
            WorkspaceOptions {
                temp_dir: temp.path().to_path_buf(),
                idle_timeout: Duration::from_secs(600),
                busy_wait,
            },
            store,
            Arc::new(processor),
        );
        (mgr, temp)
    }

    #[tokio::test]
    async fn source_is_downloaded_exactly_once_per_session() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(transport.clone(), FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        mgr.ensure_local_copy(UserId(1)).await.unwrap();

        let op = OperationSpec::Screenshot { at_second: 5 };
        mgr.produce_artifact(UserId(1), &op).await.unwrap();
        mgr.produce_artifact(UserId(1), &op).await.unwrap();
        mgr.ensure_local_copy(UserId(1)).await.unwrap();

        assert_eq!(transport.fetches(), 1);
    }

    #[tokio::test]
    async fn fetch_retries_transient_failures_within_budget() {
        let transport = Arc::new(FileTransport::new(2));
        let (mgr, _tmp) = manager_with(transport.clone(), FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        let path = mgr.ensure_local_copy(UserId(1)).await.unwrap();

        assert!(path.exists());
        assert_eq!(transport.fetches(), 3);
        assert_eq!(
            mgr.status(UserId(1)).await.unwrap().state,
            SessionState::Active
        );
    }

    #[tokio::test]
    async fn fetch_failure_reverts_to_idle_then_a_retry_can_succeed() {
        // 3 failures exhaust the store budget once, then the next attempt works.
        let transport = Arc::new(FileTransport::new(3));
        let (mgr, _tmp) = manager_with(transport.clone(), FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        let err = mgr.ensure_local_copy(UserId(1)).await.unwrap_err();
        assert!(matches!(err, Error::SessionFetch(_)));
        assert_eq!(
            mgr.status(UserId(1)).await.unwrap().state,
            SessionState::Idle
        );

        mgr.ensure_local_copy(UserId(1)).await.unwrap();
        assert_eq!(
            mgr.status(UserId(1)).await.unwrap().state,
            SessionState::Active
        );
    }

    #[tokio::test]
    async fn invalid_clip_is_rejected_without_closing_the_session() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(transport, FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        mgr.ensure_local_copy(UserId(1)).await.unwrap();

        let screenshot = OperationSpec::Screenshot { at_second: 5 };
        mgr.produce_artifact(UserId(1), &screenshot).await.unwrap();

        let too_long = OperationSpec::Clip {
            start_second: 0,
            duration_seconds: 90,
        };
        let err = mgr.produce_artifact(UserId(1), &too_long).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        // Still usable.
        assert_eq!(
            mgr.status(UserId(1)).await.unwrap().state,
            SessionState::Active
        );
        mgr.produce_artifact(UserId(1), &screenshot).await.unwrap();
    }

    #[tokio::test]
    async fn tool_failure_keeps_session_usable_and_leaves_no_file() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(
            transport,
            FakeProcessor {
                fail_clips: true,
                delay: Duration::from_millis(0),
            },
            false,
        );

        mgr.open(UserId(1), item()).await.unwrap();
        mgr.ensure_local_copy(UserId(1)).await.unwrap();

        let clip = OperationSpec::Clip {
            start_second: 0,
            duration_seconds: 10,
        };
        let err = mgr.produce_artifact(UserId(1), &clip).await.unwrap_err();
        assert!(matches!(err, Error::Processing { .. }));

        let session = mgr.session(UserId(1)).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(&session.namespace)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("artifact-"))
            .collect();
        assert!(leftovers.is_empty());

        let screenshot = OperationSpec::Screenshot { at_second: 1 };
        mgr.produce_artifact(UserId(1), &screenshot).await.unwrap();
    }

    #[tokio::test]
    async fn artifact_file_is_gone_after_bytes_are_returned() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(transport, FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        mgr.ensure_local_copy(UserId(1)).await.unwrap();

        let (bytes, name) = mgr
            .produce_artifact(UserId(1), &OperationSpec::Screenshot { at_second: 0 })
            .await
            .unwrap();
        assert_eq!(bytes, b"artifact bytes");

        let session = mgr.session(UserId(1)).unwrap();
        assert!(!session.namespace.join(name).exists());
    }

    #[tokio::test]
    async fn opening_a_second_session_closes_the_first_and_releases_its_copy() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(transport, FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        let copy = mgr.ensure_local_copy(UserId(1)).await.unwrap();
        let first_namespace = mgr.session(UserId(1)).unwrap().namespace.clone();
        assert!(copy.exists());

        let second = StoredItem {
            reference: Reference(6),
            ..item()
        };
        mgr.open(UserId(1), second).await.unwrap();

        assert!(!copy.exists());
        assert!(!first_namespace.exists());
        let status = mgr.status(UserId(1)).await.unwrap();
        assert_eq!(status.source.reference, Reference(6));
        assert_eq!(status.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(transport, FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        assert!(mgr.close(UserId(1)).await);
        assert!(!mgr.close(UserId(1)).await);
    }

    #[tokio::test]
    async fn concurrent_operation_is_rejected_when_not_waiting() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(
            transport,
            FakeProcessor {
                fail_clips: false,
                delay: Duration::from_millis(100),
            },
            false,
        );
        let mgr = Arc::new(mgr);

        mgr.open(UserId(1), item()).await.unwrap();
        mgr.ensure_local_copy(UserId(1)).await.unwrap();

        let slow = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.produce_artifact(UserId(1), &OperationSpec::Screenshot { at_second: 0 })
                    .await
            })
        };
        // Let the slow transform take the session lock.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = mgr
            .produce_artifact(UserId(1), &OperationSpec::Screenshot { at_second: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionBusy));

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, _tmp) = manager_with(transport, FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        assert!(mgr.reap_idle(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(mgr.reap_idle(later).await, vec![UserId(1)]);
        assert!(mgr.session(UserId(1)).is_none());
    }

    #[tokio::test]
    async fn orphan_sweep_removes_stale_namespaces_only() {
        let transport = Arc::new(FileTransport::new(0));
        let (mgr, tmp) = manager_with(transport, FakeProcessor::ok(), false);

        mgr.open(UserId(1), item()).await.unwrap();
        let live = mgr.session(UserId(1)).unwrap().namespace.clone();

        let orphan = tmp.path().join("ws-99-42");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("source.mp4"), b"stale").unwrap();

        assert_eq!(mgr.sweep_orphans().await.unwrap(), 1);
        assert!(!orphan.exists());
        assert!(live.exists());
    }
}
