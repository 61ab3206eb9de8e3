// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace lease manager.
//!
//! Grants this process an exclusive, heartbeated lease on a workspace root.
//! Exclusion across processes is cooperative: a lock file is created
//! atomically, kept fresh by a single shared heartbeat task, and reclaimed by
//! competitors once it goes stale. Within the process, the set of owned leases
//! is guarded by a mutex that is never held across an await, and every
//! read-modify-write of a lock file runs under a separate async mutex so a
//! heartbeat cannot rewrite a file that a concurrent release just removed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::LockSettings;
use crate::error::{LockFailure, LockFailureReason};
use crate::telemetry::metrics::{count, TimedOperation};

use super::liveness::{local_hostname, ProcessLiveness, SystemLiveness};
use super::token::LockToken;

/// Dotfile directory holding the lock file, relative to the workspace root.
pub const LOCK_DIR: &str = ".agentdesk";

/// Lock file name inside [`LOCK_DIR`].
pub const LOCK_FILE: &str = "workspace.lock";

/// Pause between a contested overwrite and the confirming re-read.
const RECLAIM_SETTLE: Duration = Duration::from_millis(25);

/// How often a vanished lock file is retried before giving up.
const CREATE_ATTEMPTS: usize = 3;

/// Location of the lock file for a workspace root.
pub fn lock_file_path(root: &Path) -> PathBuf {
    root.join(LOCK_DIR).join(LOCK_FILE)
}

/// Successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquired {
    pub root: PathBuf,
    pub lock_file_path: PathBuf,
}

/// Outcome of [`WorkspaceLockManager::acquire`].
pub type LockResult = Result<LockAcquired, LockFailure>;

/// A lease this process currently owns.
#[derive(Debug, Clone)]
pub struct OwnedLock {
    pub workspace_root: PathBuf,
    pub lock_file_path: PathBuf,
    pub acquired_at: i64,
    consecutive_failures: u32,
    failing_since: Option<Instant>,
    at_risk_reported: bool,
}

impl OwnedLock {
    fn new(workspace_root: PathBuf, lock_file_path: PathBuf, acquired_at: i64) -> Self {
        Self {
            workspace_root,
            lock_file_path,
            acquired_at,
            consecutive_failures: 0,
            failing_since: None,
            at_risk_reported: false,
        }
    }
}

/// Notifications about leases owned by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired { root: PathBuf },
    Released { root: PathBuf },
    /// Another instance now owns the lock file; the lease was dropped.
    Superseded { root: PathBuf },
    /// A heartbeat write failed; the lease is kept and retried next tick.
    HeartbeatFailed {
        root: PathBuf,
        consecutive: u32,
        error: String,
    },
    /// Heartbeats have failed for longer than the stale threshold, so
    /// competitors may already treat the lease as reclaimable.
    LeaseAtRisk { root: PathBuf },
}

/// Side-effect free view of a workspace lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    OwnedByUs(LockToken),
    Held { token: LockToken, stale: bool },
}

/// Acquires, refreshes, and releases workspace leases for this process.
///
/// Cloning yields another handle to the same set of leases.
#[derive(Clone)]
pub struct WorkspaceLockManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: LockSettings,
    instance_id: String,
    pid: u32,
    hostname: String,
    liveness: Arc<dyn ProcessLiveness>,
    owned: Mutex<HashMap<PathBuf, OwnedLock>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<LockEvent>,
    write_seq: AtomicU64,
    /// Serialises lock file writes and removals made by this instance.
    file_io: tokio::sync::Mutex<()>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl WorkspaceLockManager {
    /// Create a manager with a fresh instance id and OS liveness probing.
    pub fn new(settings: LockSettings) -> Self {
        Self::with_liveness(settings, Arc::new(SystemLiveness))
    }

    /// Create a manager with a custom liveness probe.
    pub fn with_liveness(settings: LockSettings, liveness: Arc<dyn ProcessLiveness>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                settings,
                instance_id: uuid::Uuid::new_v4().to_string(),
                pid: std::process::id(),
                hostname: local_hostname(),
                liveness,
                owned: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(None),
                events,
                write_seq: AtomicU64::new(0),
                file_io: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Process-lifetime unique id written into every token.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn settings(&self) -> &LockSettings {
        &self.inner.settings
    }

    /// Subscribe to lease notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    /// Roots this process currently holds leases for.
    pub fn owned_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<_> = guard(&self.inner.owned).keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Check whether the lease on `root` is currently held by this process.
    pub async fn is_owned(&self, root: &Path) -> bool {
        let root = resolve_lenient(root).await;
        guard(&self.inner.owned).contains_key(&root)
    }

    /// Whether the shared heartbeat task is running.
    pub fn heartbeat_running(&self) -> bool {
        guard(&self.inner.heartbeat)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Acquire the lease for `root`, refreshing it if already owned.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn acquire(&self, root: &Path) -> LockResult {
        let timer = TimedOperation::start("lock.acquire");
        let result = self.inner.acquire(root).await;
        timer.finish();

        match &result {
            Ok(acquired) => {
                count("lock.acquire.ok");
                debug!(lock_file = %acquired.lock_file_path.display(), "Workspace lock held");
            }
            Err(failure) if failure.is_in_use() => {
                count("lock.acquire.in_use");
                info!(owner = ?failure.owner, "Workspace lock is in use");
            }
            Err(failure) => {
                count("lock.acquire.failed");
                warn!(reason = %failure.reason, message = %failure.message, "Workspace lock failed");
            }
        }
        result
    }

    /// Release the lease for `root`.
    ///
    /// The lock file is removed only if the on-disk token belongs to this
    /// instance; returns whether it was removed. The local record is dropped
    /// either way.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn release(&self, root: &Path) -> bool {
        let root = resolve_lenient(root).await;
        let path = lock_file_path(&root);
        let io_guard = self.inner.file_io.lock().await;

        let ours = match read_lock_file(&path).await {
            Ok(Some(raw)) => LockToken::decode(&raw)
                .is_some_and(|t| t.instance_id == self.inner.instance_id),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Could not read lock file during release");
                false
            }
        };

        let removed = if ours {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to remove lock file");
                    false
                }
            }
        } else {
            false
        };

        self.inner.forget(&root);
        drop(io_guard);
        if removed {
            info!("Released workspace lock");
            self.inner.emit(LockEvent::Released { root });
        }
        removed
    }

    /// Delete whatever lock file exists for `root`, then acquire it.
    ///
    /// Used for an explicit user override of a stuck or in-use lock.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn force_claim(&self, root: &Path) -> LockResult {
        let resolved = resolve_lenient(root).await;
        let path = lock_file_path(&resolved);
        {
            let _io = self.inner.file_io.lock().await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Removed existing lock file for force claim"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "Could not remove lock file before force claim"),
            }
            self.inner.forget(&resolved);
        }
        self.acquire(root).await
    }

    /// Release every lease this process owns.
    pub async fn release_all(&self) -> usize {
        let mut released = 0;
        for root in self.owned_roots() {
            if self.release(&root).await {
                released += 1;
            }
        }
        released
    }

    /// Inspect the lock for `root` without modifying anything.
    pub async fn status(&self, root: &Path) -> Result<LockStatus, LockFailure> {
        let root = resolve_root(root).await?;
        let raw = read_lock_file(&lock_file_path(&root))
            .await
            .map_err(|e| LockFailure::io(&root, &e))?;

        Ok(match raw.as_deref().and_then(LockToken::decode) {
            None => LockStatus::Free,
            Some(token) if token.instance_id == self.inner.instance_id => {
                LockStatus::OwnedByUs(token)
            }
            Some(token) => {
                let stale = self.is_stale(&token, now_ms());
                LockStatus::Held { token, stale }
            }
        })
    }

    /// Staleness rule used by [`acquire`](Self::acquire).
    ///
    /// Tokens from this instance are never stale. Others are stale when the
    /// heartbeat is older than the threshold, or when the owner claims this
    /// host and its pid is gone.
    pub fn is_stale(&self, token: &LockToken, now_ms: i64) -> bool {
        self.inner.is_stale(token, now_ms)
    }

    /// Staleness plus the caller grace window, for deciding whether to offer
    /// a takeover without racing the owner's in-flight heartbeat.
    pub fn is_contestable(&self, token: &LockToken, now_ms: i64) -> bool {
        if token.instance_id == self.inner.instance_id {
            return false;
        }
        let limit = self.inner.settings.stale_threshold + self.inner.settings.grace;
        token.heartbeat_age_ms(now_ms) > limit.as_millis() as u64 || self.inner.owner_is_dead(token)
    }

    /// Run one heartbeat pass immediately.
    pub async fn heartbeat_now(&self) {
        self.inner.heartbeat_once().await;
    }
}

impl Inner {
    async fn acquire(self: &Arc<Self>, requested: &Path) -> LockResult {
        let root = resolve_root(requested).await?;
        let lock_path = lock_file_path(&root);
        let io_failure = |e: io::Error| LockFailure::io(&root, &e);
        let _io = self.file_io.lock().await;

        let owned_record = guard(&self.owned).get(&root).cloned();
        if let Some(lease) = owned_record {
            match self.refresh_lease(&lease).await {
                Ok(true) => {
                    return Ok(LockAcquired {
                        root,
                        lock_file_path: lock_path,
                    })
                }
                Ok(false) => {
                    info!("Previously owned lease was superseded, contending again");
                    self.forget(&root);
                    self.emit(LockEvent::Superseded { root: root.clone() });
                }
                Err(e) => return Err(io_failure(e)),
            }
        }

        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_failure)?;
        }

        let token = self.new_token(&root, now_ms());
        let encoded = token.encode();

        for _ in 0..CREATE_ATTEMPTS {
            match create_exclusive(&lock_path, &encoded, &self.staging_tag()).await {
                Ok(()) => {
                    self.record_owned(&root, &lock_path, token.acquired_at);
                    return Ok(LockAcquired {
                        root,
                        lock_file_path: lock_path,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_failure(e)),
            }

            let raw = match read_lock_file(&lock_path).await.map_err(io_failure)? {
                Some(raw) => raw,
                // Removed between our create and read; try again
                None => continue,
            };

            match LockToken::decode(&raw) {
                Some(existing) if existing.instance_id == self.instance_id => {
                    debug!("Lock file already carries our instance id");
                }
                Some(existing) if !self.is_stale(&existing, now_ms()) => {
                    return Err(LockFailure::in_use(&root, existing.owner()));
                }
                Some(existing) => {
                    info!(
                        pid = existing.pid,
                        hostname = %existing.hostname,
                        heartbeat_at = existing.heartbeat_at,
                        "Reclaiming stale workspace lock"
                    );
                }
                None => warn!("Lock file is invalid, reclaiming"),
            }

            write_atomic(&lock_path, &encoded, &self.staging_tag())
                .await
                .map_err(io_failure)?;
            tokio::time::sleep(RECLAIM_SETTLE).await;

            let confirmed = read_lock_file(&lock_path)
                .await
                .map_err(io_failure)?
                .as_deref()
                .and_then(LockToken::decode);

            return match confirmed {
                Some(current) if current.instance_id == self.instance_id => {
                    count("lock.acquire.reclaimed");
                    self.record_owned(&root, &lock_path, token.acquired_at);
                    Ok(LockAcquired {
                        root,
                        lock_file_path: lock_path,
                    })
                }
                Some(current) => Err(LockFailure::in_use(&root, current.owner())),
                None => Err(LockFailure {
                    reason: LockFailureReason::Error,
                    root,
                    message: "lock file changed while reclaiming".to_string(),
                    owner: None,
                }),
            };
        }

        Err(LockFailure {
            reason: LockFailureReason::Error,
            root,
            message: "lock file kept disappearing during acquisition".to_string(),
            owner: None,
        })
    }

    fn new_token(&self, root: &Path, now: i64) -> LockToken {
        LockToken::new(
            self.settings.app_id.clone(),
            self.instance_id.clone(),
            self.pid,
            self.hostname.clone(),
            root,
            now,
        )
    }

    fn staging_tag(&self) -> String {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.instance_id, seq)
    }

    fn is_stale(&self, token: &LockToken, now: i64) -> bool {
        if token.instance_id == self.instance_id {
            return false;
        }
        if token.heartbeat_age_ms(now) > self.settings.stale_threshold.as_millis() as u64 {
            return true;
        }
        self.owner_is_dead(token)
    }

    /// Pid liveness only means something on the host that wrote the token.
    fn owner_is_dead(&self, token: &LockToken) -> bool {
        token.hostname == self.hostname && !self.liveness.is_alive(token.pid)
    }

    fn emit(&self, event: LockEvent) {
        let _ = self.events.send(event);
    }

    fn record_owned(self: &Arc<Self>, root: &Path, lock_path: &Path, acquired_at: i64) {
        let mut owned = guard(&self.owned);
        owned.insert(
            root.to_path_buf(),
            OwnedLock::new(root.to_path_buf(), lock_path.to_path_buf(), acquired_at),
        );
        // Heartbeat lifecycle changes only while `owned` is locked
        self.ensure_heartbeat();
        drop(owned);
        self.emit(LockEvent::Acquired {
            root: root.to_path_buf(),
        });
    }

    fn forget(&self, root: &Path) {
        let mut owned = guard(&self.owned);
        owned.remove(root);
        if owned.is_empty() {
            if let Some(handle) = guard(&self.heartbeat).take() {
                debug!("No leases left, stopping heartbeat");
                handle.abort();
            }
        }
    }

    fn ensure_heartbeat(self: &Arc<Self>) {
        let mut slot = guard(&self.heartbeat);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.settings.heartbeat_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.heartbeat_once().await;
            }
        }));
    }

    /// Refresh every owned lease once, dropping superseded ones.
    async fn heartbeat_once(&self) {
        let leases: Vec<OwnedLock> = guard(&self.owned).values().cloned().collect();

        for lease in leases {
            let root = lease.workspace_root.clone();
            let _io = self.file_io.lock().await;
            // Released or re-acquired since the snapshot
            let current = guard(&self.owned)
                .get(&root)
                .is_some_and(|l| l.acquired_at == lease.acquired_at);
            if !current {
                continue;
            }
            match self.refresh_lease(&lease).await {
                Ok(true) => {
                    if let Some(entry) = guard(&self.owned).get_mut(&root) {
                        entry.consecutive_failures = 0;
                        entry.failing_since = None;
                        entry.at_risk_reported = false;
                    }
                }
                Ok(false) => {
                    info!(root = %root.display(), "Workspace lease superseded by another instance");
                    count("lock.superseded");
                    self.forget(&root);
                    self.emit(LockEvent::Superseded { root });
                }
                Err(e) => self.note_heartbeat_failure(&root, &e),
            }
        }
    }

    fn note_heartbeat_failure(&self, root: &Path, err: &io::Error) {
        count("lock.heartbeat.failed");

        let (consecutive, at_risk) = {
            let mut owned = guard(&self.owned);
            let Some(entry) = owned.get_mut(root) else {
                return;
            };
            entry.consecutive_failures += 1;
            let since = *entry.failing_since.get_or_insert_with(Instant::now);
            let at_risk = !entry.at_risk_reported && since.elapsed() >= self.settings.stale_threshold;
            if at_risk {
                entry.at_risk_reported = true;
            }
            (entry.consecutive_failures, at_risk)
        };

        warn!(
            root = %root.display(),
            consecutive,
            error = %err,
            "Workspace lock heartbeat failed"
        );
        self.emit(LockEvent::HeartbeatFailed {
            root: root.to_path_buf(),
            consecutive,
            error: err.to_string(),
        });
        if at_risk {
            warn!(root = %root.display(), "Workspace lease may now look stale to other instances");
            self.emit(LockEvent::LeaseAtRisk {
                root: root.to_path_buf(),
            });
        }
    }

    /// Rewrite the token with a new heartbeat if it is still ours.
    ///
    /// `Ok(false)` means the file is gone or belongs to someone else.
    async fn refresh_lease(&self, lease: &OwnedLock) -> io::Result<bool> {
        let current = read_lock_file(&lease.lock_file_path)
            .await?
            .as_deref()
            .and_then(LockToken::decode);

        match current {
            Some(token) if token.instance_id == self.instance_id => {
                let refreshed = LockToken {
                    acquired_at: lease.acquired_at,
                    ..token.refreshed(now_ms())
                };
                write_atomic(&lease.lock_file_path, &refreshed.encode(), &self.staging_tag()).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = guard(&self.heartbeat).take() {
            handle.abort();
        }
    }
}

/// Resolve to an absolute directory path, or fail with `invalid-workspace`.
async fn resolve_root(root: &Path) -> Result<PathBuf, LockFailure> {
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| LockFailure::io(root, &e))?
            .join(root)
    };

    let canonical = match tokio::fs::canonicalize(&absolute).await {
        Ok(path) => path,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            return Err(LockFailure::invalid_workspace(absolute, "workspace does not exist"));
        }
        Err(e) => return Err(LockFailure::io(absolute, &e)),
    };

    match tokio::fs::metadata(&canonical).await {
        Ok(meta) if meta.is_dir() => Ok(canonical),
        Ok(_) => Err(LockFailure::invalid_workspace(canonical, "workspace is not a directory")),
        Err(e) => Err(LockFailure::io(canonical, &e)),
    }
}

/// Like [`resolve_root`] but falls back to the given path when it cannot be
/// resolved, for operations that must not fail.
async fn resolve_lenient(root: &Path) -> PathBuf {
    match resolve_root(root).await {
        Ok(path) => path,
        Err(failure) => failure.root,
    }
}

async fn read_lock_file(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn staging_path(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| LOCK_FILE.to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, tag))
}

/// Create `path` with `contents` only if it does not exist yet.
///
/// The token is staged in a sibling file and hard-linked into place so that
/// readers never observe an empty or partial lock file. Filesystems without
/// hard links fall back to `create_new`.
async fn create_exclusive(path: &Path, contents: &str, tag: &str) -> io::Result<()> {
    let staging = staging_path(path, tag);
    tokio::fs::write(&staging, contents).await?;
    let linked = tokio::fs::hard_link(&staging, path).await;
    let _ = tokio::fs::remove_file(&staging).await;

    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!(error = %e, "Hard link unavailable, using create_new");
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
            Ok(())
        }
    }
}

/// Replace `path` atomically via write-then-rename.
async fn write_atomic(path: &Path, contents: &str, tag: &str) -> io::Result<()> {
    let staging = staging_path(path, tag);
    tokio::fs::write(&staging, contents).await?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::liveness::MockProcessLiveness;
    use tempfile::TempDir;

    fn fast_settings() -> LockSettings {
        LockSettings {
            heartbeat_interval: Duration::from_millis(50),
            ..LockSettings::default()
        }
    }

    fn manager_with_liveness(alive: bool) -> WorkspaceLockManager {
        let mut liveness = MockProcessLiveness::new();
        liveness.expect_is_alive().return_const(alive);
        WorkspaceLockManager::with_liveness(fast_settings(), Arc::new(liveness))
    }

    fn foreign_token(root: &Path, heartbeat_age_ms: i64, hostname: &str) -> LockToken {
        let now = now_ms();
        LockToken {
            heartbeat_at: now - heartbeat_age_ms,
            ..LockToken::new("agentdesk", "someone-else", 999_999, hostname, root, now - 60_000)
        }
    }

    async fn write_token(root: &Path, token: &LockToken) {
        let path = lock_file_path(root);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, token.encode()).await.unwrap();
    }

    async fn disk_token(root: &Path) -> Option<LockToken> {
        let raw = tokio::fs::read_to_string(lock_file_path(root)).await.ok()?;
        LockToken::decode(&raw)
    }

    #[tokio::test]
    async fn test_acquire_creates_token() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceLockManager::new(fast_settings());

        let acquired = manager.acquire(dir.path()).await.unwrap();
        assert!(acquired.lock_file_path.ends_with(".agentdesk/workspace.lock"));

        let token = disk_token(dir.path()).await.unwrap();
        assert_eq!(token.instance_id, manager.instance_id());
        assert_eq!(token.pid, std::process::id());
        assert_eq!(token.workspace_root, acquired.root);
        assert!(manager.heartbeat_running());
    }

    #[tokio::test]
    async fn test_acquire_missing_root_is_invalid() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceLockManager::new(fast_settings());
        let failure = manager.acquire(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(failure.reason, LockFailureReason::InvalidWorkspace);
    }

    #[tokio::test]
    async fn test_acquire_file_root_is_invalid() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let manager = WorkspaceLockManager::new(fast_settings());
        let failure = manager.acquire(&file).await.unwrap_err();
        assert_eq!(failure.reason, LockFailureReason::InvalidWorkspace);
    }

    #[tokio::test]
    async fn test_repeated_acquire_preserves_acquired_at() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceLockManager::new(fast_settings());

        manager.acquire(dir.path()).await.unwrap();
        let first = disk_token(dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.acquire(dir.path()).await.unwrap();
        let second = disk_token(dir.path()).await.unwrap();

        assert_eq!(first.acquired_at, second.acquired_at);
        assert!(second.heartbeat_at >= first.heartbeat_at);
    }

    #[tokio::test]
    async fn test_live_foreign_token_is_in_use() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let manager = manager_with_liveness(true);
        write_token(&root, &foreign_token(&root, 1_000, &local_hostname())).await;

        let failure = manager.acquire(&root).await.unwrap_err();
        assert!(failure.is_in_use());
        let owner = failure.owner.unwrap();
        assert_eq!(owner.pid, 999_999);
        assert_eq!(disk_token(&root).await.unwrap().instance_id, "someone-else");
    }

    #[tokio::test]
    async fn test_dead_local_pid_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let manager = manager_with_liveness(false);
        write_token(&root, &foreign_token(&root, 1_000, &local_hostname())).await;

        manager.acquire(&root).await.unwrap();
        assert_eq!(disk_token(&root).await.unwrap().instance_id, manager.instance_id());
    }

    #[tokio::test]
    async fn test_dead_pid_on_other_host_is_not_probed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut liveness = MockProcessLiveness::new();
        liveness.expect_is_alive().never();
        let manager = WorkspaceLockManager::with_liveness(fast_settings(), Arc::new(liveness));
        write_token(&root, &foreign_token(&root, 1_000, "some-other-host")).await;

        assert!(manager.acquire(&root).await.unwrap_err().is_in_use());
    }

    #[tokio::test]
    async fn test_expired_heartbeat_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let manager = manager_with_liveness(true);
        write_token(&root, &foreign_token(&root, 30_001, &local_hostname())).await;

        manager.acquire(&root).await.unwrap();
        assert_eq!(disk_token(&root).await.unwrap().instance_id, manager.instance_id());
    }

    #[tokio::test]
    async fn test_corrupt_token_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let path = lock_file_path(&root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"version\": 1, \"pid\": \"oops\"}").unwrap();

        let manager = WorkspaceLockManager::new(fast_settings());
        manager.acquire(&root).await.unwrap();
        assert_eq!(disk_token(&root).await.unwrap().instance_id, manager.instance_id());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_leaves_token() {
        let dir = TempDir::new().unwrap();
        let owner = WorkspaceLockManager::new(fast_settings());
        let other = WorkspaceLockManager::new(fast_settings());

        owner.acquire(dir.path()).await.unwrap();
        let before = disk_token(dir.path()).await.unwrap();

        assert!(!other.release(dir.path()).await);
        assert_eq!(disk_token(dir.path()).await.unwrap(), before);

        assert!(owner.release(dir.path()).await);
        assert!(disk_token(dir.path()).await.is_none());
        assert!(!owner.heartbeat_running());
    }

    #[tokio::test]
    async fn test_force_claim_overrides_live_owner() {
        let dir = TempDir::new().unwrap();
        let first = WorkspaceLockManager::new(fast_settings());
        let second = WorkspaceLockManager::new(fast_settings());

        first.acquire(dir.path()).await.unwrap();
        assert!(second.acquire(dir.path()).await.unwrap_err().is_in_use());

        second.force_claim(dir.path()).await.unwrap();
        assert_eq!(disk_token(dir.path()).await.unwrap().instance_id, second.instance_id());
    }

    #[tokio::test]
    async fn test_heartbeat_drops_superseded_lease() {
        let dir = TempDir::new().unwrap();
        let first = WorkspaceLockManager::new(fast_settings());
        let second = WorkspaceLockManager::new(fast_settings());
        let mut events = first.subscribe();

        first.acquire(dir.path()).await.unwrap();
        second.force_claim(dir.path()).await.unwrap();

        first.heartbeat_now().await;
        assert!(first.owned_roots().is_empty());
        assert_eq!(disk_token(dir.path()).await.unwrap().instance_id, second.instance_id());

        let mut saw_superseded = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LockEvent::Superseded { .. }) {
                saw_superseded = true;
            }
        }
        assert!(saw_superseded);
    }

    #[tokio::test]
    async fn test_heartbeat_advances_timestamp() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceLockManager::new(fast_settings());
        manager.acquire(dir.path()).await.unwrap();
        let before = disk_token(dir.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let after = disk_token(dir.path()).await.unwrap();
        assert_eq!(after.acquired_at, before.acquired_at);
        assert!(after.heartbeat_at > before.heartbeat_at);
    }

    #[tokio::test]
    async fn test_status_reports_holder() {
        let dir = TempDir::new().unwrap();
        let owner = WorkspaceLockManager::new(fast_settings());
        let observer = WorkspaceLockManager::new(fast_settings());

        assert_eq!(observer.status(dir.path()).await.unwrap(), LockStatus::Free);
        owner.acquire(dir.path()).await.unwrap();

        assert!(matches!(owner.status(dir.path()).await.unwrap(), LockStatus::OwnedByUs(_)));
        match observer.status(dir.path()).await.unwrap() {
            LockStatus::Held { token, stale } => {
                assert_eq!(token.instance_id, owner.instance_id());
                assert!(!stale);
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contestable_adds_grace() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let manager = manager_with_liveness(true);
        let token = foreign_token(&root, 31_000, &local_hostname());
        let now = token.heartbeat_at + 31_000;

        assert!(manager.is_stale(&token, now));
        assert!(!manager.is_contestable(&token, now));
        assert!(manager.is_contestable(&token, token.heartbeat_at + 32_001));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_racing_heartbeat_leaves_no_lock_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let manager = manager_with_liveness(true);
        let mut events = manager.subscribe();

        for _ in 0..20 {
            manager.acquire(&root).await.unwrap();
            let beat = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.heartbeat_now().await })
            };
            assert!(manager.release(&root).await);
            beat.await.unwrap();

            assert!(!lock_file_path(&root).exists());
            assert!(!manager.is_owned(&root).await);
        }

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, LockEvent::Superseded { .. }), "{:?}", event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_heartbeat_keeps_lease_and_warns_once() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let manager = WorkspaceLockManager::new(LockSettings {
            heartbeat_interval: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(5),
            ..LockSettings::default()
        });
        manager.acquire(&root).await.unwrap();
        let mut events = manager.subscribe();

        // A directory in place of the lock file makes every refresh fail
        let path = lock_file_path(&root);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        tokio::time::sleep(Duration::from_millis(8_500)).await;

        let mut consecutive = Vec::new();
        let mut at_risk = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                LockEvent::HeartbeatFailed { consecutive: n, .. } => consecutive.push(n),
                LockEvent::LeaseAtRisk { root: at } => {
                    assert_eq!(at, root);
                    assert!(consecutive.len() >= 6);
                    at_risk += 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert!(consecutive.len() >= 6, "{:?}", consecutive);
        assert_eq!(consecutive[0], 1);
        assert!(consecutive.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(at_risk, 1);
        assert_eq!(manager.owned_roots(), vec![root.clone()]);
        assert!(manager.heartbeat_running());
    }
}
