//! Brings the local theme in line with a remote checksum snapshot.
//!
//! Passive reconciliation only ever pulls: remote-only and changed keys are
//! downloaded, files the remote lost are deleted locally when allowed. Local
//! edits reach the platform through the uploader instead, and a key with a
//! local change still waiting for upload is left alone and reported as a
//! conflict. The upload then wins by arrival order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checksum::{Checksum, Key};
use crate::glob::FileFilter;
use crate::theme_api::{with_retry, RetryPolicy, ThemeApi};
use crate::theme_fs::{LocalSnapshot, Origin, ThemeFileSystem, ThemeFsError};
use crate::uploader::UploadRetries;

/// Downloads in flight at once during one pass.
pub const DOWNLOAD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub no_delete: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            no_delete: false,
            concurrency: DOWNLOAD_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

/// What one pass intends to do. Derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// Remote-only or changed keys.
    pub to_download: Vec<Key>,
    /// Local-only keys that the uploader is expected to push.
    pub to_upload: Vec<Key>,
    /// Local-only keys that existed before this session and are gone remotely.
    pub to_delete: Vec<Key>,
    /// Local-only keys left alone because deleting is disabled.
    pub kept: Vec<Key>,
    /// Keys that differ but carry an unuploaded local change.
    pub conflicts: Vec<Key>,
}

impl ReconciliationPlan {
    /// Whether executing the plan would touch any local file.
    pub fn has_actions(&self) -> bool {
        !self.to_download.is_empty() || !self.to_delete.is_empty()
    }
}

/// Computes the three-way diff between the local index and a remote snapshot.
pub fn plan_reconciliation(
    local: &LocalSnapshot,
    remote: &[Checksum],
    options: &ReconcileOptions,
    filter: &FileFilter,
) -> ReconciliationPlan {
    let local_files: BTreeMap<&str, _> = local
        .files
        .iter()
        .filter(|file| filter.accepts(&file.key))
        .map(|file| (file.key.as_str(), file))
        .collect();

    let remote: BTreeMap<&str, &str> = remote
        .iter()
        .filter(|entry| filter.accepts(&entry.key))
        .map(|entry| (entry.key.as_str(), entry.checksum.as_str()))
        .collect();

    let mut plan = ReconciliationPlan::default();

    for (key, remote_checksum) in &remote {
        let differs = match local_files.get(key) {
            Some(file) => file.checksum != *remote_checksum,
            None => true,
        };
        if !differs {
            continue;
        }

        if local.unsynced.contains(*key) {
            plan.conflicts.push(key.to_string());
        } else {
            plan.to_download.push(key.to_string());
        }
    }

    for (key, file) in &local_files {
        if remote.contains_key(key) {
            continue;
        }

        if file.created_in_session || local.unsynced.contains(*key) {
            plan.to_upload.push(key.to_string());
        } else if options.no_delete {
            plan.kept.push(key.to_string());
        } else {
            plan.to_delete.push(key.to_string());
        }
    }

    plan
}

/// Summary of an executed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub downloaded: Vec<Key>,
    pub deleted: Vec<Key>,
    pub kept: Vec<Key>,
    pub conflicts: Vec<Key>,
    pub failed: Vec<(Key, String)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.downloaded.is_empty()
            && self.deleted.is_empty()
            && self.conflicts.is_empty()
            && self.failed.is_empty()
    }
}

enum DownloadOutcome {
    Downloaded(Key),
    Conflict(Key),
    Failed(Key, String),
}

/// Single-flight guard. A snapshot arriving while a pass runs replaces any
/// snapshot already waiting, so bursts of remote changes cost one extra pass.
#[derive(Default)]
struct Coordination {
    in_flight: bool,
    pending: Option<Arc<Vec<Checksum>>>,
}

pub struct Reconciler {
    fs: ThemeFileSystem,
    api: Arc<dyn ThemeApi>,
    theme_id: u64,
    options: ReconcileOptions,
    coordination: Mutex<Coordination>,
    background: Mutex<Option<JoinHandle<()>>>,
    upload_retries: UploadRetries,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        fs: ThemeFileSystem,
        api: Arc<dyn ThemeApi>,
        theme_id: u64,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            fs,
            api,
            theme_id,
            options,
            coordination: Mutex::new(Coordination::default()),
            background: Mutex::new(None),
            upload_retries: UploadRetries::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Every pass, and every poll that found nothing to do, gives parked
    /// uploads another try.
    pub fn with_upload_retries(mut self, retries: UploadRetries) -> Self {
        self.upload_retries = retries;
        self
    }

    /// Once `cancel` fires, no further pass starts and a running pass stops
    /// touching the local theme.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wakes the uploader if it has work parked from earlier failures.
    pub fn retry_uploads(&self) {
        self.upload_retries.trigger();
    }

    fn lock(&self) -> MutexGuard<'_, Coordination> {
        self.coordination.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the reconciler for `snapshot`, or parks it behind the pass in
    /// flight. Returns the snapshot back when the caller should run it.
    fn begin(&self, snapshot: Arc<Vec<Checksum>>) -> Option<Arc<Vec<Checksum>>> {
        let mut coordination = self.lock();
        if coordination.in_flight {
            log::debug!("Reconciliation in progress, queueing newer remote snapshot");
            coordination.pending = Some(snapshot);
            None
        } else {
            coordination.in_flight = true;
            Some(snapshot)
        }
    }

    /// Runs `first`, then whatever was queued meanwhile, until nothing is left.
    async fn drain(&self, first: Arc<Vec<Checksum>>) -> ReconcileReport {
        let mut report = self.run_pass(&first).await;

        loop {
            let next = {
                let mut coordination = self.lock();
                match coordination.pending.take() {
                    Some(next) if !self.cancel.is_cancelled() => next,
                    _ => {
                        coordination.pending = None;
                        coordination.in_flight = false;
                        break;
                    }
                }
            };
            report = self.run_pass(&next).await;
        }

        report
    }

    /// Reconciles against `snapshot` and waits for the result. Returns `None`
    /// when another pass was running; the snapshot then runs after it.
    pub async fn submit(&self, snapshot: Arc<Vec<Checksum>>) -> Option<ReconcileReport> {
        let snapshot = self.begin(snapshot)?;
        Some(self.drain(snapshot).await)
    }

    /// Like `submit`, without waiting. Snapshots enqueued from one task are
    /// applied in the order they were enqueued.
    pub fn enqueue(self: &Arc<Self>, snapshot: Arc<Vec<Checksum>>) {
        if let Some(snapshot) = self.begin(snapshot) {
            let reconciler = Arc::clone(self);
            let handle = tokio::spawn(async move {
                reconciler.drain(snapshot).await;
            });
            *self.background.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().in_flight
    }

    /// Waits for a pass started by `enqueue` to finish. Cancel the token
    /// given to `with_cancellation` first to cut it short.
    pub async fn shutdown(&self) {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::debug!("Reconciliation task ended abnormally: {err}");
            }
        }
    }

    async fn run_pass(&self, snapshot: &[Checksum]) -> ReconcileReport {
        let local = self.fs.local_snapshot();
        let plan = plan_reconciliation(&local, snapshot, &self.options, self.fs.filter());
        let has_actions = plan.has_actions();

        if !plan.to_upload.is_empty() {
            log::debug!(
                "Not on the remote theme yet, waiting for upload: {}",
                plan.to_upload.join(", ")
            );
        }
        self.upload_retries.trigger();

        let mut report = ReconcileReport {
            kept: plan.kept,
            conflicts: plan.conflicts,
            ..ReconcileReport::default()
        };

        if !has_actions {
            log::trace!("Local theme already matches the remote snapshot");
            self.log_conflicts(&report.conflicts);
            return report;
        }

        let remote_checksums: BTreeMap<&str, &str> = snapshot
            .iter()
            .map(|entry| (entry.key.as_str(), entry.checksum.as_str()))
            .collect();

        let outcomes: Vec<DownloadOutcome> = stream::iter(plan.to_download)
            .map(|key| {
                let expected = remote_checksums.get(key.as_str()).map(|c| c.to_string());
                self.download(key, expected)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                DownloadOutcome::Downloaded(key) => report.downloaded.push(key),
                DownloadOutcome::Conflict(key) => report.conflicts.push(key),
                DownloadOutcome::Failed(key, err) => report.failed.push((key, err)),
            }
        }

        for key in plan.to_delete {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.fs.delete(&key, Origin::RemoteSync) {
                Ok(()) => {
                    log::info!("Deleted {key} (removed from the remote theme)");
                    report.deleted.push(key);
                }
                Err(ThemeFsError::PendingLocalEdit { .. }) => report.conflicts.push(key),
                Err(ThemeFsError::NotFound { .. }) => {}
                Err(err) => {
                    log::warn!("Could not delete {key}: {err}");
                    report.failed.push((key, err.to_string()));
                }
            }
        }

        report.downloaded.sort();
        report.conflicts.sort();
        report.conflicts.dedup();

        if !report.downloaded.is_empty() {
            log::info!(
                "Downloaded {} file(s) changed remotely",
                report.downloaded.len()
            );
        }
        self.log_conflicts(&report.conflicts);
        for (key, err) in &report.failed {
            log::warn!("Could not sync {key}, will retry on the next change: {err}");
        }

        report
    }

    async fn download(&self, key: Key, expected_checksum: Option<String>) -> DownloadOutcome {
        let what = format!("Downloading {key}");
        let fetched = with_retry(self.options.retry, &what, || {
            self.api.fetch_asset(self.theme_id, &key)
        })
        .await;

        let mut asset = match fetched {
            Ok(asset) => asset,
            Err(err) => return DownloadOutcome::Failed(key, err.to_string()),
        };
        if asset.checksum.is_none() {
            asset.checksum = expected_checksum;
        }
        if self.cancel.is_cancelled() {
            return DownloadOutcome::Failed(key, "shutting down".to_owned());
        }

        // A local edit may have landed while the download was in flight.
        match self.fs.apply_remote(&asset) {
            Ok(()) => {
                log::debug!("Synced {key} from the remote theme");
                DownloadOutcome::Downloaded(key)
            }
            Err(ThemeFsError::PendingLocalEdit { .. }) => DownloadOutcome::Conflict(key),
            Err(err) => DownloadOutcome::Failed(key, err.to_string()),
        }
    }

    fn log_conflicts(&self, conflicts: &[Key]) {
        if conflicts.is_empty() {
            return;
        }

        let keys: BTreeSet<&str> = conflicts.iter().map(String::as_str).collect();
        log::warn!(
            "Remote changes skipped for files with local edits pending upload: {}",
            keys.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
}
