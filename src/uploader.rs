//! Pushes local edits to the remote theme.
//!
//! The uploader only ever sees `LocalEdit` events. Files written by the
//! reconciler carry `RemoteSync` and are filtered out at subscription time,
//! which is what keeps a download from bouncing back as an upload.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::checksum::{compute_checksum, Key};
use crate::glob::is_static_asset;
use crate::hot_reload::HotReloadHub;
use crate::theme_api::{with_retry, ApiError, RetryPolicy, ThemeApi, ThemeAsset};
use crate::theme_fs::{Origin, ThemeFileSystem, ThemeFsError, ThemeFsEvent, ThemeFsEventKind};

/// Assets per bulk upload request.
pub const UPLOAD_BATCH_SIZE: usize = 10;

/// Summary of one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<Key>,
    pub deleted: Vec<Key>,
    /// Local deletions left on the remote theme because deleting is off.
    pub kept: Vec<Key>,
    /// JSON files that failed to parse and were held back.
    pub invalid: Vec<Key>,
    pub failed: Vec<(Key, String)>,
}

impl UploadReport {
    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty()
            && self.deleted.is_empty()
            && self.kept.is_empty()
            && self.invalid.is_empty()
            && self.failed.is_empty()
    }
}

/// Keys whose upload or remote deletion ran out of attempts. They stay
/// unsynced, so remote changes to them are held back, until the uploader
/// gets through on the next poll, reconciliation pass or local edit.
///
/// Uploads the platform rejected are not parked: sending the same content
/// again would fail the same way, so those wait for the next local edit.
#[derive(Clone, Default)]
pub struct UploadRetries {
    keys: Arc<Mutex<BTreeSet<Key>>>,
    wake: Arc<Notify>,
}

impl UploadRetries {
    fn lock(&self) -> MutexGuard<'_, BTreeSet<Key>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn park(&self, key: Key) {
        self.lock().insert(key);
    }

    fn forget(&self, key: &str) {
        self.lock().remove(key);
    }

    fn take(&self) -> Vec<Key> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    pub fn keys(&self) -> BTreeSet<Key> {
        self.lock().clone()
    }

    /// Wakes the uploader when anything is parked.
    pub fn trigger(&self) {
        let parked = !self.lock().is_empty();
        if parked {
            self.wake.notify_one();
        }
    }
}

/// A file read from disk and ready to send, with the fingerprint of exactly
/// the bytes that were read.
struct PendingUpload {
    asset: ThemeAsset,
    fingerprint: String,
    event: ThemeFsEvent,
}

pub struct Uploader {
    fs: ThemeFileSystem,
    api: Arc<dyn ThemeApi>,
    theme_id: u64,
    hub: Arc<HotReloadHub>,
    retry: RetryPolicy,
    no_delete: bool,
    retries: UploadRetries,
}

impl Uploader {
    pub fn new(
        fs: ThemeFileSystem,
        api: Arc<dyn ThemeApi>,
        theme_id: u64,
        hub: Arc<HotReloadHub>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fs,
            api,
            theme_id,
            hub,
            retry,
            no_delete: false,
            retries: UploadRetries::default(),
        }
    }

    /// Handle to the keys waiting for another attempt.
    pub fn retries(&self) -> UploadRetries {
        self.retries.clone()
    }

    /// Leaves remote files in place when they are deleted locally.
    pub fn with_no_delete(mut self, no_delete: bool) -> Self {
        self.no_delete = no_delete;
        self
    }

    /// Registers a listener forwarding local edits. Must be called before
    /// the file system starts reporting changes that should be uploaded.
    pub fn subscribe(fs: &ThemeFileSystem) -> mpsc::UnboundedReceiver<ThemeFsEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        fs.on_change(move |event| {
            if event.origin == Origin::LocalEdit {
                let _ = sender.send(event.clone());
            }
        });
        receiver
    }

    /// Processes local edits until `cancel` fires. Events that arrive while a
    /// batch is in flight are gathered into the next batch, together with
    /// any keys parked after earlier failures.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ThemeFsEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                _ = self.retries.wake.notified() => None,
            };

            // Parked keys go first so a fresher event for the same key wins.
            let mut batch = self.parked_events();
            batch.extend(first);
            while let Ok(event) = events.try_recv() {
                batch.push(event);
            }
            if batch.is_empty() {
                continue;
            }

            let report = self.process_batch(batch).await;
            if !report.is_empty() {
                log::trace!("Upload batch finished: {report:?}");
            }
        }

        log::debug!("Uploader stopped");
    }

    /// Turns parked keys back into events describing the file as it is now.
    fn parked_events(&self) -> Vec<ThemeFsEvent> {
        let keys = self.retries.take();
        if !keys.is_empty() {
            log::debug!("Retrying {} earlier upload(s)", keys.len());
        }

        keys.into_iter()
            .map(|key| ThemeFsEvent {
                kind: if self.fs.contains(&key) {
                    ThemeFsEventKind::Change
                } else {
                    ThemeFsEventKind::Unlink
                },
                key,
                origin: Origin::LocalEdit,
                checksum: None,
            })
            .collect()
    }

    pub async fn process_batch(&self, events: Vec<ThemeFsEvent>) -> UploadReport {
        let mut report = UploadReport::default();

        // Only the latest event per key matters; earlier ones are stale.
        let mut latest: BTreeMap<Key, ThemeFsEvent> = BTreeMap::new();
        for event in events {
            if event.origin != Origin::LocalEdit {
                continue;
            }
            latest.insert(event.key.clone(), event);
        }

        let mut uploads = Vec::new();
        for (key, event) in latest {
            self.retries.forget(&key);

            if event.kind == ThemeFsEventKind::Unlink && !self.fs.contains(&key) {
                if self.no_delete {
                    log::info!("Keeping {key} on the remote theme");
                    self.fs.mark_deleted_remotely(&key);
                    report.kept.push(key);
                } else {
                    self.delete_remote(key, &mut report).await;
                }
                continue;
            }

            match self.prepare(&key) {
                Ok(Some(contents)) => {
                    if let Err(messages) = validate(&key, &contents) {
                        log::warn!("Not uploading {key}: {}", messages.join("; "));
                        self.hub.record_error(&key, messages);
                        report.invalid.push(key);
                        continue;
                    }

                    uploads.push(PendingUpload {
                        fingerprint: compute_checksum(&contents),
                        asset: ThemeAsset::from_contents(key, &contents, None),
                        event,
                    });
                }
                // Deleted again before we got to it; the unlink follows.
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Could not read {key} for upload: {err}");
                    self.retries.park(key.clone());
                    report.failed.push((key, err.to_string()));
                }
            }
        }

        let mut remaining = uploads.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<PendingUpload> = remaining.by_ref().take(UPLOAD_BATCH_SIZE).collect();
            self.upload_chunk(chunk, &mut report).await;
        }

        report
    }

    fn prepare(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, ThemeFsError> {
        match self.fs.read(key) {
            Ok(contents) => Ok(Some(contents)),
            Err(ThemeFsError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upload_chunk(&self, chunk: Vec<PendingUpload>, report: &mut UploadReport) {
        let assets: Vec<ThemeAsset> = chunk.iter().map(|pending| pending.asset.clone()).collect();
        let keys: Vec<&str> = chunk.iter().map(|pending| pending.asset.key.as_str()).collect();

        let what = format!("Uploading {}", keys.join(", "));
        let results = with_retry(self.retry, &what, || {
            self.api.bulk_upload_assets(self.theme_id, assets.clone())
        })
        .await;

        let results = match results {
            Ok(results) => results,
            Err(err) => {
                log::warn!("{what} failed, will retry on the next poll: {err}");
                for pending in chunk {
                    self.retries.park(pending.asset.key.clone());
                    report.failed.push((pending.asset.key, err.to_string()));
                }
                return;
            }
        };

        let mut by_key: BTreeMap<Key, _> = results
            .into_iter()
            .map(|result| (result.key.clone(), result))
            .collect();

        for pending in chunk {
            let key = pending.asset.key;
            let Some(result) = by_key.remove(&key) else {
                self.retries.park(key.clone());
                report
                    .failed
                    .push((key, "missing from upload response".to_owned()));
                continue;
            };

            if !result.success {
                log::warn!("Could not upload {key}: {}", result.errors.join("; "));
                self.hub.record_error(&key, result.errors.clone());
                report.failed.push((key, result.errors.join("; ")));
                continue;
            }

            self.fs
                .mark_uploaded(&key, &pending.fingerprint, result.checksum);
            self.hub.clear_error(&key);
            // Static assets were pushed as soon as they changed on disk.
            if !is_static_asset(&key) {
                self.hub.notify_change(&pending.event);
            }

            log::info!("Uploaded {key}");
            report.uploaded.push(key);
        }
    }

    async fn delete_remote(&self, key: Key, report: &mut UploadReport) {
        let what = format!("Deleting {key}");
        let result = with_retry(self.retry, &what, || {
            self.api.delete_asset(self.theme_id, &key)
        })
        .await;

        match result {
            Ok(()) | Err(ApiError::NotFound { .. }) => {
                self.fs.mark_deleted_remotely(&key);
                self.hub.clear_error(&key);
                if !is_static_asset(&key) {
                    self.hub.notify_change(&ThemeFsEvent {
                        kind: ThemeFsEventKind::Unlink,
                        key: key.clone(),
                        origin: Origin::LocalEdit,
                        checksum: None,
                    });
                }

                log::info!("Deleted {key} from the remote theme");
                report.deleted.push(key);
            }
            Err(err) => {
                log::warn!("{what} failed, will retry on the next poll: {err}");
                self.retries.park(key.clone());
                report.failed.push((key, err.to_string()));
            }
        }
    }
}

/// JSON theme files must parse before they are worth sending. The platform
/// accepts comments and trailing commas, so this checks with json5.
fn validate(key: &str, contents: &[u8]) -> Result<(), Vec<String>> {
    if !key.ends_with(".json") {
        return Ok(());
    }

    let text = std::str::from_utf8(contents).map_err(|err| vec![err.to_string()])?;
    json5::from_str::<serde_json::Value>(text)
        .map(|_| ())
        .map_err(|err| vec![err.to_string()])
}
