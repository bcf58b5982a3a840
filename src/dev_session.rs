//! Owns every moving part of `themesync dev`.
//!
//! A `DevSession` is built once per invocation: it indexes the local theme,
//! learns the remote state, runs the initial reconciliation and then keeps
//! the poller and uploader running in the background until it is shut down.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use memofs::{Vfs, WatcherCriticalError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checksum::Checksum;
use crate::config::DevOptions;
use crate::glob::FilterError;
use crate::hot_reload::HotReloadHub;
use crate::poller::{RemoteChecksumPoller, SnapshotView};
use crate::reconciler::{ReconcileOptions, ReconcileReport, Reconciler};
use crate::theme_api::{with_retry, ApiError, RetryPolicy, ThemeApi};
use crate::theme_fs::{ThemeFileSystem, ThemeFsError};
use crate::uploader::{UploadRetries, Uploader};
use crate::web::{DevServer, DevServerError, ProxyConfig};

#[derive(Debug, Error)]
pub enum DevSessionError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("could not index the local theme")]
    LocalTheme(#[from] ThemeFsError),

    #[error("could not fetch the remote theme")]
    RemoteTheme(#[source] ApiError),

    #[error(transparent)]
    Server(#[from] DevServerError),
}

pub struct DevSession {
    options: DevOptions,
    fs: ThemeFileSystem,
    hub: Arc<HotReloadHub>,
    reconciler: Arc<Reconciler>,
    remote_snapshot: SnapshotView,
    initial_report: ReconcileReport,
    upload_retries: UploadRetries,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DevSession {
    /// Brings the local theme in line with the remote one and starts the
    /// background work. Fails if either side cannot be read at all.
    pub async fn start(
        options: DevOptions,
        api: Arc<dyn ThemeApi>,
        vfs: Arc<Vfs>,
        critical_errors: Option<Receiver<WatcherCriticalError>>,
    ) -> Result<Self, DevSessionError> {
        if let Some(errors) = critical_errors {
            watch_critical_errors(errors);
        }

        let filter = Arc::new(options.file_filter()?);
        let fs = ThemeFileSystem::new(
            options.theme_root.clone(),
            vfs,
            filter,
            options.debounce,
        );

        let hub = Arc::new(HotReloadHub::new(options.live_reload));
        {
            let hub = Arc::clone(&hub);
            fs.on_change(move |event| hub.on_theme_change(event));
        }
        let upload_events = Uploader::subscribe(&fs);

        log::debug!("Indexing {}", options.theme_root.display());
        fs.ready().await?;

        let retry = RetryPolicy::default();
        let checksums: Vec<Checksum> = with_retry(retry, "Fetching remote checksums", || {
            api.fetch_checksums(options.theme_id)
        })
        .await
        .map_err(DevSessionError::RemoteTheme)?;
        log::debug!("Remote theme has {} files", checksums.len());

        let cancel = CancellationToken::new();
        let uploader = Uploader::new(
            fs.clone(),
            Arc::clone(&api),
            options.theme_id,
            Arc::clone(&hub),
            retry,
        )
        .with_no_delete(options.no_delete);
        let upload_retries = uploader.retries();

        let reconciler = Arc::new(
            Reconciler::new(
                fs.clone(),
                Arc::clone(&api),
                options.theme_id,
                ReconcileOptions {
                    no_delete: options.no_delete,
                    retry,
                    ..ReconcileOptions::default()
                },
            )
            .with_upload_retries(upload_retries.clone())
            .with_cancellation(cancel.clone()),
        );

        let initial_report = reconciler
            .submit(Arc::new(checksums.clone()))
            .await
            .unwrap_or_default();
        log::info!(
            "Initial sync: {} downloaded, {} deleted, {} kept",
            initial_report.downloaded.len(),
            initial_report.deleted.len(),
            initial_report.kept.len()
        );

        let poller = RemoteChecksumPoller::new(api, options.theme_id, options.poll_interval)
            .with_initial_snapshot(checksums);
        let remote_snapshot = poller.snapshot();

        let tasks = vec![
            tokio::spawn(poller.run(Arc::clone(&reconciler), cancel.clone())),
            tokio::spawn(uploader.run(upload_events, cancel.clone())),
        ];

        Ok(Self {
            options,
            fs,
            hub,
            reconciler,
            remote_snapshot,
            initial_report,
            upload_retries,
            cancel,
            tasks,
        })
    }

    pub fn options(&self) -> &DevOptions {
        &self.options
    }

    pub fn fs(&self) -> &ThemeFileSystem {
        &self.fs
    }

    pub fn hub(&self) -> &Arc<HotReloadHub> {
        &self.hub
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The latest remote checksums the poller has seen.
    pub fn remote_snapshot(&self) -> Option<Arc<Vec<Checksum>>> {
        self.remote_snapshot.get()
    }

    pub fn initial_report(&self) -> &ReconcileReport {
        &self.initial_report
    }

    /// Keys whose upload ran out of attempts and waits for another try.
    pub fn pending_retries(&self) -> &UploadRetries {
        &self.upload_retries
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            store_fqdn: crate::theme_api::normalize_store_fqdn(&self.options.store),
            theme_id: self.options.theme_id,
            local_origin: self.options.local_origin(),
            storefront_url: None,
            cdn_url: None,
        }
    }

    /// Builds the dev server for this session. The server stops when the
    /// session is shut down.
    pub fn dev_server(&self, config: ProxyConfig) -> Result<DevServer, DevServerError> {
        DevServer::new(config, self.fs.clone(), Arc::clone(&self.hub))
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn serve(&self) -> Result<(), DevSessionError> {
        let address = SocketAddr::new(self.options.host, self.options.port);
        let listener = DevServer::bind(address).await?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), DevSessionError> {
        let server = self.dev_server(self.proxy_config())?;
        server.serve(listener, self.cancel.clone()).await;
        Ok(())
    }

    /// Stops polling, uploading, reconciling and serving, then the file
    /// watcher. Pending change notifications are delivered first.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                log::debug!("Background task ended abnormally: {err}");
            }
        }
        self.reconciler.shutdown().await;
        self.fs.shutdown();
        log::debug!("Dev session shut down");
    }
}

impl Drop for DevSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Logs watcher failures. The receiver outlives the session only as long as
/// the backend does, so the thread ends on its own.
fn watch_critical_errors(errors: Receiver<WatcherCriticalError>) {
    let spawned = std::thread::Builder::new()
        .name("watcher errors".to_owned())
        .spawn(move || {
            for error in errors {
                match error {
                    WatcherCriticalError::RescanRequired => log::warn!(
                        "The file watcher lost track of changes. Restart themesync if local edits stop syncing."
                    ),
                    error => log::error!("{error}"),
                }
            }
        });

    if let Err(err) = spawned {
        log::warn!("Could not start watcher error reporting: {err}");
    }
}
