use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use memofs::Vfs;

use crate::{
    admin_api::AdminApi,
    config::{CliOverrides, DevOptions},
    dev_session::DevSession,
    hot_reload::LiveReload,
    theme_api::AdminSession,
    web::DevServer,
};

use super::resolve_project_dir;

/// Sync a local theme with a development theme on the store and preview it
/// through a local proxy with hot reload.
#[derive(Debug, Parser)]
pub struct DevCommand {
    /// Path to the theme directory. Defaults to the current directory.
    #[clap(long, default_value = "")]
    pub path: PathBuf,

    /// Store to sync with, e.g. `my-shop` or `my-shop.myshopify.com`.
    #[clap(long, short)]
    pub store: Option<String>,

    /// ID of the theme to sync with.
    #[clap(long, short)]
    pub theme: Option<u64>,

    /// Admin API access token for the store.
    #[clap(long, env = "THEMESYNC_TOKEN", hide_env_values = true)]
    pub password: Option<String>,

    /// The IP address to listen on. Defaults to `127.0.0.1`.
    #[clap(long)]
    pub host: Option<String>,

    /// The port to listen on. Defaults to `9292`.
    #[clap(long)]
    pub port: Option<u16>,

    /// How often to check the remote theme for changes, e.g. `3s`.
    #[clap(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// How open pages react to changes: hot-reload, full-page or off.
    #[clap(long)]
    pub live_reload: Option<LiveReload>,

    /// Never delete files on either side.
    #[clap(long)]
    pub nodelete: bool,

    /// Skip files matching this pattern. Can be given multiple times.
    #[clap(long, short = 'x')]
    pub ignore: Vec<String>,

    /// Only sync files matching this pattern. Can be given multiple times.
    #[clap(long, short)]
    pub only: Vec<String>,

    /// Open the preview in the default browser once the server is up.
    #[clap(long)]
    pub open: bool,
}

impl DevCommand {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            store: self.store.clone(),
            theme: self.theme,
            password: self.password.clone(),
            host: self.host.clone(),
            port: self.port,
            poll_interval: self.poll_interval,
            live_reload: self.live_reload,
            nodelete: self.nodelete,
            ignore: self.ignore.clone(),
            only: self.only.clone(),
            open: self.open,
        }
    }

    pub fn run(self) -> anyhow::Result<()> {
        let theme_root = resolve_project_dir(&self.path);
        let options = DevOptions::load(&theme_root, self.overrides())
            .with_context(|| format!("Could not load settings for {}", theme_root.display()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Could not start the async runtime")?;

        runtime.block_on(run_session(options))
    }
}

async fn run_session(options: DevOptions) -> anyhow::Result<()> {
    let api = AdminApi::new(AdminSession::new(&options.store, options.password.clone()))
        .context("Could not create the Admin API client")?;

    let (vfs, critical_errors) = Vfs::new_default_with_errors(options.debounce);

    log::info!(
        "Syncing {} with theme {} on {}",
        options.theme_root.display(),
        options.theme_id,
        options.store
    );

    let session = DevSession::start(
        options.clone(),
        Arc::new(api),
        Arc::new(vfs),
        Some(critical_errors),
    )
    .await?;

    let kept = &session.initial_report().kept;
    if !kept.is_empty() {
        log::info!("Keeping {} file(s) missing from the remote theme", kept.len());
    }

    let address = SocketAddr::new(options.host, options.port);
    let listener = DevServer::bind(address).await?;
    let preview = options.local_origin();

    log::info!("Preview: {preview}");
    log::info!("Press Ctrl+C to stop");

    if options.open {
        if let Err(err) = opener::open_browser(&preview) {
            log::warn!("Could not open a browser: {err}");
        }
    }

    let cancel = session.cancellation_token();
    let served = {
        let serving = session.serve_on(listener);
        tokio::pin!(serving);

        tokio::select! {
            result = &mut serving => result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    log::warn!("Could not listen for Ctrl+C: {err}");
                }
                log::info!("Shutting down...");
                cancel.cancel();
                serving.await
            }
        }
    };

    session.shutdown().await;
    served.context("The dev server failed")
}
