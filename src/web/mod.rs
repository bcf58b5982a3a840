//! The local dev server: a reverse proxy in front of the storefront that
//! serves theme assets from disk and pushes changes to open tabs.

pub mod cdn;
pub mod proxy;
mod util;

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{sink::SinkExt, stream::StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_tungstenite::{is_upgrade_request, tungstenite::Message, upgrade, HyperWebsocket};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::glob::is_static_asset;
use crate::hot_reload::{HotReloadHub, CLIENT_SCRIPT, CLIENT_SCRIPT_PATH, SUBSCRIBE_PATH};
use crate::theme_fs::ThemeFileSystem;

use self::cdn::CdnRewriter;
use self::proxy::{StorefrontSession, Upstream};

const MAX_BIND_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_MS: u64 = 200;

/// How long shutdown waits for requests in flight.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DevServerError {
    #[error("invalid store domain {store}")]
    Store {
        store: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid upstream URL {0}")]
    Url(String),

    #[error("could not create the storefront HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("failed to bind to {address} after {attempts} attempt(s)")]
    Bind {
        address: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// What the proxy needs to know about the storefront it sits in front of.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub store_fqdn: String,
    pub theme_id: u64,
    /// Origin the browser uses to reach us, e.g. `http://127.0.0.1:9292`.
    pub local_origin: String,
    /// Defaults to `https://{store_fqdn}/`.
    pub storefront_url: Option<Url>,
    /// Defaults to `https://cdn.shopify.com/`.
    pub cdn_url: Option<Url>,
}

/// State every request handler reads. The local theme is consulted on every
/// request, so a stale read is possible and tolerated.
pub struct DevServerState {
    pub(crate) fs: ThemeFileSystem,
    pub(crate) hub: Arc<HotReloadHub>,
    pub(crate) rewriter: CdnRewriter,
    pub(crate) upstream: Upstream,
    pub(crate) session: StorefrontSession,
    pub(crate) local_origin: String,
}

pub struct DevServer {
    state: Arc<DevServerState>,
    active_requests: Arc<AtomicUsize>,
}

impl DevServer {
    pub fn new(
        config: ProxyConfig,
        fs: ThemeFileSystem,
        hub: Arc<HotReloadHub>,
    ) -> Result<Self, DevServerError> {
        let rewriter =
            CdnRewriter::new(&config.store_fqdn).map_err(|source| DevServerError::Store {
                store: config.store_fqdn.clone(),
                source,
            })?;

        let storefront_url = match config.storefront_url {
            Some(url) => url,
            None => parse_url(&format!("https://{}/", config.store_fqdn))?,
        };
        let cdn_url = match config.cdn_url {
            Some(url) => url,
            None => parse_url("https://cdn.shopify.com/")?,
        };
        let upstream = Upstream::new(storefront_url, cdn_url, config.theme_id)
            .map_err(DevServerError::Client)?;

        Ok(Self {
            state: Arc::new(DevServerState {
                fs,
                hub,
                rewriter,
                upstream,
                session: StorefrontSession::default(),
                local_origin: config.local_origin,
            }),
            active_requests: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn state(&self) -> &Arc<DevServerState> {
        &self.state
    }

    /// Binds `address`, retrying with backoff while the port is taken.
    pub async fn bind(address: SocketAddr) -> Result<TcpListener, DevServerError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match TcpListener::bind(address).await {
                Ok(listener) => return Ok(listener),
                Err(err)
                    if err.kind() == io::ErrorKind::AddrInUse && attempts < MAX_BIND_ATTEMPTS =>
                {
                    let delay = BASE_BACKOFF_MS * 2u64.pow(attempts - 1);
                    log::warn!(
                        "Port {} in use, retrying in {}ms (attempt {}/{})",
                        address.port(),
                        delay,
                        attempts,
                        MAX_BIND_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(source) => {
                    return Err(DevServerError::Bind {
                        address,
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    /// Accepts connections until `cancel` fires, then waits briefly for
    /// requests in flight to finish.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("Failed to accept connection: {err}");
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);
            let active_requests = Arc::clone(&self.active_requests);
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    let active_requests = Arc::clone(&active_requests);
                    let cancel = cancel.clone();

                    async move {
                        active_requests.fetch_add(1, Ordering::SeqCst);
                        let response = route(state, req, Some(remote), cancel).await;
                        active_requests.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    log::debug!("Error serving connection: {err}");
                }
            });
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active_requests.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        log::debug!("Dev server stopped");
    }
}

fn parse_url(url: &str) -> Result<Url, DevServerError> {
    Url::parse(url).map_err(|_| DevServerError::Url(url.to_owned()))
}

/// Decides what happens to one request. Order matters: hot reload routes,
/// ignored endpoints, the non-GET stub, local assets, then the storefront.
pub async fn route(
    state: Arc<DevServerState>,
    mut request: Request<Incoming>,
    remote: Option<SocketAddr>,
    cancel: CancellationToken,
) -> Response<Full<Bytes>> {
    let path = request.uri().path().to_owned();

    if path == CLIENT_SCRIPT_PATH {
        return util::with_content(
            StatusCode::OK,
            "application/javascript; charset=utf-8",
            CLIENT_SCRIPT,
        );
    }

    if path == SUBSCRIBE_PATH {
        if !is_upgrade_request(&request) {
            return util::text(
                StatusCode::BAD_REQUEST,
                format!("{SUBSCRIBE_PATH} must be called as a websocket upgrade request"),
            );
        }
        return handle_subscribe(&state, &mut request, cancel);
    }

    if proxy::is_ignored(&path) {
        return util::empty(StatusCode::NO_CONTENT);
    }

    // Forms, cart updates and the like would mutate the live store.
    if request.method() != Method::GET {
        log::debug!("Not forwarding {} {path}", request.method());
        return util::empty(StatusCode::NO_CONTENT);
    }

    if let Some(response) = serve_local_asset(&state, &path) {
        return response;
    }

    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if proxy::is_page_request(&path, accept.as_deref()) {
        proxy::render_page(&state, request, remote).await
    } else {
        proxy::passthrough(&state, request, remote).await
    }
}

/// Serves a static asset straight from the local theme, if we have it.
fn serve_local_asset(state: &DevServerState, path: &str) -> Option<Response<Full<Bytes>>> {
    let key = cdn::local_asset_key(path)?;
    if !is_static_asset(&key) || !state.fs.contains(&key) {
        return None;
    }

    match state.fs.read(&key) {
        Ok(contents) => {
            let content_type = mime_guess::from_path(&key)
                .first_or_octet_stream()
                .to_string();
            log::trace!("Serving {key} from disk");
            Some(util::with_content(
                StatusCode::OK,
                &content_type,
                contents.to_vec(),
            ))
        }
        // Deleted since we checked; let the storefront answer instead.
        Err(err) => {
            log::debug!("Could not serve {key} locally: {err}");
            None
        }
    }
}

fn handle_subscribe(
    state: &Arc<DevServerState>,
    request: &mut Request<Incoming>,
    cancel: CancellationToken,
) -> Response<Full<Bytes>> {
    let (response, websocket) = match upgrade(request, None) {
        Ok(result) => result,
        Err(err) => {
            return util::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("WebSocket upgrade failed: {err}"),
            );
        }
    };

    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        if let Err(err) = handle_websocket_subscription(hub, websocket, cancel).await {
            log::debug!("Hot reload connection ended with an error: {err}");
        }
    });

    response
}

async fn handle_websocket_subscription(
    hub: Arc<HotReloadHub>,
    websocket: HyperWebsocket,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut websocket = websocket.await?;
    let mut client = hub.connect();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = websocket.send(Message::Close(None)).await;
                break;
            }

            event = client.recv() => {
                let Some(event) = event else { break };
                let text = serde_json::to_string(&event)?;
                if websocket.send(Message::Text(text.into())).await.is_err() {
                    log::debug!("Hot reload client {} went away", client.id());
                    break;
                }
            }

            message = websocket.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("WebSocket error: {err}");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
