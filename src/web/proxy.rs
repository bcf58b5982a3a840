//! Forwarding to the live storefront and patching what comes back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Request, Response, StatusCode,
};
use regex::Regex;
use url::Url;

use super::cdn::{EXTENSION_CDN_PREFIX, SESSION_COOKIE_NAME, VANITY_CDN_PREFIX};
use super::util;
use super::DevServerState;
use crate::hot_reload::client_script_tag;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Paths the storefront scripts ping that are useless in development.
pub const IGNORED_ENDPOINTS: &[&str] = &[
    "/.well-known",
    "/shopify/monorail",
    "/mini-profiler-resources",
    "/web-pixels-manager",
    "/web-pixels@",
    "/wpm",
    "/services/",
    "/api/collect",
    "/cdn-cgi/challenge-platform",
];

/// Only meaningful for a single connection; never forwarded either way.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "expect",
    "content-security-policy",
    "host",
];

pub fn is_ignored(path: &str) -> bool {
    IGNORED_ENDPOINTS
        .iter()
        .any(|endpoint| path.starts_with(endpoint))
}

fn path_patterns() -> &'static [Regex] {
    use std::sync::OnceLock;

    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^/cart/",
            r"^/checkouts/",
            r"^/account(/login/multipass(/[^/]+)?|/logout)?/?$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Whether a GET should be rendered as a storefront page (rewritten and
/// injected) rather than passed through.
pub fn is_page_request(path: &str, accept: Option<&str>) -> bool {
    if path.starts_with(VANITY_CDN_PREFIX) || path.starts_with(EXTENSION_CDN_PREFIX) {
        return false;
    }
    if path_patterns().iter().any(|pattern| pattern.is_match(path)) {
        return false;
    }

    let pathname = path.split('?').next().unwrap_or(path);
    let file = pathname.rsplit('/').next().unwrap_or("");
    let extension = file.rsplit_once('.').map(|(_, ext)| ext);
    let accept = accept.unwrap_or("*/*");

    if extension == Some("html") || accept.contains("text/html") {
        return true;
    }

    extension.is_none() && accept == "*/*"
}

/// Cookies the storefront hands out that keep the preview session alive.
#[derive(Debug, Default)]
pub struct StorefrontSession {
    cookies: Mutex<BTreeMap<String, String>>,
}

impl StorefrontSession {
    pub fn set(&self, name: &str, value: String) {
        self.cookies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned(), value);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.cookies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// The browser's cookies with ours layered on top.
    fn cookie_header(&self, browser: Option<&str>) -> String {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for pair in browser.unwrap_or("").split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                merged.insert(name.to_owned(), value.to_owned());
            }
        }

        let ours = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
        for (name, value) in ours.iter() {
            merged.insert(name.clone(), value.clone());
        }

        merged
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Where forwarded requests go.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    store_base: Url,
    cdn_base: Url,
    theme_id: u64,
}

impl Upstream {
    pub fn new(store_base: Url, cdn_base: Url, theme_id: u64) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(UPSTREAM_TIMEOUT)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;

        Ok(Self {
            client,
            store_base,
            cdn_base,
            theme_id,
        })
    }

    /// Maps a dev server path onto the storefront or the CDN.
    pub fn url_for(&self, path_and_query: &str) -> Option<Url> {
        let (base, path, on_store) = match path_and_query.strip_prefix(EXTENSION_CDN_PREFIX) {
            Some(rest) => (&self.cdn_base, format!("/{rest}"), false),
            None => (&self.store_base, path_and_query.to_owned(), true),
        };

        let mut url = base.join(&path).ok()?;

        // Stale numeric cache busters on rendered .css/.js assets confuse
        // the storefront; replace them with a fresh one.
        let is_rendered_asset = url.path().contains("/assets/")
            && (url.path().ends_with(".css") || url.path().ends_with(".js"));
        let numeric_query = url
            .query()
            .is_some_and(|query| !query.is_empty() && query.bytes().all(|b| b.is_ascii_digit()));
        if is_rendered_asset && numeric_query {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis())
                .unwrap_or_default();
            url.set_query(Some(&format!("v={millis}")));
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("_fd", "0").append_pair("pb", "0");
            if on_store {
                query.append_pair("preview_theme_id", &self.theme_id.to_string());
            }
        }

        Some(url)
    }
}

/// The result of a forwarded request, fully buffered.
pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn forward_headers(
    state: &DevServerState,
    request: &Request<hyper::body::Incoming>,
    url: &Url,
    remote: Option<SocketAddr>,
) -> HeaderMap {
    let mut headers = request.headers().clone();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    // Safari asks for an HTTPS upgrade that makes no sense on localhost.
    headers.remove("upgrade-insecure-requests");
    // The client negotiates compression itself and decompresses for us.
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(remote) = remote {
        if let Ok(value) = HeaderValue::from_str(&remote.ip().to_string()) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }

    let origin = url.origin().ascii_serialization();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(header::REFERER, value);
    }

    let browser_cookies = request
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok());
    let cookies = state.session.cookie_header(browser_cookies);
    headers.remove(header::COOKIE);
    if !cookies.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&cookies) {
            headers.insert(header::COOKIE, value);
        }
    }

    headers
}

/// Sends a GET for `request` upstream.
pub async fn fetch(
    state: &DevServerState,
    request: &Request<hyper::body::Incoming>,
    remote: Option<SocketAddr>,
) -> Result<Fetched, String> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let url = state
        .upstream
        .url_for(path_and_query)
        .ok_or_else(|| format!("cannot proxy {path_and_query}"))?;
    let headers = forward_headers(state, request, &url, remote);

    log::trace!("Proxying {path_and_query} to {}", url.host_str().unwrap_or(""));

    let response = state
        .upstream
        .client
        .get(url.clone())
        .headers(headers)
        .send()
        .await
        .map_err(|err| format!("Failed to proxy request to {}: {err}", url.path()))?;

    let status = response.status();
    let mut headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|err| format!("Failed to read response for {}: {err}", url.path()))?;

    patch_response_headers(state, &mut headers);

    Ok(Fetched {
        status,
        headers,
        body,
    })
}

/// Makes upstream headers valid for the local origin.
fn patch_response_headers(state: &DevServerState, headers: &mut HeaderMap) {
    // The body has already been decompressed.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }

    if let Some(link) = headers.get(header::LINK).and_then(|v| v.to_str().ok()) {
        let rewritten = state.rewriter.rewrite(link, |asset| state.fs.contains(asset));
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            headers.insert(header::LINK, value);
        }
    }

    if let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) {
        if let Some(relative) = relative_location(location) {
            if let Ok(value) = HeaderValue::from_str(&relative) {
                headers.insert(header::LOCATION, value);
            }
        }
    }

    let cookies: Vec<String> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_owned)
        .collect();
    if !cookies.is_empty() {
        headers.remove(header::SET_COOKIE);
        for cookie in cookies {
            if let Some(session) = state.rewriter.session_cookie(&cookie) {
                state.session.set(SESSION_COOKIE_NAME, session);
            }
            let patched = state.rewriter.strip_cookie_domain(&cookie);
            if let Ok(value) = HeaderValue::from_str(&patched) {
                headers.append(header::SET_COOKIE, value);
            }
        }
    }
}

/// Turns an absolute redirect into a path on the dev server, minus our own
/// query parameters. Checkout redirects stay absolute.
fn relative_location(location: &str) -> Option<String> {
    let base = Url::parse("https://storefront.invalid/").ok()?;
    let url = base.join(location).ok()?;

    if url.path().starts_with("/checkouts/") && !url.path().starts_with("/checkouts/internal/") {
        return None;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != "_fd" && name != "pb")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut relative = url.path().to_owned();
    if !kept.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        relative.push('?');
        relative.push_str(&query);
    }
    if let Some(fragment) = url.fragment() {
        relative.push('#');
        relative.push_str(fragment);
    }

    Some(relative)
}

fn into_response(fetched: Fetched, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = fetched.status;
    *response.headers_mut() = fetched.headers;
    response
}

fn bad_gateway(message: String) -> Response<Full<Bytes>> {
    log::warn!("{message}");
    util::text(StatusCode::BAD_GATEWAY, message)
}

/// Places the hot reload script and, when there are outstanding errors, the
/// error overlay into a page.
pub fn inject_into_page(html: &str, overlay: Option<&str>) -> String {
    let mut html = html.to_owned();

    let script = client_script_tag();
    match html.find("</head>") {
        Some(index) => html.insert_str(index, &script),
        None => html.insert_str(0, &script),
    }

    if let Some(overlay) = overlay {
        match html.rfind("</body>") {
            Some(index) => html.insert_str(index, overlay),
            None => html.push_str(overlay),
        }
    }

    html
}

/// Renders a storefront page with local assets and hot reload wired in.
pub async fn render_page(
    state: &DevServerState,
    request: Request<hyper::body::Incoming>,
    remote: Option<SocketAddr>,
) -> Response<Full<Bytes>> {
    let path = request.uri().path().to_owned();
    let fetched = match fetch(state, &request, remote).await {
        Ok(fetched) => fetched,
        Err(message) => return bad_gateway(message),
    };

    if fetched.status.is_redirection() {
        return into_response(fetched, Bytes::new());
    }
    // Error pages reach the browser exactly as the storefront sent them.
    if !fetched.status.is_success() {
        log::warn!("Storefront responded with {} for {path}", fetched.status);
        let body = fetched.body.clone();
        return into_response(fetched, body);
    }

    let is_json = fetched
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("application/json"));

    let html = String::from_utf8_lossy(&fetched.body);
    let html = state
        .rewriter
        .rewrite(&html, |asset| state.fs.contains(asset));
    let html = state.rewriter.patch_base_urls(&html, &state.local_origin);

    let body = if is_json {
        html
    } else {
        let overlay = state.hub.render_overlay();
        inject_into_page(&html, overlay.as_deref())
    };

    let mut response = into_response(fetched, Bytes::from(body));
    if !is_json {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
    }
    response
}

/// Forwards any other GET. Assets rendered from a local `.liquid` source get
/// their CDN URLs rewritten too.
pub async fn passthrough(
    state: &DevServerState,
    request: Request<hyper::body::Incoming>,
    remote: Option<SocketAddr>,
) -> Response<Full<Bytes>> {
    let path = request.uri().path().to_owned();
    let fetched = match fetch(state, &request, remote).await {
        Ok(fetched) => fetched,
        Err(message) => return bad_gateway(message),
    };

    if fetched.status.is_server_error() && !path.ends_with(".js.map") {
        log::warn!("Storefront responded with {} for {path}", fetched.status);
    }

    let file_name = path.rsplit('/').next().unwrap_or("");
    let liquid_source = format!("assets/{file_name}.liquid");
    if fetched.status.is_success() && state.fs.contains(&liquid_source) {
        let text = String::from_utf8_lossy(&fetched.body);
        let rewritten = state
            .rewriter
            .rewrite(&text, |asset| state.fs.contains(asset));
        return into_response(fetched, Bytes::from(rewritten));
    }

    let body = fetched.body.clone();
    into_response(fetched, body)
}
