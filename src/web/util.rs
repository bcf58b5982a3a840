use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE},
    Response, StatusCode,
};

pub fn empty(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}

pub fn text(code: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    with_content(code, "text/plain; charset=utf-8", Bytes::from(body.into()))
}

/// A response for content served from the local theme. Never cached, so
/// that edits show up on the next load.
pub fn with_content(
    code: StatusCode,
    content_type: &str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = code;

    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    response
}
