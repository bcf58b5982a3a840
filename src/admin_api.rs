//! `ThemeApi` over the Admin REST asset endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::checksum::Checksum;
use crate::theme_api::{AdminSession, ApiError, ThemeApi, ThemeAsset, UploadResult};

pub const API_VERSION: &str = "2024-10";

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct AssetList {
    assets: Vec<ChecksumEntry>,
}

#[derive(Deserialize)]
struct ChecksumEntry {
    key: String,
    #[serde(default)]
    checksum: Option<String>,
}

#[derive(Deserialize)]
struct SingleAsset {
    asset: ThemeAsset,
}

#[derive(Serialize)]
struct BulkRequest<'a> {
    assets: &'a [ThemeAsset],
}

#[derive(Deserialize)]
struct BulkResponse {
    results: Vec<BulkResult>,
}

#[derive(Deserialize)]
struct BulkResult {
    code: u16,
    #[serde(default)]
    body: BulkResultBody,
}

#[derive(Default, Deserialize)]
struct BulkResultBody {
    #[serde(default)]
    asset: Option<ThemeAsset>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

pub struct AdminApi {
    client: reqwest::Client,
    session: AdminSession,
    base_url: Url,
}

impl AdminApi {
    pub fn new(session: AdminSession) -> Result<Self, ApiError> {
        let base = format!("https://{}/admin/api/{API_VERSION}/", session.store_fqdn);
        let base_url = Url::parse(&base).map_err(|err| ApiError::Unavailable(err.to_string()))?;
        Self::with_base_url(session, base_url)
    }

    /// Talks to `base_url` instead of the store, e.g. a local mock server.
    /// The URL must end with `/`.
    pub fn with_base_url(session: AdminSession, base_url: Url) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .gzip(true)
            .build()
            .map_err(|source| ApiError::Transport {
                url: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            session,
            base_url,
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ApiError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| ApiError::Unavailable(format!("bad request path {path}: {err}")))?;

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<(StatusCode, String), ApiError> {
        let display_url = url.path().to_owned();
        log::trace!("{method} {display_url}");

        let mut request = self
            .client
            .request(method, url)
            .header(ACCESS_TOKEN_HEADER, &self.session.token)
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            url: display_url.clone(),
            source,
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| ApiError::Transport {
            url: display_url,
            source,
        })?;

        Ok((status, text))
    }

    fn parse<T: for<'de> Deserialize<'de>>(url: &Url, text: &str) -> Result<T, ApiError> {
        serde_json::from_str(text).map_err(|err| {
            ApiError::Unavailable(format!("unexpected response from {}: {err}", url.path()))
        })
    }

    fn status_error(url: &Url, status: StatusCode, body: String) -> ApiError {
        ApiError::Status {
            url: url.path().to_owned(),
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl ThemeApi for AdminApi {
    async fn fetch_checksums(&self, theme_id: u64) -> Result<Vec<Checksum>, ApiError> {
        let url = self.url(
            &format!("themes/{theme_id}/assets.json"),
            &[("fields", "key,checksum")],
        )?;
        let (status, text) = self.send(Method::GET, url.clone(), None).await?;
        if !status.is_success() {
            return Err(Self::status_error(&url, status, text));
        }

        let list: AssetList = Self::parse(&url, &text)?;
        Ok(list
            .assets
            .into_iter()
            .map(|entry| Checksum::new(entry.key, entry.checksum.unwrap_or_default()))
            .collect())
    }

    async fn fetch_asset(&self, theme_id: u64, key: &str) -> Result<ThemeAsset, ApiError> {
        let url = self.url(
            &format!("themes/{theme_id}/assets.json"),
            &[("asset[key]", key)],
        )?;
        let (status, text) = self.send(Method::GET, url.clone(), None).await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound { key: key.to_owned() });
        }
        if !status.is_success() {
            return Err(Self::status_error(&url, status, text));
        }

        let single: SingleAsset = Self::parse(&url, &text)?;
        Ok(single.asset)
    }

    async fn bulk_upload_assets(
        &self,
        theme_id: u64,
        assets: Vec<ThemeAsset>,
    ) -> Result<Vec<UploadResult>, ApiError> {
        let url = self.url(&format!("themes/{theme_id}/assets/bulk.json"), &[])?;
        let body = serde_json::to_string(&BulkRequest { assets: &assets })
            .map_err(|err| ApiError::Unavailable(err.to_string()))?;

        let (status, text) = self.send(Method::PUT, url.clone(), Some(body)).await?;
        // 207 carries per-asset results, some of which may have failed.
        if !status.is_success() {
            return Err(Self::status_error(&url, status, text));
        }

        let response: BulkResponse = Self::parse(&url, &text)?;
        if response.results.len() != assets.len() {
            log::warn!(
                "Bulk upload returned {} results for {} assets",
                response.results.len(),
                assets.len()
            );
        }

        Ok(assets
            .iter()
            .zip(response.results)
            .map(|(sent, result)| {
                let success = (200..300).contains(&result.code);
                UploadResult {
                    key: sent.key.clone(),
                    success,
                    checksum: result.body.asset.and_then(|asset| asset.checksum),
                    errors: flatten_errors(result.body.errors),
                }
            })
            .collect())
    }

    async fn delete_asset(&self, theme_id: u64, key: &str) -> Result<(), ApiError> {
        let url = self.url(
            &format!("themes/{theme_id}/assets.json"),
            &[("asset[key]", key)],
        )?;
        let (status, text) = self.send(Method::DELETE, url.clone(), None).await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound { key: key.to_owned() });
        }
        if !status.is_success() {
            return Err(Self::status_error(&url, status, text));
        }
        Ok(())
    }
}

/// Errors come back as a string, a list, or a map of field to list.
fn flatten_errors(errors: Option<serde_json::Value>) -> Vec<String> {
    use serde_json::Value;

    fn collect(value: Value, out: &mut Vec<String>) {
        match value {
            Value::Null => {}
            Value::String(message) => out.push(message),
            Value::Array(items) => items.into_iter().for_each(|item| collect(item, out)),
            Value::Object(fields) => fields.into_iter().for_each(|(_, item)| collect(item, out)),
            other => out.push(other.to_string()),
        }
    }

    let mut out = Vec::new();
    if let Some(errors) = errors {
        collect(errors, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api(server: &MockServer) -> AdminApi {
        let base = Url::parse(&format!("{}/admin/api/{API_VERSION}/", server.uri())).unwrap();
        AdminApi::with_base_url(AdminSession::new("my-shop", "shpat_test"), base).unwrap()
    }

    #[test]
    fn errors_flatten_from_any_shape() {
        assert_eq!(
            flatten_errors(Some(json!({"asset": ["Liquid syntax error", "line 3"]}))),
            vec!["Liquid syntax error", "line 3"]
        );
        assert_eq!(flatten_errors(Some(json!("nope"))), vec!["nope"]);
        assert!(flatten_errors(None).is_empty());
    }

    #[tokio::test]
    async fn fetches_checksums_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/admin/api/{API_VERSION}/themes/7/assets.json")))
            .and(query_param("fields", "key,checksum"))
            .and(header(ACCESS_TOKEN_HEADER, "shpat_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assets": [
                    {"key": "layout/theme.liquid", "checksum": "abc"},
                    {"key": "assets/logo.png", "checksum": null},
                ]
            })))
            .mount(&server)
            .await;

        let checksums = api(&server).await.fetch_checksums(7).await.unwrap();
        assert_eq!(
            checksums,
            vec![
                Checksum::new("layout/theme.liquid", "abc"),
                Checksum::new("assets/logo.png", ""),
            ]
        );
    }

    #[tokio::test]
    async fn missing_asset_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("asset[key]", "snippets/gone.liquid"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = api(&server)
            .await
            .fetch_asset(7, "snippets/gone.liquid")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = api(&server).await.fetch_checksums(7).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bulk_upload_reports_per_asset_results() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("/admin/api/{API_VERSION}/themes/7/assets/bulk.json")))
            .and(body_json(json!({
                "assets": [
                    {"key": "sections/header.liquid", "value": "<header/>"},
                    {"key": "sections/broken.liquid", "value": "{% if %}"},
                ]
            })))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({
                "results": [
                    {"code": 200, "body": {"asset": {"key": "sections/header.liquid", "checksum": "c1"}}},
                    {"code": 422, "body": {"errors": {"asset": ["Liquid syntax error"]}}},
                ]
            })))
            .mount(&server)
            .await;

        let results = api(&server)
            .await
            .bulk_upload_assets(
                7,
                vec![
                    ThemeAsset::from_contents("sections/header.liquid", b"<header/>", None),
                    ThemeAsset::from_contents("sections/broken.liquid", b"{% if %}", None),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                UploadResult {
                    key: "sections/header.liquid".into(),
                    success: true,
                    checksum: Some("c1".into()),
                    errors: vec![],
                },
                UploadResult {
                    key: "sections/broken.liquid".into(),
                    success: false,
                    checksum: None,
                    errors: vec!["Liquid syntax error".into()],
                },
            ]
        );
    }
}
