//! The remote side of a theme, as the sync engine sees it.
//!
//! `ThemeApi` is the only way the engine talks to the platform. The Admin REST
//! implementation lives in `admin_api`; tests plug in an in-memory fake.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::{Checksum, Key};

/// Credential for a store, acquired elsewhere and treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    pub store_fqdn: String,
    pub token: String,
}

impl AdminSession {
    pub fn new(store: &str, token: impl Into<String>) -> Self {
        Self {
            store_fqdn: normalize_store_fqdn(store),
            token: token.into(),
        }
    }
}

/// Accepts `my-shop`, `my-shop.myshopify.com` or a full URL and returns the
/// bare host name.
pub fn normalize_store_fqdn(store: &str) -> String {
    let store = store.trim();
    let store = store
        .strip_prefix("https://")
        .or_else(|| store.strip_prefix("http://"))
        .unwrap_or(store);
    let store = store.split('/').next().unwrap_or(store);

    if store.contains('.') {
        store.to_owned()
    } else {
        format!("{store}.myshopify.com")
    }
}

/// A theme file as the platform serializes it. Text files carry `value`,
/// binary files carry base64 in `attachment`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeAsset {
    pub key: Key,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

impl ThemeAsset {
    /// Builds an asset from raw file contents, choosing between `value` and
    /// `attachment` the same way the platform does.
    pub fn from_contents(key: impl Into<Key>, contents: &[u8], checksum: Option<String>) -> Self {
        let key = key.into();

        if is_text_key(&key) {
            if let Ok(text) = std::str::from_utf8(contents) {
                return Self {
                    key,
                    checksum,
                    value: Some(text.to_owned()),
                    attachment: None,
                };
            }
        }

        Self {
            key,
            checksum,
            value: None,
            attachment: Some(BASE64.encode(contents)),
        }
    }

    /// The raw bytes this asset should have on disk.
    pub fn content_bytes(&self) -> Result<Vec<u8>, ApiError> {
        match (&self.attachment, &self.value) {
            (Some(attachment), _) if !attachment.is_empty() => BASE64
                .decode(attachment.as_bytes())
                .map_err(|err| ApiError::InvalidAsset {
                    key: self.key.clone(),
                    reason: err.to_string(),
                }),
            (_, Some(value)) => Ok(value.clone().into_bytes()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Text files are exchanged as `value`; everything else as `attachment`.
pub fn is_text_key(key: &str) -> bool {
    const TEXT_EXTENSIONS: &[&str] = &["liquid", "json", "js", "css", "scss", "sass", "svg", "txt"];

    key.rsplit_once('.')
        .map(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Outcome of one asset in a bulk upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: Key,
    pub success: bool,
    /// Checksum the platform assigned, when it reported one.
    pub checksum: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("asset {key} does not exist on the theme")]
    NotFound { key: Key },

    #[error("asset {key} could not be decoded: {reason}")]
    InvalidAsset { key: Key, reason: String },

    #[error("theme service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport { .. } | ApiError::Unavailable(_) => true,
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::NotFound { .. } | ApiError::InvalidAsset { .. } => false,
        }
    }
}

/// The remote operations the sync engine relies on.
#[async_trait]
pub trait ThemeApi: Send + Sync {
    async fn fetch_checksums(&self, theme_id: u64) -> Result<Vec<Checksum>, ApiError>;

    async fn fetch_asset(&self, theme_id: u64, key: &str) -> Result<ThemeAsset, ApiError>;

    async fn bulk_upload_assets(
        &self,
        theme_id: u64,
        assets: Vec<ThemeAsset>,
    ) -> Result<Vec<UploadResult>, ApiError>;

    async fn delete_asset(&self, theme_id: u64, key: &str) -> Result<(), ApiError>;
}

/// Bounded retry with exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Runs `operation` until it succeeds, fails permanently, or runs out of
/// attempts. The last error is returned.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempts < policy.max_attempts => {
                let delay = policy.delay_for(attempts);
                log::debug!(
                    "{what} failed ({err}), retrying in {}ms (attempt {attempts}/{})",
                    delay.as_millis(),
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
