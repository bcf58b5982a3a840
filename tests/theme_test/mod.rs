//! Shared harness for the integration tests: an in-memory remote theme and
//! a `DevSession` running against an in-memory local theme.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use memofs::{InMemoryFs, Vfs, VfsBackend};

use libthemesync::checksum::{compute_checksum, Checksum, Key};
use libthemesync::config::{CliOverrides, ConfigFile, DevOptions};
use libthemesync::theme_api::{ApiError, ThemeApi, ThemeAsset, UploadResult};
use libthemesync::DevSession;

pub const ROOT: &str = "/theme";
pub const THEME_ID: u64 = 42;

/// A remote call, recorded in the order the fake saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FetchChecksums,
    FetchAsset(Key),
    Upload(Vec<Key>),
    Delete(Key),
}

#[derive(Default)]
struct RemoteState {
    assets: BTreeMap<Key, Vec<u8>>,
    failing_checksum_fetches: u32,
    failing_uploads: u32,
    rejected: BTreeSet<Key>,
    calls: Vec<Call>,
}

/// The platform side of a theme, held in memory.
#[derive(Default)]
pub struct FakeThemeApi {
    state: Mutex<RemoteState>,
}

impl FakeThemeApi {
    pub fn new(files: &[(&str, &str)]) -> Arc<Self> {
        let api = Self::default();
        for (key, contents) in files {
            api.set(key, contents);
        }
        Arc::new(api)
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    /// Simulates an edit made in the online editor.
    pub fn set(&self, key: &str, contents: &str) {
        self.lock()
            .assets
            .insert(key.to_owned(), contents.as_bytes().to_vec());
    }

    pub fn remove(&self, key: &str) {
        self.lock().assets.remove(key);
    }

    pub fn contents(&self, key: &str) -> Option<String> {
        self.lock()
            .assets
            .get(key)
            .map(|contents| String::from_utf8_lossy(contents).into_owned())
    }

    pub fn checksums(&self) -> Vec<Checksum> {
        self.lock()
            .assets
            .iter()
            .map(|(key, contents)| Checksum::new(key.clone(), compute_checksum(contents)))
            .collect()
    }

    /// The next `count` checksum fetches fail with a transient error.
    pub fn fail_checksum_fetches(&self, count: u32) {
        self.lock().failing_checksum_fetches = count;
    }

    /// The next `count` bulk uploads fail with a transient error.
    pub fn fail_uploads(&self, count: u32) {
        self.lock().failing_uploads = count;
    }

    /// Uploads of `key` are refused with a validation error.
    pub fn reject_uploads_of(&self, key: &str) {
        self.lock().rejected.insert(key.to_owned());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Every key that was part of an upload, once per upload.
    pub fn uploaded_keys(&self) -> Vec<Key> {
        self.calls()
            .into_iter()
            .flat_map(|call| match call {
                Call::Upload(keys) => keys,
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn downloaded_keys(&self) -> Vec<Key> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::FetchAsset(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn checksum_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == Call::FetchChecksums)
            .count()
    }
}

#[async_trait]
impl ThemeApi for FakeThemeApi {
    async fn fetch_checksums(&self, _theme_id: u64) -> Result<Vec<Checksum>, ApiError> {
        {
            let mut state = self.lock();
            state.calls.push(Call::FetchChecksums);
            if state.failing_checksum_fetches > 0 {
                state.failing_checksum_fetches -= 1;
                return Err(ApiError::Unavailable("connection reset".to_owned()));
            }
        }
        Ok(self.checksums())
    }

    async fn fetch_asset(&self, _theme_id: u64, key: &str) -> Result<ThemeAsset, ApiError> {
        let mut state = self.lock();
        state.calls.push(Call::FetchAsset(key.to_owned()));

        match state.assets.get(key) {
            Some(contents) => Ok(ThemeAsset::from_contents(
                key,
                contents,
                Some(compute_checksum(contents)),
            )),
            None => Err(ApiError::NotFound {
                key: key.to_owned(),
            }),
        }
    }

    async fn bulk_upload_assets(
        &self,
        _theme_id: u64,
        assets: Vec<ThemeAsset>,
    ) -> Result<Vec<UploadResult>, ApiError> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::Upload(assets.iter().map(|a| a.key.clone()).collect()));
        if state.failing_uploads > 0 {
            state.failing_uploads -= 1;
            return Err(ApiError::Unavailable("connection reset".to_owned()));
        }

        let mut results = Vec::new();
        for asset in assets {
            if state.rejected.contains(&asset.key) {
                results.push(UploadResult {
                    key: asset.key,
                    success: false,
                    checksum: None,
                    errors: vec!["Liquid syntax error: Unknown tag 'endfor'".to_owned()],
                });
                continue;
            }

            let contents = asset.content_bytes()?;
            let checksum = compute_checksum(&contents);
            state.assets.insert(asset.key.clone(), contents);
            results.push(UploadResult {
                key: asset.key,
                success: true,
                checksum: Some(checksum),
                errors: Vec::new(),
            });
        }

        Ok(results)
    }

    async fn delete_asset(&self, _theme_id: u64, key: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.calls.push(Call::Delete(key.to_owned()));
        match state.assets.remove(key) {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound {
                key: key.to_owned(),
            }),
        }
    }
}

/// A running session plus handles to both replicas.
pub struct TestTheme {
    pub disk: InMemoryFs,
    pub api: Arc<FakeThemeApi>,
    pub session: DevSession,
}

impl TestTheme {
    /// Simulates an editor saving a file.
    pub fn save(&self, key: &str, contents: &str) {
        self.disk.load_file(format!("{ROOT}/{key}"), contents);
    }

    pub fn remove(&self, key: &str) {
        self.disk.unload_file(format!("{ROOT}/{key}"));
    }

    /// Contents on disk, bypassing the session's index.
    pub fn on_disk(&self, key: &str) -> Option<String> {
        let mut disk = self.disk.clone();
        disk.read(Path::new(&format!("{ROOT}/{key}")))
            .ok()
            .map(|contents| String::from_utf8_lossy(&contents).into_owned())
    }
}

pub fn options(configure: impl FnOnce(&mut DevOptions)) -> DevOptions {
    let cli = CliOverrides {
        store: Some("my-shop.myshopify.com".to_owned()),
        theme: Some(THEME_ID),
        password: Some("shpat_test".to_owned()),
        poll_interval: Some(Duration::from_millis(20)),
        ..CliOverrides::default()
    };

    let mut options = DevOptions::resolve(Path::new(ROOT), cli, ConfigFile::default(), Vec::new())
        .expect("test options are valid");
    options.debounce = Duration::from_millis(10);
    configure(&mut options);
    options
}

pub async fn start(
    local: &[(&str, &str)],
    api: Arc<FakeThemeApi>,
    configure: impl FnOnce(&mut DevOptions),
) -> TestTheme {
    let _ = env_logger::try_init();

    let disk = InMemoryFs::new();
    let mut backend = disk.clone();
    backend.create_dir_all(Path::new(ROOT)).unwrap();
    for (key, contents) in local {
        disk.load_file(format!("{ROOT}/{key}"), contents);
    }

    let session = DevSession::start(
        options(configure),
        Arc::clone(&api) as Arc<dyn ThemeApi>,
        Arc::new(Vfs::new(disk.clone())),
        None,
    )
    .await
    .expect("dev session starts");

    TestTheme { disk, api, session }
}

/// Waits up to two seconds for `condition` to hold.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Gives debounce windows, polls and uploads time to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}
