//! Options for a dev session, merged from the command line, the theme's
//! `themesync.toml` and built-in defaults, in that order of precedence.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::glob::{read_ignore_file, FileFilter, FilterError};
use crate::hot_reload::LiveReload;

pub const CONFIG_FILE_NAME: &str = "themesync.toml";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9292;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not valid", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for {field}: {value:?}")]
    Duration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid host {0:?}")]
    Host(String),

    #[error("no {0} given; pass it on the command line or set it in {CONFIG_FILE_NAME}")]
    Missing(&'static str),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// The on-disk config file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub store: Option<String>,
    pub theme: Option<u64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Human-readable duration, e.g. `"3s"`.
    pub poll_interval: Option<String>,
    pub debounce: Option<String>,
    pub live_reload: Option<LiveReload>,
    pub nodelete: Option<bool>,
    pub ignore: Vec<String>,
    pub only: Vec<String>,
    /// Read by the logging setup before anything else runs.
    pub file_log_level: Option<String>,
}

impl ConfigFile {
    /// Loads `themesync.toml` from `theme_root`. A missing file is empty.
    pub fn load(theme_root: &Path) -> Result<Self, ConfigError> {
        let path = theme_root.join(CONFIG_FILE_NAME);
        let contents = match fs_err::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

/// What the command line asked for. `None` and empty mean "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub store: Option<String>,
    pub theme: Option<u64>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub poll_interval: Option<Duration>,
    pub live_reload: Option<LiveReload>,
    pub nodelete: bool,
    pub ignore: Vec<String>,
    pub only: Vec<String>,
    pub open: bool,
}

/// Fully resolved settings for one dev session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevOptions {
    pub theme_root: PathBuf,
    pub store: String,
    pub theme_id: u64,
    pub password: String,
    pub host: IpAddr,
    pub port: u16,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub live_reload: LiveReload,
    pub no_delete: bool,
    pub ignore: Vec<String>,
    pub only: Vec<String>,
    pub open: bool,
}

impl DevOptions {
    /// Reads the config file and ignore file under `theme_root` and merges
    /// them with `cli`.
    pub fn load(theme_root: &Path, cli: CliOverrides) -> Result<Self, ConfigError> {
        let file = ConfigFile::load(theme_root)?;
        let ignore_file = read_ignore_file(theme_root).map_err(|source| ConfigError::Read {
            path: theme_root.join(crate::glob::IGNORE_FILE_NAME),
            source,
        })?;

        Self::resolve(theme_root, cli, file, ignore_file)
    }

    pub fn resolve(
        theme_root: &Path,
        cli: CliOverrides,
        file: ConfigFile,
        ignore_file: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let store = cli.store.or(file.store).ok_or(ConfigError::Missing("store"))?;
        let theme_id = cli.theme.or(file.theme).ok_or(ConfigError::Missing("theme"))?;
        let password = cli.password.ok_or(ConfigError::Missing("password"))?;

        let host = cli
            .host
            .or(file.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let host = host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::Host(host.clone()))?;

        let poll_interval = match cli.poll_interval {
            Some(interval) => interval,
            None => parse_duration("poll_interval", file.poll_interval)?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        };
        let debounce = parse_duration("debounce", file.debounce)?.unwrap_or(DEFAULT_DEBOUNCE);

        // Command line patterns replace the file's; the ignore file always
        // adds to whichever list won.
        let mut ignore = if cli.ignore.is_empty() {
            file.ignore
        } else {
            cli.ignore
        };
        ignore.extend(ignore_file);

        let only = if cli.only.is_empty() {
            file.only
        } else {
            cli.only
        };

        Ok(Self {
            theme_root: theme_root.to_path_buf(),
            store,
            theme_id,
            password,
            host,
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            poll_interval,
            debounce,
            live_reload: cli.live_reload.or(file.live_reload).unwrap_or_default(),
            no_delete: cli.nodelete || file.nodelete.unwrap_or(false),
            ignore,
            only,
            open: cli.open,
        })
    }

    pub fn file_filter(&self) -> Result<FileFilter, FilterError> {
        FileFilter::new(&self.ignore, &self.only)
    }

    /// Origin the browser uses to reach the dev server.
    pub fn local_origin(&self) -> String {
        match self.host {
            IpAddr::V6(host) => format!("http://[{host}]:{}", self.port),
            IpAddr::V4(host) => format!("http://{host}:{}", self.port),
        }
    }
}

fn parse_duration(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            humantime::parse_duration(&value).map_err(|source| ConfigError::Duration {
                field,
                value,
                source,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cli() -> CliOverrides {
        CliOverrides {
            store: Some("my-shop.myshopify.com".into()),
            theme: Some(42),
            password: Some("shpat_x".into()),
            ..CliOverrides::default()
        }
    }

    #[test]
    fn defaults_fill_in_the_rest() {
        let options =
            DevOptions::resolve(Path::new("/theme"), cli(), ConfigFile::default(), vec![]).unwrap();

        assert_eq!(options.host, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(options.port, DEFAULT_PORT);
        assert_eq!(options.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(options.debounce, DEFAULT_DEBOUNCE);
        assert_eq!(options.live_reload, LiveReload::HotReload);
        assert!(!options.no_delete);
        assert_eq!(options.local_origin(), "http://127.0.0.1:9292");
    }

    #[test]
    fn command_line_beats_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            store = "other.myshopify.com"
            port = 8080
            poll_interval = "10s"
            debounce = "100ms"
            live_reload = "full-page"
            ignore = ["assets/*.map"]
            "#,
        )
        .unwrap();

        let overrides = CliOverrides {
            port: Some(9000),
            ignore: vec!["snippets/*".into()],
            ..cli()
        };
        let options = DevOptions::resolve(
            Path::new("/theme"),
            overrides,
            file,
            vec!["config/settings_data.json".into()],
        )
        .unwrap();

        assert_eq!(options.store, "my-shop.myshopify.com");
        assert_eq!(options.port, 9000);
        assert_eq!(options.poll_interval, Duration::from_secs(10));
        assert_eq!(options.debounce, Duration::from_millis(100));
        assert_eq!(options.live_reload, LiveReload::FullPage);
        assert_eq!(
            options.ignore,
            vec!["snippets/*".to_owned(), "config/settings_data.json".to_owned()]
        );
    }

    #[test]
    fn missing_store_is_reported() {
        let overrides = CliOverrides {
            store: None,
            ..cli()
        };
        let err = DevOptions::resolve(Path::new("/theme"), overrides, ConfigFile::default(), vec![])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("store")));
    }

    #[test]
    fn bad_durations_and_unknown_keys_are_errors() {
        let file = ConfigFile {
            poll_interval: Some("soon".into()),
            ..ConfigFile::default()
        };
        let err = DevOptions::resolve(Path::new("/theme"), cli(), file, vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::Duration { field: "poll_interval", .. }));

        assert!(toml::from_str::<ConfigFile>("colour = \"red\"").is_err());
    }

    #[test]
    fn loads_files_from_theme_root() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(
            dir.path().join(CONFIG_FILE_NAME),
            "theme = 7\nnodelete = true\n",
        )
        .unwrap();
        fs_err::write(
            dir.path().join(crate::glob::IGNORE_FILE_NAME),
            "# generated\nassets/*.map\n",
        )
        .unwrap();

        let overrides = CliOverrides {
            theme: None,
            ..cli()
        };
        let options = DevOptions::load(dir.path(), overrides).unwrap();

        assert_eq!(options.theme_id, 7);
        assert!(options.no_delete);
        assert_eq!(options.ignore, vec!["assets/*.map".to_owned()]);
    }

    #[test]
    fn missing_config_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ConfigFile::load(dir.path()).unwrap(), ConfigFile::default());
    }
}
