use std::{
    io::{self, IsTerminal, Write},
    path::Path,
};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::cli::ColorChoice;
use crate::config::CONFIG_FILE_NAME;

/// Directory under the theme root that holds everything themesync writes
/// for itself. Never synced.
pub const STATE_DIR_NAME: &str = ".themesync";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(
    verbosity: u8,
    color: ColorChoice,
    theme_dir: Option<&Path>,
    file_log_level: Option<LevelFilter>,
    command_name: &str,
) -> LogGuard {
    if let Err(err) = tracing_log::LogTracer::init() {
        eprintln!("Warning: could not forward log records to tracing: {err}");
    }

    let console_filter = match verbosity {
        0 => "info",
        1 => "info,libthemesync=debug,memofs=debug",
        2 => "info,libthemesync=trace,memofs=trace",
        _ => "trace",
    };

    let console_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_filter));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .without_time()
        .with_target(false)
        .with_thread_names(false)
        .with_level(true)
        .with_filter(console_env_filter);

    let mut file_guard: Option<tracing_appender::non_blocking::WorkerGuard> = None;

    let file_layer = if let (Some(dir), Some(level)) = (theme_dir, file_log_level) {
        let log_dir = dir.join(STATE_DIR_NAME).join("logs");

        let appender = std::fs::create_dir_all(&log_dir)
            .map_err(|err| err.to_string())
            .and_then(|()| {
                compress_old_logs(&log_dir, command_name);

                tracing_appender::rolling::Builder::new()
                    .rotation(tracing_appender::rolling::Rotation::DAILY)
                    .filename_prefix(command_name)
                    .filename_suffix("log")
                    .build(&log_dir)
                    .map_err(|err| err.to_string())
            });

        match appender {
            Ok(file_appender) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                file_guard = Some(guard);

                let file_filter = EnvFilter::new(level.to_string());

                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_target(true)
                    .with_thread_names(true)
                    .with_level(true)
                    .with_filter(file_filter);

                Some(layer)
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not create log directory {}: {e}",
                    log_dir.display()
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

/// Gzips this command's logs from previous days and removes archives older
/// than a week.
fn compress_old_logs(log_dir: &Path, command_name: &str) {
    let today = {
        let now = std::time::SystemTime::now();
        let since_epoch = now
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        since_epoch.as_secs() / 86400
    };

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_owned(),
            None => continue,
        };

        if file_name.ends_with(".log.gz") {
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    let age_days = modified
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| today.saturating_sub(d.as_secs() / 86400))
                        .unwrap_or(0);
                    if age_days > 7 {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
            continue;
        }

        if !file_name.ends_with(".log") || !file_name.starts_with(command_name) {
            continue;
        }

        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                let file_days = modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() / 86400)
                    .unwrap_or(today);
                if file_days >= today {
                    continue;
                }
            }
        }

        let gz_path = path.with_extension("log.gz");
        if let Ok(input) = std::fs::read(&path) {
            let gz_file = match std::fs::File::create(&gz_path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut encoder =
                flate2::write::GzEncoder::new(gz_file, flate2::Compression::default());
            if encoder.write_all(&input).is_ok() && encoder.finish().is_ok() {
                let _ = std::fs::remove_file(&path);
            } else {
                let _ = std::fs::remove_file(&gz_path);
            }
        }
    }
}

/// Lightweight pre-read of `themesync.toml` to extract `file_log_level`
/// before logging is set up. The full config is loaded later, once errors can
/// be reported.
///
/// Returns `None` if there is no config or the field is absent (caller
/// defaults to trace). Returns `Some(None)` for `"none"`/`"off"`.
pub fn quick_read_file_log_level(theme_dir: &Path) -> Option<Option<LevelFilter>> {
    let contents = std::fs::read_to_string(theme_dir.join(CONFIG_FILE_NAME)).ok()?;
    let table: toml::Table = toml::from_str(&contents).ok()?;
    let level_str = table.get("file_log_level")?.as_str()?;

    Some(parse_level(level_str))
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "none" | "off" => None,
        "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write_config(dir: &Path, contents: &str) {
        std::fs::write(dir.join(CONFIG_FILE_NAME), contents).unwrap();
    }

    #[test]
    fn quick_read_file_log_level_warn() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "store = \"a.myshopify.com\"\nfile_log_level = \"warn\"\n");

        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::WARN)));
    }

    #[test]
    fn quick_read_file_log_level_off_and_none_disable() {
        let dir = tempfile::tempdir().unwrap();

        write_config(dir.path(), "file_log_level = \"off\"\n");
        assert_eq!(quick_read_file_log_level(dir.path()), Some(None));

        write_config(dir.path(), "file_log_level = \"none\"\n");
        assert_eq!(quick_read_file_log_level(dir.path()), Some(None));
    }

    #[test]
    fn quick_read_file_log_level_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "file_log_level = \"DEBUG\"\n");

        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::DEBUG)));
    }

    #[test]
    fn quick_read_file_log_level_absent() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "port = 9393\n");

        assert_eq!(quick_read_file_log_level(dir.path()), None);
    }

    #[test]
    fn quick_read_file_log_level_no_config() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(quick_read_file_log_level(dir.path()), None);
    }

    #[test]
    fn quick_read_file_log_level_unknown_defaults_to_trace() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "file_log_level = \"banana\"\n");

        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::TRACE)));
    }

    #[test]
    fn compress_old_logs_compresses_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let old_file = log_dir.join("themesync-dev.2020-01-01.log");
        std::fs::write(&old_file, "old log content").unwrap();

        let mtime =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86400 * 18262);
        filetime::set_file_mtime(&old_file, filetime::FileTime::from_system_time(mtime))
            .unwrap_or_default();

        compress_old_logs(log_dir, "themesync-dev");

        assert!(!old_file.exists(), "original .log file should be deleted");
        let gz_file = log_dir.join("themesync-dev.2020-01-01.log.gz");
        assert!(gz_file.exists(), ".log.gz file should be created");

        let gz_data = std::fs::read(&gz_file).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&gz_data[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "old log content");
    }

    #[test]
    fn compress_old_logs_skips_other_commands() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let other_file = log_dir.join("other-tool.2020-01-01.log");
        std::fs::write(&other_file, "unrelated").unwrap();

        let mtime =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86400 * 18262);
        filetime::set_file_mtime(&other_file, filetime::FileTime::from_system_time(mtime))
            .unwrap_or_default();

        compress_old_logs(log_dir, "themesync-dev");

        assert!(other_file.exists(), "foreign logs should NOT be compressed");
    }

    #[test]
    fn compress_old_logs_skips_today() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let today_file = log_dir.join("themesync-dev.today.log");
        std::fs::write(&today_file, "today's log").unwrap();

        compress_old_logs(log_dir, "themesync-dev");

        assert!(today_file.exists(), "today's log should NOT be compressed");
    }
}
