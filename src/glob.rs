//! Decides which keys take part in syncing.
//!
//! One `FileFilter` is built per dev session and shared by the watcher, the
//! reconciler and the proxy, so a key hidden from one of them is hidden from
//! all of them.

use std::io;
use std::path::Path;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use thiserror::Error;

/// Name of the per-theme ignore file, one pattern per line.
pub const IGNORE_FILE_NAME: &str = ".shopifyignore";

/// Paths that are never theme content, whatever the user configured.
const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "**/.git",
    "**/.vscode",
    "**/.hg",
    "**/.bzr",
    "**/.svn",
    "**/_darcs",
    "**/CVS",
    "**/*.sublime-{project,workspace}",
    "**/.DS_Store",
    "**/.sass-cache",
    "**/Thumbs.db",
    "**/desktop.ini",
    "**/config.yml",
    "**/node_modules",
    ".prettierrc.json",
];

/// The directories a theme is made of and the files each one may hold.
const THEME_LAYOUT_PATTERNS: &[&str] = &[
    "assets/**/*.*",
    "config/**/*.json",
    "layout/**/*.liquid",
    "locales/**/*.json",
    "sections/**/*.{liquid,json}",
    "blocks/**/*.liquid",
    "snippets/**/*.liquid",
    "templates/**/*.{liquid,json}",
];

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid glob pattern '{pattern}'")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("invalid regex pattern '{pattern}'")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// User patterns: globs where `*` also crosses `/`, plus `/regex/` entries.
#[derive(Debug, Clone)]
struct PatternSet {
    globs: GlobSet,
    regexes: Vec<Regex>,
    len: usize,
}

impl PatternSet {
    fn empty() -> Self {
        Self {
            globs: GlobSet::empty(),
            regexes: Vec::new(),
            len: 0,
        }
    }

    fn new(patterns: &[String]) -> Result<Self, FilterError> {
        let mut builder = GlobSetBuilder::new();
        let mut regexes = Vec::new();

        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }

            if let Some(inner) = regex_body(pattern) {
                let regex = Regex::new(inner).map_err(|source| FilterError::Regex {
                    pattern: pattern.to_owned(),
                    source,
                })?;
                regexes.push(regex);
                continue;
            }

            // `dir/` means everything below `dir`.
            let normalized = match pattern.strip_suffix('/') {
                Some(dir) => format!("{dir}/**"),
                None => pattern.to_owned(),
            };

            let glob = Glob::new(&normalized).map_err(|source| FilterError::Glob {
                pattern: pattern.to_owned(),
                source,
            })?;
            builder.add(glob);
        }

        let globs = builder.build().map_err(|source| FilterError::Glob {
            pattern: patterns.join(", "),
            source,
        })?;

        Ok(Self {
            len: globs.len() + regexes.len(),
            globs,
            regexes,
        })
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn matches(&self, key: &str) -> bool {
        self.globs.is_match(key) || self.regexes.iter().any(|regex| regex.is_match(key))
    }
}

fn regex_body(pattern: &str) -> Option<&str> {
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        Some(&pattern[1..pattern.len() - 1])
    } else {
        None
    }
}

fn literal_separator_set(patterns: &[&str]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // The built-in pattern lists are constants and known to be valid.
        if let Ok(glob) = GlobBuilder::new(pattern).literal_separator(true).build() {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Returns whether `key` has a place in the theme directory layout.
pub fn is_theme_file(key: &str) -> bool {
    thread_local! {
        static LAYOUT: GlobSet = literal_separator_set(THEME_LAYOUT_PATTERNS);
    }
    LAYOUT.with(|layout| layout.is_match(key))
}

/// Assets that are served as-is, without Liquid rendering on the platform.
pub fn is_static_asset(key: &str) -> bool {
    key.starts_with("assets/") && !key.ends_with(".liquid")
}

fn is_default_ignored(key: &str) -> bool {
    thread_local! {
        static DEFAULTS: GlobSet = literal_separator_set(DEFAULT_IGNORE_PATTERNS);
    }

    DEFAULTS.with(|defaults| {
        // A match on any ancestor hides the whole subtree.
        let mut end = 0;
        for part in key.split('/') {
            end += part.len();
            if defaults.is_match(&key[..end]) {
                return true;
            }
            end += 1;
        }
        false
    })
}

#[derive(Debug, Clone)]
pub struct FileFilter {
    ignore: PatternSet,
    only: PatternSet,
}

impl FileFilter {
    pub fn new(ignore: &[String], only: &[String]) -> Result<Self, FilterError> {
        Ok(Self {
            ignore: PatternSet::new(ignore)?,
            only: PatternSet::new(only)?,
        })
    }

    /// A filter with no user patterns. The theme layout and default ignore
    /// list still apply.
    pub fn allow_all() -> Self {
        Self {
            ignore: PatternSet::empty(),
            only: PatternSet::empty(),
        }
    }

    /// Whether `key` takes part in syncing, serving and hot reloading.
    pub fn accepts(&self, key: &str) -> bool {
        if !is_theme_file(key) || is_default_ignored(key) {
            return false;
        }

        if !self.only.is_empty() && !self.only.matches(key) {
            return false;
        }

        !self.ignore.matches(key)
    }
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// Reads the patterns listed in the theme's ignore file. Blank lines and
/// `#` comments are skipped. A missing file yields no patterns.
pub fn read_ignore_file(root: &Path) -> io::Result<Vec<String>> {
    let path = root.join(IGNORE_FILE_NAME);
    let contents = match fs_err::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEYS: &[&str] = &[
        "assets/basic.css",
        "assets/complex.css",
        "assets/image.png",
        "config/settings_data.json",
        "config/settings_schema.json",
        "sections/announcement-bar.liquid",
        "templates/404.json",
        "templates/customers/account.json",
    ];

    fn accepted(filter: &FileFilter) -> Vec<&'static str> {
        KEYS.iter().copied().filter(|key| filter.accepts(key)).collect()
    }

    fn strings(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn layout_rejects_files_outside_theme_directories() {
        assert!(is_theme_file("layout/theme.liquid"));
        assert!(is_theme_file("templates/customers/account.json"));
        assert!(is_theme_file("assets/fonts/inter.woff2"));
        assert!(!is_theme_file("README.md"));
        assert!(!is_theme_file("layout/theme.json"));
        assert!(!is_theme_file("snippets/card.json"));
        assert!(!is_theme_file(".themesync/logs/themesync-dev.log"));
    }

    #[test]
    fn default_ignores_apply_to_nested_paths() {
        let filter = FileFilter::allow_all();

        assert!(!filter.accepts("assets/Thumbs.db"));
        assert!(!filter.accepts("assets/node_modules/lib/index.js"));
        assert!(!filter.accepts("assets/.git/hooks.js"));
        assert!(filter.accepts("assets/git.js"));
    }

    #[test]
    fn ignore_star_crosses_directories() {
        let filter = FileFilter::new(&strings(&["*.css"]), &[]).unwrap();

        assert_eq!(
            accepted(&filter),
            vec![
                "assets/image.png",
                "config/settings_data.json",
                "config/settings_schema.json",
                "sections/announcement-bar.liquid",
                "templates/404.json",
                "templates/customers/account.json",
            ]
        );
    }

    #[test]
    fn ignore_specific_files_and_directories() {
        let filter =
            FileFilter::new(&strings(&["config/*", "templates/*", "assets/image.png"]), &[])
                .unwrap();

        assert_eq!(
            accepted(&filter),
            vec![
                "assets/basic.css",
                "assets/complex.css",
                "sections/announcement-bar.liquid",
            ]
        );
    }

    #[test]
    fn only_restricts_to_matches() {
        let filter = FileFilter::new(&[], &strings(&["config/*", "assets/image.png"])).unwrap();

        assert_eq!(
            accepted(&filter),
            vec![
                "assets/image.png",
                "config/settings_data.json",
                "config/settings_schema.json",
            ]
        );
    }

    #[test]
    fn ignore_wins_over_only() {
        let filter = FileFilter::new(
            &strings(&["templates/customers/"]),
            &strings(&["templates/*.json"]),
        )
        .unwrap();

        assert_eq!(accepted(&filter), vec!["templates/404.json"]);
    }

    #[test]
    fn regex_patterns() {
        let filter = FileFilter::new(&strings(&[r"/\.(css|png)$/"]), &[]).unwrap();

        assert!(!filter.accepts("assets/basic.css"));
        assert!(!filter.accepts("assets/image.png"));
        assert!(filter.accepts("layout/theme.liquid"));
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let err = FileFilter::new(&strings(&["/([a-z/"]), &[]).unwrap_err();
        assert!(matches!(err, FilterError::Regex { .. }));
    }

    #[test]
    fn ignore_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(IGNORE_FILE_NAME),
            "# generated assets\nassets/*.map\n\n  config/settings_data.json  \n",
        )
        .unwrap();

        assert_eq!(
            read_ignore_file(dir.path()).unwrap(),
            vec!["assets/*.map", "config/settings_data.json"]
        );
    }

    #[test]
    fn missing_ignore_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_ignore_file(dir.path()).unwrap().is_empty());
    }
}
