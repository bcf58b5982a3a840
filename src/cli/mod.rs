//! Defines themesync's CLI through clap types.

mod dev;

use std::{
    borrow::Cow,
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use thiserror::Error;

pub use self::dev::DevCommand;

/// Command line options that themesync accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "themesync", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Dev(subcommand) => subcommand.run(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    Dev(DevCommand),
}

impl Subcommand {
    /// The theme directory this invocation works on, if any.
    pub fn project_path(&self) -> Option<&Path> {
        match self {
            Subcommand::Dev(cmd) => Some(&cmd.path),
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Dev(_) => "dev",
        }
    }
}

pub fn resolve_path(path: &Path) -> Cow<'_, Path> {
    if path.is_absolute() {
        Cow::Borrowed(path)
    } else {
        match env::current_dir() {
            Ok(current) => Cow::Owned(current.join(path)),
            Err(_) => Cow::Borrowed(path),
        }
    }
}

/// Resolves a theme path to an absolute directory, using the working
/// directory for an empty path.
pub fn resolve_project_dir(project_path: &Path) -> PathBuf {
    if project_path.as_os_str().is_empty() {
        return env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    resolve_path(project_path).into_owned()
}
