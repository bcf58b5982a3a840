pub mod cli;

pub mod admin_api;
pub mod checksum;
pub mod config;
pub mod dev_session;
pub mod glob;
pub mod hot_reload;
pub mod logging;
pub mod poller;
pub mod reconciler;
pub mod theme_api;
pub mod theme_fs;
pub mod uploader;
pub mod web;

pub use checksum::{Checksum, Key};
pub use config::DevOptions;
pub use dev_session::{DevSession, DevSessionError};
pub use theme_api::{AdminSession, ApiError, ThemeApi, ThemeAsset};
