use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use client_core::SyncConfig;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "desktop.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub user_id: String,
    pub history_page_size: u32,
    pub event_capacity: usize,
    /// Channel joined on startup.
    pub channel: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            user_id: "guest".into(),
            history_page_size: sync.history_page_size,
            event_capacity: sync.event_capacity,
            channel: None,
        }
    }
}

impl Settings {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            history_page_size: self.history_page_size,
            event_capacity: self.event_capacity,
        }
        .normalized()
    }
}

/// Defaults, then the TOML file, then `APP__*` environment variables.
///
/// A missing default file is fine; a missing explicit `path` is an error.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let file = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut settings = match fs::read_to_string(&file) {
        Ok(raw) => toml::from_str::<Settings>(&raw)
            .with_context(|| format!("invalid config file '{}'", file.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound && path.is_none() => Settings::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config '{}'", file.display()))
        }
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__USER_ID") {
        settings.user_id = v;
    }
    if let Some(v) = lookup("APP__CHANNEL") {
        settings.channel = Some(v);
    }
    if let Some(v) = lookup("APP__HISTORY_PAGE_SIZE") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.history_page_size = parsed,
            Err(err) => warn!(value = %v, "config: ignoring APP__HISTORY_PAGE_SIZE: {err}"),
        }
    }
}

/// Turns a bare path into a `sqlite://` url; other urls pass through.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
